//! Media handling for Micropub posts: uploaded files, embedded base64
//! images, and the attachment markup appended to entry content.

use std::path::Path;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;
use rusqlite::params;

use crate::db::models::FileRecord;
use crate::error::{AppError, AppResult};
use crate::state::DbPool;

fn data_uri_img_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)<img[^>]*src\s*=\s*["']data:(image/[a-z0-9.+-]+);base64,([A-Za-z0-9+/=\s]*)["'][^>]*>"#,
        )
        .expect("valid regex")
    })
}

/// Persist raw bytes as a stored file: written under the uploads directory
/// and recorded in the files table.
pub fn save_file(
    pool: &DbPool,
    uploads_dir: &Path,
    bytes: &[u8],
    mime_type: &str,
) -> AppResult<FileRecord> {
    let id = uuid::Uuid::now_v7().to_string();
    let extension = mime_guess::get_mime_extensions_str(mime_type)
        .and_then(|exts| exts.first())
        .unwrap_or(&"bin");
    let filename = format!("{}.{}", id, extension);

    std::fs::create_dir_all(uploads_dir)
        .map_err(|e| AppError::Internal(format!("Failed to create uploads dir: {}", e)))?;
    let path = uploads_dir.join(&filename);
    std::fs::write(&path, bytes)
        .map_err(|e| AppError::Internal(format!("Failed to write upload: {}", e)))?;

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO files (id, path, mime_type) VALUES (?1, ?2, ?3)",
        params![id, filename, mime_type],
    )?;
    conn.query_row(
        "SELECT id, path, mime_type, created_at FROM files WHERE id = ?1",
        params![id],
        |row| {
            Ok(FileRecord {
                id: row.get(0)?,
                path: row.get(1)?,
                mime_type: row.get(2)?,
                created_at: row.get(3)?,
            })
        },
    )
    .map_err(AppError::from)
}

/// Markup appended to content for a stored attachment. Uses a site-relative
/// URL so attachment scanning recognizes it again on update.
pub fn render_attachment(file: &FileRecord) -> String {
    format!(
        r#"<figure class="attachment"><img src="/files/{}"></figure>"#,
        file.id
    )
}

/// Markup for a photo referenced by URL (a `photo` property value that is
/// not a data URI).
pub fn render_photo(url: &str) -> String {
    format!(r#"<img src="{}">"#, url)
}

/// Find `data:image/...;base64` images embedded in the content, store each
/// one, and replace its tag with regular attachment markup. Undecodable
/// images are left alone.
pub fn replace_base64_images(
    pool: &DbPool,
    uploads_dir: &Path,
    content: &str,
) -> AppResult<String> {
    let mut result = String::with_capacity(content.len());
    let mut last_end = 0;

    for captures in data_uri_img_re().captures_iter(content) {
        let whole = captures.get(0).expect("capture 0 always present");
        let mime_type = captures[1].to_lowercase();
        let encoded: String = captures[2].chars().filter(|c| !c.is_whitespace()).collect();

        let bytes = match BASE64.decode(encoded.as_bytes()) {
            Ok(b) => b,
            Err(_) => continue,
        };
        let file = save_file(pool, uploads_dir, &bytes, &mime_type)?;

        result.push_str(&content[last_end..whole.start()]);
        result.push_str(&render_attachment(&file));
        last_end = whole.end();
    }
    result.push_str(&content[last_end..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    // A 1x1 transparent GIF.
    const GIF_B64: &str = "R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7";

    #[test]
    fn save_file_writes_bytes_and_row() {
        let pool = test_pool();
        let tmp = tempfile::tempdir().unwrap();
        let file = save_file(&pool, tmp.path(), b"hello", "image/jpeg").unwrap();

        assert!(file.path.ends_with(".jpe") || file.path.ends_with(".jpg") || file.path.ends_with(".jpeg"));
        let on_disk = std::fs::read(tmp.path().join(&file.path)).unwrap();
        assert_eq!(on_disk, b"hello");

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn unknown_mime_gets_bin_extension() {
        let pool = test_pool();
        let tmp = tempfile::tempdir().unwrap();
        let file = save_file(&pool, tmp.path(), b"x", "application/x-nonsense").unwrap();
        assert!(file.path.ends_with(".bin"));
    }

    #[test]
    fn embedded_image_is_extracted_and_replaced() {
        let pool = test_pool();
        let tmp = tempfile::tempdir().unwrap();
        let content = format!(
            r#"<p>Look:</p><img src="data:image/gif;base64,{}"><p>after</p>"#,
            GIF_B64
        );

        let replaced = replace_base64_images(&pool, tmp.path(), &content).unwrap();
        assert!(!replaced.contains("base64"));
        assert!(replaced.contains(r#"<figure class="attachment"><img src="/files/"#));
        assert!(replaced.starts_with("<p>Look:</p>"));
        assert!(replaced.ends_with("<p>after</p>"));

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn content_without_images_is_unchanged() {
        let pool = test_pool();
        let tmp = tempfile::tempdir().unwrap();
        let content = "<p>No images here.</p>";
        assert_eq!(
            replace_base64_images(&pool, tmp.path(), content).unwrap(),
            content
        );
    }

    #[test]
    fn undecodable_image_is_left_alone() {
        let pool = test_pool();
        let tmp = tempfile::tempdir().unwrap();
        let content = r#"<img src="data:image/gif;base64,!!!not-base64!!!">"#;
        let replaced = replace_base64_images(&pool, tmp.path(), content).unwrap();
        assert_eq!(replaced, content);
    }

    #[test]
    fn render_attachment_points_at_files_route() {
        let file = FileRecord {
            id: "abc".into(),
            path: "abc.gif".into(),
            mime_type: "image/gif".into(),
            created_at: String::new(),
        };
        assert_eq!(
            render_attachment(&file),
            r#"<figure class="attachment"><img src="/files/abc"></figure>"#
        );
    }
}
