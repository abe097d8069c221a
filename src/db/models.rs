use serde::{Deserialize, Serialize};

/// Post kinds, one per supported microformat flavor. The kind of an entry is
/// fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    Note,
    Article,
    Reply,
    Bookmark,
    Checkin,
    Like,
}

impl PostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostKind::Note => "note",
            PostKind::Article => "article",
            PostKind::Reply => "reply",
            PostKind::Bookmark => "bookmark",
            PostKind::Checkin => "checkin",
            PostKind::Like => "like",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "note" => Some(PostKind::Note),
            "article" => Some(PostKind::Article),
            "reply" => Some(PostKind::Reply),
            "bookmark" => Some(PostKind::Bookmark),
            "checkin" => Some(PostKind::Checkin),
            "like" => Some(PostKind::Like),
            _ => None,
        }
    }
}

/// Post statuses from the Micropub post-status extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Published,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Published => "published",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(PostStatus::Draft),
            "published" => Some(PostStatus::Published),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
    Unlisted,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
            Visibility::Unlisted => "unlisted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Visibility::Public),
            "private" => Some(Visibility::Private),
            "unlisted" => Some(Visibility::Unlisted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub author_id: String,
    pub kind: PostKind,
    pub status: PostStatus,
    pub visibility: Visibility,
    pub title: String,
    pub content: String,
    pub summary: String,
    pub published_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub entry_id: String,
    pub in_reply_to: String,
    pub title: String,
    pub quote: String,
    pub author: String,
    pub author_url: String,
    pub author_photo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    pub entry_id: String,
    pub bookmark_of: String,
    pub title: String,
    pub quote: String,
    pub author: String,
    pub author_url: String,
    pub author_photo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub entry_id: String,
    pub street_address: String,
    pub locality: String,
    pub region: String,
    pub country_name: String,
    pub postal_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    /// Human-readable one-liner, falling back to the raw point.
    pub fn summary(&self) -> String {
        let named: Vec<&str> = [
            self.locality.as_str(),
            self.region.as_str(),
            self.country_name.as_str(),
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
        if named.is_empty() {
            format!("{},{}", self.latitude, self.longitude)
        } else {
            named.join(", ")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkin {
    pub entry_id: String,
    pub name: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Syndication {
    pub id: String,
    pub entry_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub path: String,
    pub mime_type: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebmentionSend {
    pub id: String,
    pub entry_id: String,
    pub target: String,
    pub sent_at: String,
    pub success: bool,
    pub response_body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingWebmention {
    pub id: String,
    pub source: String,
    pub response_to: String,
    pub response_body: String,
    pub reviewed: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebmentionModeration {
    pub id: String,
    pub webmention_id: String,
    pub entry_id: String,
    /// None = pending review, Some(true/false) = decided.
    pub approval_status: Option<bool>,
    pub comment_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub user_id: String,
    pub auth_code: String,
    pub key: String,
    pub client_id: String,
    pub exchanged_at: Option<String>,
    pub created_at: String,
}
