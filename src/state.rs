use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::Config;

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Config,
    /// Shared client for all outbound fetches. Built with a bounded timeout
    /// so a hung remote endpoint cannot hang a publishing request.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(db: DbPool, config: Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.webmention.timeout_secs))
            .user_agent("tanzawa-webmention")
            .build()
            .expect("Failed to build HTTP client");
        Self { db, config, http }
    }
}
