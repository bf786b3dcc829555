use crate::ai_client::GenerativeModel;
use crate::auth::TokenSigner;
use crate::config::Config;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Everything a handler needs, passed explicitly through axum's `State`.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub ai: Arc<dyn GenerativeModel>,
    pub tokens: TokenSigner,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: SqlitePool, ai: Arc<dyn GenerativeModel>, config: Config) -> Self {
        let tokens = TokenSigner::new(&config.secret_key, config.token_ttl);
        Self {
            db,
            ai,
            tokens,
            config: Arc::new(config),
        }
    }
}
