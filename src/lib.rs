pub mod ai_client;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod normalize;
pub mod prompts;
pub mod routes;
pub mod state;

use ai_client::{GeminiClient, GenerativeModel, MockAiClient};
use config::Config;
use std::sync::Arc;

pub async fn build_state(config: Config) -> anyhow::Result<state::AppState> {
    let ai: Arc<dyn GenerativeModel> = if let Some(real) = GeminiClient::from_config(&config) {
        Arc::new(real)
    } else {
        tracing::warn!("GEMINI_API_KEY is not set, AI endpoints answer from the offline mock");
        Arc::new(MockAiClient)
    };
    build_state_with(config, ai).await
}

/// Same as [`build_state`] with an explicit model, used by tests.
pub async fn build_state_with(
    config: Config,
    ai: Arc<dyn GenerativeModel>,
) -> anyhow::Result<state::AppState> {
    let db = db::connect(&config.database_url).await?;
    Ok(state::AppState::new(db, ai, config))
}
