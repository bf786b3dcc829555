use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_TTS_BASE_URL: &str = "https://texttospeech.googleapis.com/v1";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Process configuration, read once at start and shared through `AppState`.
#[derive(Debug, Clone)]
pub struct Config {
    pub secret_key: String,
    pub database_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub tts_base_url: String,
    pub ai_timeout: Duration,
    pub token_ttl: Duration,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let secret_key = non_empty_var("SECRET_KEY").unwrap_or_else(|| {
            warn!("SECRET_KEY is not set, tokens will not survive a restart");
            random_secret()
        });
        let database_url =
            non_empty_var("DATABASE_URL").unwrap_or_else(|| "sqlite://app.db".to_string());
        let gemini_api_key = non_empty_var("GEMINI_API_KEY");
        let gemini_model =
            non_empty_var("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string());
        let gemini_base_url = non_empty_var("GEMINI_BASE_URL")
            .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let tts_base_url = non_empty_var("TTS_BASE_URL")
            .unwrap_or_else(|| DEFAULT_TTS_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let ai_timeout_secs = parsed_var("AI_TIMEOUT_SECS").unwrap_or(30);
        let token_ttl_minutes = parsed_var("TOKEN_TTL_MINUTES").unwrap_or(60);
        let host = non_empty_var("BACKEND_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parsed_var("BACKEND_PORT").unwrap_or(5000);
        let cors_origins = non_empty_var("CORS_ORIGINS")
            .unwrap_or_else(|| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            secret_key,
            database_url,
            gemini_api_key,
            gemini_model,
            gemini_base_url,
            tts_base_url,
            ai_timeout: Duration::from_secs(ai_timeout_secs),
            token_ttl: Duration::from_secs(token_ttl_minutes * 60),
            host,
            port,
            cors_origins,
        }
    }

    /// Settings for tests and embedded use: in-memory store, no AI key.
    pub fn for_tests() -> Self {
        Self {
            secret_key: random_secret(),
            database_url: "sqlite::memory:".to_string(),
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            tts_base_url: DEFAULT_TTS_BASE_URL.to_string(),
            ai_timeout: Duration::from_secs(5),
            token_ttl: Duration::from_secs(3600),
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = non_empty_var(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparsable {}={}", name, raw);
            None
        }
    }
}

fn random_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}
