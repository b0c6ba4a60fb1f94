//! Process configuration, loaded once at startup from the environment
//! (with `.env` support via dotenvy, same as the rest of the server).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,

    /// Shared secret for HS256 session token verification.
    pub jwt_secret: String,

    /// Redis URL for the production Notifier binding. When unset, the
    /// server falls back to an in-process broadcaster (single-instance
    /// only, used in tests and local development).
    pub redis_url: Option<String>,

    pub ws_max_device_id_length: usize,
    pub ws_max_devices_per_save: i64,

    pub llm: LlmConfig,

    pub bind_addr: std::net::SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// "fake" for the synthetic echo generator, "openai" for a vendor call.
    pub mode: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    /// "responses", "chat_completions", or "auto" (try responses, fall
    /// back to chat_completions on 400/404/405).
    pub api: String,
    pub total_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/para".to_string());

        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "dev-secret-change-me".to_string());

        let redis_url = std::env::var("REDIS_URL").ok();

        let ws_max_device_id_length = env_parse("WS_MAX_DEVICE_ID_LENGTH", 200);
        let ws_max_devices_per_save = env_parse("WS_MAX_DEVICES_PER_SAVE", 8);

        let llm_total_timeout_secs: u64 = env_parse("LLM_TOTAL_TIMEOUT_SECONDS", 60);
        let llm_connect_timeout_secs = llm_total_timeout_secs.min(10);

        let llm = LlmConfig {
            mode: std::env::var("LLM_MODE").unwrap_or_else(|_| "fake".to_string()),
            base_url: std::env::var("LLM_BASE_URL").ok(),
            api_key: std::env::var("LLM_API_KEY").ok(),
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            api: std::env::var("LLM_API").unwrap_or_else(|_| "auto".to_string()),
            total_timeout: Duration::from_secs(llm_total_timeout_secs),
            connect_timeout: Duration::from_secs(llm_connect_timeout_secs),
        };

        let port: u16 = env_parse("SERVER_PORT", 8080);
        let bind_addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

        Ok(Config {
            database_url,
            db_max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            db_min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 1),
            jwt_secret,
            redis_url,
            ws_max_device_id_length,
            ws_max_devices_per_save,
            llm,
            bind_addr,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
