use dotenvy::dotenv;
use std::env;

#[derive(Clone)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub openai_timeout_secs: u64,
    pub openai_max_retries: u32,
    pub database_url: String,
    pub prompts_dir: String,
    pub log_level: String,
    // Connector / catalog settings
    pub dialogs_limit: usize,
    // Scheduler lifecycle
    pub scheduler_stop_grace_secs: u64,
    // Retention: keep at most N suggestions per chat (0 disables cleanup)
    pub retention_keep_per_chat: usize,
}

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            openai_api_key: env::var("OPENAI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            openai_base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string()),
            openai_model: env::var("OPENAI_MODEL")
                .unwrap_or_else(|_| DEFAULT_OPENAI_MODEL.to_string()),
            openai_timeout_secs: env::var("OPENAI_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            openai_max_retries: env::var("OPENAI_MAX_RETRIES")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .unwrap_or(2),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/app.db".to_string()),
            prompts_dir: env::var("PROMPTS_DIR").unwrap_or_else(|_| "prompts".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            dialogs_limit: env::var("DIALOGS_LIMIT")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            scheduler_stop_grace_secs: env::var("SCHEDULER_STOP_GRACE_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            retention_keep_per_chat: env::var("RETENTION_KEEP_PER_CHAT")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
        })
    }

    /// Defaults with an in-memory database, used by tests across the crate.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Config {
            openai_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            openai_timeout_secs: 30,
            openai_max_retries: 2,
            database_url: ":memory:".to_string(),
            prompts_dir: "prompts".to_string(),
            log_level: "debug".to_string(),
            dialogs_limit: 1000,
            scheduler_stop_grace_secs: 5,
            retention_keep_per_chat: 0,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field(
                "openai_api_key",
                &self.openai_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("openai_base_url", &self.openai_base_url)
            .field("openai_model", &self.openai_model)
            .field("openai_timeout_secs", &self.openai_timeout_secs)
            .field("openai_max_retries", &self.openai_max_retries)
            .field("database_url", &self.database_url)
            .field("prompts_dir", &self.prompts_dir)
            .field("log_level", &self.log_level)
            .field("dialogs_limit", &self.dialogs_limit)
            .field("scheduler_stop_grace_secs", &self.scheduler_stop_grace_secs)
            .field("retention_keep_per_chat", &self.retention_keep_per_chat)
            .finish()
    }
}
