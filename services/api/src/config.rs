use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// OpenAI-compatible backends the conversational and judgment models run on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

impl Provider {
    pub fn api_base(&self) -> &'static str {
        match self {
            Provider::OpenAI => "https://api.openai.com/v1/",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub judge_model: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub rpc_timeout: Duration,
    pub explanation_grace: Duration,
    pub role_play_success_grace: Duration,
    pub role_play_failure_grace: Duration,
    pub end_on_first_success: bool,
    pub metadata_max_attempts: u32,
    pub metadata_retry_base: Duration,
    pub accepted_translation_language: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let provider_str = std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "gemini" => Provider::Gemini,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{}' is not one of 'openai', 'gemini'", other),
                ));
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let judge_model =
            std::env::var("JUDGE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        let rpc_timeout = Duration::from_millis(parse_var("RPC_TIMEOUT_MS", 1000u64)?);
        let explanation_grace = seconds_var("EXPLANATION_GRACE_SECS", 5.0)?;
        let role_play_success_grace = seconds_var("ROLE_PLAY_SUCCESS_GRACE_SECS", 4.0)?;
        let role_play_failure_grace = seconds_var("ROLE_PLAY_FAILURE_GRACE_SECS", 3.0)?;
        let end_on_first_success = parse_var("END_ON_FIRST_SUCCESS", true)?;

        let metadata_max_attempts = parse_var("METADATA_MAX_ATTEMPTS", 5u32)?;
        if metadata_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "METADATA_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let metadata_retry_base =
            Duration::from_millis(parse_var("METADATA_RETRY_BASE_MS", 500u64)?);

        let accepted_translation_language = std::env::var("ACCEPTED_TRANSLATION_LANGUAGE")
            .ok()
            .filter(|s| !s.trim().is_empty());

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            bind_address,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            judge_model,
            log_level,
            prompts_path,
            rpc_timeout,
            explanation_grace,
            role_play_success_grace,
            role_play_failure_grace,
            end_on_first_success,
            metadata_max_attempts,
            metadata_retry_base,
            accepted_translation_language,
        })
    }

    /// The API key for the selected provider.
    pub fn api_key(&self) -> Option<&str> {
        match self.provider {
            Provider::OpenAI => self.openai_api_key.as_deref(),
            Provider::Gemini => self.gemini_api_key.as_deref(),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn seconds_var(name: &str, default: f64) -> Result<Duration, ConfigError> {
    let secs = parse_var(name, default)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}
