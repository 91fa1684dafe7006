use gemini_realtime::{LiveConfig, ResponseModality, config::DEFAULT_LIVE_MODEL};
use secrecy::SecretString;
use std::path::PathBuf;
use tracing::Level;

pub const DEFAULT_CHAT_MODEL: &str = "gemini-2.5-flash";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub gemini_api_key: SecretString,
    pub live_model: String,
    pub chat_model: String,
    pub voice_name: Option<String>,
    pub system_prompt_path: Option<PathBuf>,
    pub enable_search: bool,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let live_model =
            std::env::var("LIVE_MODEL").unwrap_or_else(|_| DEFAULT_LIVE_MODEL.to_string());
        let chat_model =
            std::env::var("CHAT_MODEL").unwrap_or_else(|_| DEFAULT_CHAT_MODEL.to_string());
        let voice_name = std::env::var("VOICE_NAME").ok().filter(|v| !v.is_empty());
        let system_prompt_path = std::env::var("SYSTEM_PROMPT_PATH").ok().map(PathBuf::from);

        let enable_search = match std::env::var("ENABLE_SEARCH") {
            Ok(value) => parse_bool(&value).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "ENABLE_SEARCH".to_string(),
                    format!("'{}' is not a boolean", value),
                )
            })?,
            Err(_) => true,
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            gemini_api_key,
            live_model,
            chat_model,
            voice_name,
            system_prompt_path,
            enable_search,
            log_level,
        })
    }

    /// Live session configuration with this service's defaults.
    pub fn live_config(&self, system_instruction: Option<String>, text_only: bool) -> LiveConfig {
        let mut live = LiveConfig::new(self.gemini_api_key.clone());
        live.model = self.live_model.clone();
        live.voice = self.voice_name.clone();
        live.system_instruction = system_instruction;
        live.google_search = self.enable_search;
        if text_only {
            live.response_modality = ResponseModality::Text;
        } else {
            live.input_transcription = true;
            live.output_transcription = true;
        }
        live
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
