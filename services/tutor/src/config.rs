use crate::session::SessionConfig;
use gemini_live::{LIVE_API_URL, SetupConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    #[error("Failed to read prompts from {0}: {1}")]
    Prompts(PathBuf, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub gemini_api_key: String,
    pub live_url: String,
    pub live_model: String,
    pub voice_name: String,
    pub chat_model: String,
    pub chat_api_base: String,
    pub evaluation_url: String,
    pub handshake_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub collaborator_timeout: Duration,
    pub log_level: Level,
    pub prompts_path: PathBuf,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}

fn positive_secs(name: &str, default: u64) -> Result<Duration, ConfigError> {
    let secs = parse_var::<u64>(name, default)?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(Duration::from_secs(secs))
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
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let live_model = var_or("LIVE_MODEL", "models/gemini-2.0-flash-exp");
        let live_model = if live_model.starts_with("models/") {
            live_model
        } else {
            format!("models/{live_model}")
        };

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            gemini_api_key,
            live_url: var_or("GEMINI_LIVE_URL", LIVE_API_URL),
            live_model,
            voice_name: var_or("VOICE_NAME", "Puck"),
            chat_model: var_or("CHAT_MODEL", "gemini-2.0-flash"),
            chat_api_base: var_or(
                "CHAT_API_BASE",
                "https://generativelanguage.googleapis.com/v1beta/openai",
            ),
            evaluation_url: var_or("EVALUATION_URL", "https://chess-api.com/v1"),
            handshake_timeout: positive_secs("HANDSHAKE_TIMEOUT_SECS", 10)?,
            max_reconnect_attempts: parse_var("MAX_RECONNECT_ATTEMPTS", 5)?,
            collaborator_timeout: positive_secs("COLLABORATOR_TIMEOUT_SECS", 8)?,
            log_level,
            prompts_path: std::env::var("PROMPTS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./prompts")),
        })
    }

    /// Session parameters, with `system_instruction` as the tutor persona.
    pub fn session_config(&self, system_instruction: String) -> SessionConfig {
        SessionConfig {
            handshake_timeout: self.handshake_timeout,
            max_reconnect_attempts: self.max_reconnect_attempts,
            ..SessionConfig::new(SetupConfig {
                model: self.live_model.clone(),
                voice_name: self.voice_name.clone(),
                system_instruction,
            })
        }
    }
}

/// Reads every `.md` file in `prompts_path`, keyed by file stem.
pub fn load_prompts(prompts_path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let to_err = |e: std::io::Error| ConfigError::Prompts(prompts_path.to_path_buf(), e.to_string());
    let mut prompts = HashMap::new();
    for entry in std::fs::read_dir(prompts_path).map_err(to_err)? {
        let path = entry.map_err(to_err)?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let Some(prompt_key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = std::fs::read_to_string(&path).map_err(to_err)?;
            prompts.insert(prompt_key.to_string(), content);
        }
    }
    Ok(prompts)
}

/// Fallback persona when no `system_prompt.md` is present.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a warm, encouraging chess tutor speaking to a \
    player during a live game. Keep every reply to one or two short spoken sentences.";

/// The tutor persona: `system_prompt.md` if present and non-empty.
pub fn system_instruction(prompts: &HashMap<String, String>) -> String {
    prompts
        .get("system_prompt")
        .map(|prompt| prompt.trim())
        .filter(|prompt| !prompt.is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT)
        .to_string()
}
