//! Application Configuration Module
//!
//! Loads the tutor's settings from environment variables (and an optional
//! `.env` file) into a single struct handed to the rest of the service.

use lingo_core::content::Language;
use std::env;
use std::path::PathBuf;
use tracing::Level;

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub content_dir: PathBuf,
    pub target_language: Language,
    pub mother_language: Language,
    pub progress_log: Option<PathBuf>,
    pub log_level: Level,
}

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `CONTENT_DIR`: (Optional) Directory of JSON dialogue files. Defaults to "content".
    // *   `TARGET_LANGUAGE`: (Optional) Language the learner practises. Defaults to "en".
    // *   `MOTHER_LANGUAGE`: (Optional) Language of prompts and translations. Defaults to "ru".
    // *   `PROGRESS_LOG`: (Optional) File that quiz outcomes are appended to as JSON lines.
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, so it can be tested
    /// without touching the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let content_dir = lookup("CONTENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("content"));
        let target_language = parse_language(&lookup, "TARGET_LANGUAGE", Language::En)?;
        let mother_language = parse_language(&lookup, "MOTHER_LANGUAGE", Language::Ru)?;
        if target_language == mother_language {
            return Err(ConfigError::InvalidValue {
                var: "MOTHER_LANGUAGE".to_string(),
                reason: format!("must differ from the target language ({target_language})"),
            });
        }

        let progress_log = lookup("PROGRESS_LOG")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            content_dir,
            target_language,
            mother_language,
            progress_log,
            log_level,
        })
    }
}

fn parse_language(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: Language,
) -> Result<Language, ConfigError> {
    match lookup(var) {
        Some(value) => value.parse().map_err(|reason| ConfigError::InvalidValue {
            var: var.to_string(),
            reason,
        }),
        None => Ok(default),
    }
}
