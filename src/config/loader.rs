//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::{MessageConfig, Settings};
use crate::config::validation::{validate_settings, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate process settings from a TOML file.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let content = fs::read_to_string(path)?;
    let settings: Settings = toml::from_str(&content)?;

    validate_settings(&settings).map_err(ConfigError::Validation)?;

    Ok(settings)
}

/// Read and parse the watched file, reporting why it could not be used.
pub fn try_load_message_config(path: &Path) -> Result<MessageConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Read the watched file, degrading to an empty message on any failure.
///
/// Serving an empty body is preferred over refusing to start, so errors are
/// logged here and never reach the caller.
pub fn load_message_config(path: &Path) -> MessageConfig {
    match try_load_message_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not load config file, serving empty message"
            );
            MessageConfig::default()
        }
    }
}
