//! Configuration loading from disk.

use std::path::Path;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{resolve_settings, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {}", format_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: ProxyConfig = toml::from_str(&content)?;

    resolve_settings(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}
