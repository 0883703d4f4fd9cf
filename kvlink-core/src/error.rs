//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// Invalid or unreadable configuration. Always fatal at construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option: {0}")]
    MissingOption(&'static str),

    #[error("invalid option '{name}': {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidOption {
            name,
            reason: reason.into(),
        }
    }
}
