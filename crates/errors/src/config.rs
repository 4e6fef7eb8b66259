//! Limit configuration error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConfigError {
    #[error("failed to parse limit config: {message}")]
    Parse { message: String },

    #[error("failed to read limit config: {message}")]
    Io { message: String },
}
