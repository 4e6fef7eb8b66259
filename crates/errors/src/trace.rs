//! Trace emitter error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TraceError {
    #[error("failed to open trace output {path}: {message}")]
    Io { path: String, message: String },

    #[error("malformed trace record at line {line}: {message}")]
    Malformed { line: usize, message: String },
}
