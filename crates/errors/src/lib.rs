#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Error types for the peermit resource manager
//!
//! This crate provides fine-grained error types organized by domain. All
//! error types are Clone so callers can retain and reclassify them.

use thiserror::Error;

pub mod allowlist;
pub mod config;
pub mod resource;
pub mod trace;

pub use allowlist::AllowlistError;
pub use config::ConfigError;
pub use resource::{ResourceError, ResourceKind};
pub use trace::TraceError;

/// Generic error type for cross-crate boundaries
#[derive(Debug, Clone, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Error {
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("allowlist error: {0}")]
    Allowlist(#[from] AllowlistError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
}

impl Error {
    /// True when the error is a resource cap rejection.
    #[must_use]
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(
            self,
            Error::Resource(ResourceError::LimitExceeded { .. })
        )
    }

    /// True when the error reports an operation on a completed scope.
    #[must_use]
    pub fn is_scope_closed(&self) -> bool {
        matches!(self, Error::Resource(ResourceError::ScopeClosed { .. }))
    }
}
