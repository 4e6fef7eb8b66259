//! Resource accounting error types

use std::fmt;
use thiserror::Error;

/// The resource class a rejection applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceKind {
    Memory,
    StreamsIn,
    StreamsOut,
    StreamsTotal,
    ConnsIn,
    ConnsOut,
    ConnsTotal,
    Fd,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Memory => "memory",
            ResourceKind::StreamsIn => "inbound streams",
            ResourceKind::StreamsOut => "outbound streams",
            ResourceKind::StreamsTotal => "streams",
            ResourceKind::ConnsIn => "inbound connections",
            ResourceKind::ConnsOut => "outbound connections",
            ResourceKind::ConnsTotal => "connections",
            ResourceKind::Fd => "file descriptors",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceError {
    #[error("{scope}: cannot reserve {kind}: requested {requested}, limit {limit}")]
    LimitExceeded {
        scope: String,
        kind: ResourceKind,
        requested: i64,
        limit: i64,
    },

    #[error("{scope}: resource scope closed")]
    ScopeClosed { scope: String },

    #[error("{scope}: already attached to a {what}")]
    AlreadyAttached { scope: String, what: String },

    #[error("{scope}: {message}")]
    InvalidTransition { scope: String, message: String },

    #[error("peer {peer} at {addr} is not covered by the allowlist")]
    AllowlistRejected { peer: String, addr: String },
}

impl ResourceError {
    /// Fill in the scope name on errors raised below the scope layer.
    ///
    /// Counter-level rejections are built without a scope name; the owning
    /// scope stamps its own before propagating. An already-set name is kept.
    #[must_use]
    pub fn with_scope(mut self, name: &str) -> Self {
        match &mut self {
            ResourceError::LimitExceeded { scope, .. }
            | ResourceError::ScopeClosed { scope }
            | ResourceError::AlreadyAttached { scope, .. }
            | ResourceError::InvalidTransition { scope, .. } => {
                if scope.is_empty() {
                    *scope = name.to_string();
                }
            }
            ResourceError::AllowlistRejected { .. } => {}
        }
        self
    }
}
