//! Allowlist error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AllowlistError {
    #[error("invalid multiaddr {addr}: {reason}")]
    InvalidMultiaddr { addr: String, reason: String },

    #[error("multiaddr {addr} has no ip component")]
    MissingIp { addr: String },
}
