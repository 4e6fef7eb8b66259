#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Core type definitions for the peermit resource manager
//!
//! This crate provides the vocabulary shared by the accounting core and its
//! callers: directions, peer and protocol identities, multiaddresses, usage
//! snapshots, and memory pressure levels.

pub mod id;
pub mod multiaddr;
pub mod stat;

pub use id::{PeerId, ProtocolId};
pub use multiaddr::{Component, Multiaddr};
pub use stat::ScopeStat;

use serde::{Deserialize, Serialize};

/// Direction of a connection or stream, relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    #[must_use]
    pub fn is_inbound(self) -> bool {
        matches!(self, Direction::Inbound)
    }
}

/// Memory pressure level reported by successful memory reservations.
///
/// The level reflects how much of the scope's memory cap is in use after the
/// reservation committed: `Caution` from 50%, `Critical` from 90%. Callers
/// use it to drive backpressure policy; the accounting core itself only
/// reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Ok,
    Caution,
    Critical,
}

impl MemoryPressure {
    /// Combine two pressure levels, keeping the more severe one.
    #[must_use]
    pub fn combine(self, other: MemoryPressure) -> MemoryPressure {
        self.max(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_ordering() {
        assert!(MemoryPressure::Ok < MemoryPressure::Caution);
        assert!(MemoryPressure::Caution < MemoryPressure::Critical);
        assert_eq!(
            MemoryPressure::Ok.combine(MemoryPressure::Critical),
            MemoryPressure::Critical
        );
        assert_eq!(
            MemoryPressure::Caution.combine(MemoryPressure::Ok),
            MemoryPressure::Caution
        );
    }
}
