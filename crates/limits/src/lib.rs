#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Limit records and limit tables for the peermit resource manager
//!
//! A [`Limit`] is the set of hard caps attached to one accounting scope. A
//! [`LimitTable`] is the materialized configuration the manager is built
//! with: limits for the root scopes, defaults for each lazily created scope
//! class, and per-key overrides.

pub mod config;
mod defaults;

pub use config::{PartialLimit, PartialLimitTable};
pub use defaults::default_table;

use peermit_types::{Direction, PeerId, ProtocolId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Hard caps for a single scope.
///
/// Every field is an inclusive upper bound; a reservation that would push a
/// counter past its cap fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    /// Maximum reserved memory in bytes.
    pub memory: i64,
    pub streams_in: i32,
    pub streams_out: i32,
    /// Cap on inbound plus outbound streams together.
    pub streams: i32,
    pub conns_in: i32,
    pub conns_out: i32,
    /// Cap on inbound plus outbound connections together.
    pub conns: i32,
    pub fd: i32,
}

impl Limit {
    /// A limit that never rejects.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            memory: i64::MAX,
            streams_in: i32::MAX,
            streams_out: i32::MAX,
            streams: i32::MAX,
            conns_in: i32::MAX,
            conns_out: i32::MAX,
            conns: i32::MAX,
            fd: i32::MAX,
        }
    }

    /// A limit that rejects everything.
    #[must_use]
    pub fn block_all() -> Self {
        Self {
            memory: 0,
            streams_in: 0,
            streams_out: 0,
            streams: 0,
            conns_in: 0,
            conns_out: 0,
            conns: 0,
            fd: 0,
        }
    }

    /// Stream cap for one direction.
    #[must_use]
    pub fn stream_limit(&self, dir: Direction) -> i32 {
        match dir {
            Direction::Inbound => self.streams_in,
            Direction::Outbound => self.streams_out,
        }
    }

    /// Connection cap for one direction.
    #[must_use]
    pub fn conn_limit(&self, dir: Direction) -> i32 {
        match dir {
            Direction::Inbound => self.conns_in,
            Direction::Outbound => self.conns_out,
        }
    }
}

/// The complete limit configuration for a resource manager.
///
/// Override maps take precedence over the matching default; the accessors
/// encapsulate the fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitTable {
    pub system: Limit,
    pub transient: Limit,
    pub allowlisted_system: Limit,
    pub allowlisted_transient: Limit,

    pub service_default: Limit,
    pub service_peer_default: Limit,
    pub protocol_default: Limit,
    pub protocol_peer_default: Limit,
    pub peer_default: Limit,

    pub conn: Limit,
    pub stream: Limit,

    #[serde(default)]
    pub service: HashMap<String, Limit>,
    #[serde(default)]
    pub service_peer: HashMap<String, Limit>,
    #[serde(default)]
    pub protocol: HashMap<ProtocolId, Limit>,
    #[serde(default)]
    pub protocol_peer: HashMap<ProtocolId, Limit>,
    #[serde(default)]
    pub peer: HashMap<PeerId, Limit>,
}

impl LimitTable {
    /// A table that never rejects anything, useful for tests and for running
    /// without enforcement to observe baseline usage.
    #[must_use]
    pub fn unlimited() -> Self {
        let l = Limit::unlimited();
        Self {
            system: l,
            transient: l,
            allowlisted_system: l,
            allowlisted_transient: l,
            service_default: l,
            service_peer_default: l,
            protocol_default: l,
            protocol_peer_default: l,
            peer_default: l,
            conn: l,
            stream: l,
            service: HashMap::new(),
            service_peer: HashMap::new(),
            protocol: HashMap::new(),
            protocol_peer: HashMap::new(),
            peer: HashMap::new(),
        }
    }

    #[must_use]
    pub fn service_limit(&self, svc: &str) -> Limit {
        self.service.get(svc).copied().unwrap_or(self.service_default)
    }

    #[must_use]
    pub fn service_peer_limit(&self, svc: &str) -> Limit {
        self.service_peer
            .get(svc)
            .copied()
            .unwrap_or(self.service_peer_default)
    }

    #[must_use]
    pub fn protocol_limit(&self, proto: &ProtocolId) -> Limit {
        self.protocol
            .get(proto)
            .copied()
            .unwrap_or(self.protocol_default)
    }

    #[must_use]
    pub fn protocol_peer_limit(&self, proto: &ProtocolId) -> Limit {
        self.protocol_peer
            .get(proto)
            .copied()
            .unwrap_or(self.protocol_peer_default)
    }

    #[must_use]
    pub fn peer_limit(&self, peer: &PeerId) -> Limit {
        self.peer.get(peer).copied().unwrap_or(self.peer_default)
    }
}

impl Default for LimitTable {
    fn default() -> Self {
        default_table()
    }
}
