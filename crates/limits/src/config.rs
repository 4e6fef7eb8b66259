//! Partial limit configuration loaded from JSON
//!
//! Operators rarely want to spell out every cap. The config format mirrors
//! [`LimitTable`](crate::LimitTable) but every field is optional; anything
//! left out falls back to the supplied defaults (usually
//! [`default_table`](crate::default_table)). Override-map entries start from
//! the matching default limit and apply their fields on top.

use crate::{Limit, LimitTable};
use peermit_errors::{ConfigError, Error};
use peermit_types::{PeerId, ProtocolId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;

/// A limit with every cap optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialLimit {
    pub memory: Option<i64>,
    pub streams_in: Option<i32>,
    pub streams_out: Option<i32>,
    pub streams: Option<i32>,
    pub conns_in: Option<i32>,
    pub conns_out: Option<i32>,
    pub conns: Option<i32>,
    pub fd: Option<i32>,
}

impl PartialLimit {
    /// Apply the set fields on top of `base`.
    #[must_use]
    pub fn apply(&self, base: Limit) -> Limit {
        Limit {
            memory: self.memory.unwrap_or(base.memory),
            streams_in: self.streams_in.unwrap_or(base.streams_in),
            streams_out: self.streams_out.unwrap_or(base.streams_out),
            streams: self.streams.unwrap_or(base.streams),
            conns_in: self.conns_in.unwrap_or(base.conns_in),
            conns_out: self.conns_out.unwrap_or(base.conns_out),
            conns: self.conns.unwrap_or(base.conns),
            fd: self.fd.unwrap_or(base.fd),
        }
    }
}

/// A limit table with every section optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialLimitTable {
    pub system: Option<PartialLimit>,
    pub transient: Option<PartialLimit>,
    pub allowlisted_system: Option<PartialLimit>,
    pub allowlisted_transient: Option<PartialLimit>,

    pub service_default: Option<PartialLimit>,
    pub service_peer_default: Option<PartialLimit>,
    pub protocol_default: Option<PartialLimit>,
    pub protocol_peer_default: Option<PartialLimit>,
    pub peer_default: Option<PartialLimit>,

    pub conn: Option<PartialLimit>,
    pub stream: Option<PartialLimit>,

    #[serde(default)]
    pub service: HashMap<String, PartialLimit>,
    #[serde(default)]
    pub service_peer: HashMap<String, PartialLimit>,
    #[serde(default)]
    pub protocol: HashMap<ProtocolId, PartialLimit>,
    #[serde(default)]
    pub protocol_peer: HashMap<ProtocolId, PartialLimit>,
    #[serde(default)]
    pub peer: HashMap<PeerId, PartialLimit>,
}

impl PartialLimitTable {
    /// Materialize the table, filling every gap from `defaults`.
    #[must_use]
    pub fn materialize(&self, defaults: &LimitTable) -> LimitTable {
        fn section(partial: Option<&PartialLimit>, base: Limit) -> Limit {
            partial.map_or(base, |p| p.apply(base))
        }

        let mut table = LimitTable {
            system: section(self.system.as_ref(), defaults.system),
            transient: section(self.transient.as_ref(), defaults.transient),
            allowlisted_system: section(
                self.allowlisted_system.as_ref(),
                defaults.allowlisted_system,
            ),
            allowlisted_transient: section(
                self.allowlisted_transient.as_ref(),
                defaults.allowlisted_transient,
            ),
            service_default: section(self.service_default.as_ref(), defaults.service_default),
            service_peer_default: section(
                self.service_peer_default.as_ref(),
                defaults.service_peer_default,
            ),
            protocol_default: section(self.protocol_default.as_ref(), defaults.protocol_default),
            protocol_peer_default: section(
                self.protocol_peer_default.as_ref(),
                defaults.protocol_peer_default,
            ),
            peer_default: section(self.peer_default.as_ref(), defaults.peer_default),
            conn: section(self.conn.as_ref(), defaults.conn),
            stream: section(self.stream.as_ref(), defaults.stream),
            service: defaults.service.clone(),
            service_peer: defaults.service_peer.clone(),
            protocol: defaults.protocol.clone(),
            protocol_peer: defaults.protocol_peer.clone(),
            peer: defaults.peer.clone(),
        };

        for (svc, partial) in &self.service {
            let base = table.service_limit(svc);
            table.service.insert(svc.clone(), partial.apply(base));
        }
        for (svc, partial) in &self.service_peer {
            let base = table.service_peer_limit(svc);
            table.service_peer.insert(svc.clone(), partial.apply(base));
        }
        for (proto, partial) in &self.protocol {
            let base = table.protocol_limit(proto);
            table.protocol.insert(proto.clone(), partial.apply(base));
        }
        for (proto, partial) in &self.protocol_peer {
            let base = table.protocol_peer_limit(proto);
            table
                .protocol_peer
                .insert(proto.clone(), partial.apply(base));
        }
        for (peer, partial) in &self.peer {
            let base = table.peer_limit(peer);
            table.peer.insert(peer.clone(), partial.apply(base));
        }

        table
    }
}

impl LimitTable {
    /// Load a table from a JSON string, filling gaps from `defaults`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the JSON is malformed or contains
    /// unknown fields.
    pub fn from_json_str(json: &str, defaults: &LimitTable) -> Result<LimitTable, Error> {
        let partial: PartialLimitTable =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse {
                message: e.to_string(),
            })?;
        Ok(partial.materialize(defaults))
    }

    /// Load a table from a JSON reader, filling gaps from `defaults`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when reading fails and
    /// [`ConfigError::Parse`] when the JSON is malformed.
    pub fn from_json_reader(
        mut reader: impl Read,
        defaults: &LimitTable,
    ) -> Result<LimitTable, Error> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|e| ConfigError::Io {
                message: e.to_string(),
            })?;
        Self::from_json_str(&buf, defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_table;

    #[test]
    fn empty_config_yields_defaults() {
        let table = LimitTable::from_json_str("{}", &default_table()).unwrap();
        assert_eq!(table.system, default_table().system);
        assert_eq!(table.conn, default_table().conn);
    }

    #[test]
    fn partial_section_keeps_unset_fields() {
        let json = r#"{ "system": { "conns_in": 7 } }"#;
        let defaults = default_table();
        let table = LimitTable::from_json_str(json, &defaults).unwrap();
        assert_eq!(table.system.conns_in, 7);
        assert_eq!(table.system.memory, defaults.system.memory);
        assert_eq!(table.system.fd, defaults.system.fd);
    }

    #[test]
    fn override_maps_start_from_matching_default() {
        let json = r#"{
            "peer_default": { "fd": 2 },
            "peer": { "QmFoo": { "conns_in": 3 } }
        }"#;
        let defaults = default_table();
        let table = LimitTable::from_json_str(json, &defaults).unwrap();

        let foo = table.peer_limit(&PeerId::from("QmFoo"));
        assert_eq!(foo.conns_in, 3);
        // unset override fields inherit the (already overridden) default
        assert_eq!(foo.fd, 2);
        assert_eq!(table.peer_limit(&PeerId::from("QmBar")).fd, 2);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(LimitTable::from_json_str(r#"{ "sytem": {} }"#, &default_table()).is_err());
    }
}
