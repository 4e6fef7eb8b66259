//! Static default limits
//!
//! Conservative defaults for a mid-sized node. Deployments with unusual
//! workloads are expected to load their own table; these numbers exist so a
//! manager can be constructed without any configuration at all.

use crate::{Limit, LimitTable};
use std::collections::HashMap;

const KIB: i64 = 1024;
const MIB: i64 = 1024 * KIB;
const GIB: i64 = 1024 * MIB;

/// The built-in default limit table.
#[must_use]
pub fn default_table() -> LimitTable {
    let system = Limit {
        memory: GIB,
        streams_in: 4096,
        streams_out: 4096,
        streams: 8192,
        conns_in: 256,
        conns_out: 512,
        conns: 768,
        fd: 512,
    };

    let transient = Limit {
        memory: 128 * MIB,
        streams_in: 512,
        streams_out: 512,
        streams: 1024,
        conns_in: 64,
        conns_out: 128,
        conns: 192,
        fd: 256,
    };

    LimitTable {
        system,
        transient,
        // Allowlisted remotes get their own headroom, matching the default
        // tree so a fully allowlisted deployment behaves identically.
        allowlisted_system: system,
        allowlisted_transient: transient,
        service_default: Limit {
            memory: 64 * MIB,
            streams_in: 1024,
            streams_out: 1024,
            streams: 2048,
            conns_in: 0,
            conns_out: 0,
            conns: 0,
            fd: 0,
        },
        service_peer_default: Limit {
            memory: 16 * MIB,
            streams_in: 128,
            streams_out: 128,
            streams: 256,
            conns_in: 0,
            conns_out: 0,
            conns: 0,
            fd: 0,
        },
        protocol_default: Limit {
            memory: 64 * MIB,
            streams_in: 1024,
            streams_out: 1024,
            streams: 2048,
            conns_in: 0,
            conns_out: 0,
            conns: 0,
            fd: 0,
        },
        protocol_peer_default: Limit {
            memory: 16 * MIB,
            streams_in: 128,
            streams_out: 128,
            streams: 256,
            conns_in: 0,
            conns_out: 0,
            conns: 0,
            fd: 0,
        },
        peer_default: Limit {
            memory: 64 * MIB,
            streams_in: 256,
            streams_out: 512,
            streams: 768,
            conns_in: 8,
            conns_out: 8,
            conns: 16,
            fd: 4,
        },
        conn: Limit {
            memory: 32 * MIB,
            streams_in: 0,
            streams_out: 0,
            streams: 0,
            conns_in: 1,
            conns_out: 1,
            conns: 1,
            fd: 1,
        },
        stream: Limit {
            memory: 16 * MIB,
            streams_in: 1,
            streams_out: 1,
            streams: 1,
            conns_in: 0,
            conns_out: 0,
            conns: 0,
            fd: 0,
        },
        service: HashMap::new(),
        service_peer: HashMap::new(),
        protocol: HashMap::new(),
        protocol_peer: HashMap::new(),
        peer: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let table = default_table();
        assert!(table.transient.memory <= table.system.memory);
        assert!(i64::from(table.transient.conns) <= i64::from(table.system.conns));
        assert_eq!(table.conn.conns, 1);
        assert_eq!(table.stream.streams, 1);
    }
}
