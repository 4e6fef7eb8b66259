//! Usage snapshots

use serde::{Deserialize, Serialize};

/// Snapshot of a scope's current resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeStat {
    /// Reserved memory in bytes.
    pub memory: i64,
    pub num_streams_in: i32,
    pub num_streams_out: i32,
    pub num_conns_in: i32,
    pub num_conns_out: i32,
    /// Open file descriptors attributed to this scope.
    pub num_fd: i32,
}

impl ScopeStat {
    /// True when every counter is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory == 0
            && self.num_streams_in == 0
            && self.num_streams_out == 0
            && self.num_conns_in == 0
            && self.num_conns_out == 0
            && self.num_fd == 0
    }
}
