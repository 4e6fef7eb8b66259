//! Cap-enforcing usage counters
//!
//! [`Counters`] tracks one scope's current usage against its limit. It has
//! no knowledge of parent scopes; all propagation happens in the scope
//! layer. Negative counters indicate a caller bug (a release without a
//! matching reservation) and panic rather than report.

use peermit_errors::{ResourceError, ResourceKind};
use peermit_limits::Limit;
use peermit_types::{MemoryPressure, ScopeStat};

#[derive(Debug)]
pub(crate) struct Counters {
    limit: Limit,
    memory: i64,
    nstreams_in: i32,
    nstreams_out: i32,
    nconns_in: i32,
    nconns_out: i32,
    nfd: i32,
}

fn exceeded(kind: ResourceKind, requested: i64, limit: i64) -> ResourceError {
    // the scope layer stamps its name on before propagating
    ResourceError::LimitExceeded {
        scope: String::new(),
        kind,
        requested,
        limit,
    }
}

fn pressure(used: i64, cap: i64) -> MemoryPressure {
    let (used, cap) = (i128::from(used), i128::from(cap));
    if used * 10 >= cap * 9 {
        MemoryPressure::Critical
    } else if used * 2 >= cap {
        MemoryPressure::Caution
    } else {
        MemoryPressure::Ok
    }
}

impl Counters {
    pub(crate) fn new(limit: Limit) -> Self {
        Self {
            limit,
            memory: 0,
            nstreams_in: 0,
            nstreams_out: 0,
            nconns_in: 0,
            nconns_out: 0,
            nfd: 0,
        }
    }

    pub(crate) fn memory(&self) -> i64 {
        self.memory
    }

    pub(crate) fn streams(&self) -> (i32, i32) {
        (self.nstreams_in, self.nstreams_out)
    }

    pub(crate) fn conns(&self) -> (i32, i32) {
        (self.nconns_in, self.nconns_out)
    }

    pub(crate) fn fd(&self) -> i32 {
        self.nfd
    }

    pub(crate) fn stat(&self) -> ScopeStat {
        ScopeStat {
            memory: self.memory,
            num_streams_in: self.nstreams_in,
            num_streams_out: self.nstreams_out,
            num_conns_in: self.nconns_in,
            num_conns_out: self.nconns_out,
            num_fd: self.nfd,
        }
    }

    /// Check whether `size` bytes fit under the cap, without committing.
    ///
    /// The overflow check doubles as a rejection of negative reservations.
    pub(crate) fn check_memory(&self, size: i64) -> Result<MemoryPressure, ResourceError> {
        let new_mem = match self.memory.checked_add(size) {
            Some(m) if m >= self.memory => m,
            _ => return Err(exceeded(ResourceKind::Memory, size, self.limit.memory)),
        };
        if new_mem > self.limit.memory {
            return Err(exceeded(ResourceKind::Memory, size, self.limit.memory));
        }
        Ok(pressure(new_mem, self.limit.memory))
    }

    pub(crate) fn reserve_memory(&mut self, size: i64) -> Result<MemoryPressure, ResourceError> {
        let level = self.check_memory(size)?;
        self.memory += size;
        Ok(level)
    }

    pub(crate) fn release_memory(&mut self, size: i64) {
        self.memory -= size;
        assert!(self.memory >= 0, "BUG: too much memory released");
    }

    pub(crate) fn add_streams(&mut self, incoming: i32, outgoing: i32) -> Result<(), ResourceError> {
        if incoming > 0
            && i64::from(self.nstreams_in) + i64::from(incoming) > i64::from(self.limit.streams_in)
        {
            return Err(exceeded(
                ResourceKind::StreamsIn,
                i64::from(incoming),
                i64::from(self.limit.streams_in),
            ));
        }
        if outgoing > 0
            && i64::from(self.nstreams_out) + i64::from(outgoing)
                > i64::from(self.limit.streams_out)
        {
            return Err(exceeded(
                ResourceKind::StreamsOut,
                i64::from(outgoing),
                i64::from(self.limit.streams_out),
            ));
        }
        if i64::from(self.nstreams_in)
            + i64::from(incoming)
            + i64::from(self.nstreams_out)
            + i64::from(outgoing)
            > i64::from(self.limit.streams)
        {
            return Err(exceeded(
                ResourceKind::StreamsTotal,
                i64::from(incoming) + i64::from(outgoing),
                i64::from(self.limit.streams),
            ));
        }

        self.nstreams_in += incoming;
        self.nstreams_out += outgoing;
        Ok(())
    }

    pub(crate) fn remove_streams(&mut self, incoming: i32, outgoing: i32) {
        self.nstreams_in -= incoming;
        self.nstreams_out -= outgoing;
        assert!(
            self.nstreams_in >= 0,
            "BUG: too many inbound streams released"
        );
        assert!(
            self.nstreams_out >= 0,
            "BUG: too many outbound streams released"
        );
    }

    pub(crate) fn add_conns(
        &mut self,
        incoming: i32,
        outgoing: i32,
        fd: i32,
    ) -> Result<(), ResourceError> {
        if incoming > 0
            && i64::from(self.nconns_in) + i64::from(incoming) > i64::from(self.limit.conns_in)
        {
            return Err(exceeded(
                ResourceKind::ConnsIn,
                i64::from(incoming),
                i64::from(self.limit.conns_in),
            ));
        }
        if outgoing > 0
            && i64::from(self.nconns_out) + i64::from(outgoing) > i64::from(self.limit.conns_out)
        {
            return Err(exceeded(
                ResourceKind::ConnsOut,
                i64::from(outgoing),
                i64::from(self.limit.conns_out),
            ));
        }
        if i64::from(self.nconns_in)
            + i64::from(incoming)
            + i64::from(self.nconns_out)
            + i64::from(outgoing)
            > i64::from(self.limit.conns)
        {
            return Err(exceeded(
                ResourceKind::ConnsTotal,
                i64::from(incoming) + i64::from(outgoing),
                i64::from(self.limit.conns),
            ));
        }
        if fd > 0 && i64::from(self.nfd) + i64::from(fd) > i64::from(self.limit.fd) {
            return Err(exceeded(
                ResourceKind::Fd,
                i64::from(fd),
                i64::from(self.limit.fd),
            ));
        }

        self.nconns_in += incoming;
        self.nconns_out += outgoing;
        self.nfd += fd;
        Ok(())
    }

    pub(crate) fn remove_conns(&mut self, incoming: i32, outgoing: i32, fd: i32) {
        self.nconns_in -= incoming;
        self.nconns_out -= outgoing;
        self.nfd -= fd;
        assert!(
            self.nconns_in >= 0,
            "BUG: too many inbound connections released"
        );
        assert!(
            self.nconns_out >= 0,
            "BUG: too many outbound connections released"
        );
        assert!(self.nfd >= 0, "BUG: too many file descriptors released");
    }

    /// Reserve an entire usage snapshot at once; used when a leaf scope is
    /// re-parented. Either all counters commit or none do.
    pub(crate) fn reserve_bulk(&mut self, stat: &ScopeStat) -> Result<(), ResourceError> {
        self.reserve_memory(stat.memory)?;
        if let Err(e) = self.add_streams(stat.num_streams_in, stat.num_streams_out) {
            self.release_memory(stat.memory);
            return Err(e);
        }
        if let Err(e) = self.add_conns(stat.num_conns_in, stat.num_conns_out, stat.num_fd) {
            self.remove_streams(stat.num_streams_in, stat.num_streams_out);
            self.release_memory(stat.memory);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn release_bulk(&mut self, stat: &ScopeStat) {
        self.release_memory(stat.memory);
        self.remove_streams(stat.num_streams_in, stat.num_streams_out);
        self.remove_conns(stat.num_conns_in, stat.num_conns_out, stat.num_fd);
    }

    pub(crate) fn zero(&mut self) {
        self.memory = 0;
        self.nstreams_in = 0;
        self.nstreams_out = 0;
        self.nconns_in = 0;
        self.nconns_out = 0;
        self.nfd = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit() -> Limit {
        Limit {
            memory: 4096,
            streams_in: 1,
            streams_out: 1,
            streams: 2,
            conns_in: 1,
            conns_out: 1,
            conns: 2,
            fd: 1,
        }
    }

    #[test]
    fn memory_caps_and_overflow() {
        let mut rc = Counters::new(limit());

        assert!(rc.check_memory(1024).is_ok());
        assert!(rc.check_memory(4096).is_ok());
        assert!(rc.check_memory(8192).is_err());

        rc.reserve_memory(1024).unwrap();
        rc.reserve_memory(1024).unwrap();
        assert_eq!(rc.memory(), 2048);

        assert!(rc.reserve_memory(4096).is_err());
        assert_eq!(rc.memory(), 2048);

        rc.release_memory(1024);
        assert_eq!(rc.memory(), 1024);

        // the overflow check rejects without committing
        assert!(rc.reserve_memory(i64::MAX).is_err());
        assert_eq!(rc.memory(), 1024);

        // negative reservations are rejected by the same check
        assert!(rc.reserve_memory(-1).is_err());
    }

    #[test]
    fn pressure_levels() {
        let mut rc = Counters::new(Limit {
            memory: 1000,
            ..Limit::unlimited()
        });
        assert_eq!(rc.reserve_memory(100).unwrap(), MemoryPressure::Ok);
        assert_eq!(rc.reserve_memory(400).unwrap(), MemoryPressure::Caution);
        assert_eq!(rc.reserve_memory(400).unwrap(), MemoryPressure::Critical);
    }

    #[test]
    fn stream_direction_and_total_caps() {
        let mut rc = Counters::new(limit());

        rc.add_streams(1, 0).unwrap();
        let err = rc.add_streams(1, 0).unwrap_err();
        assert!(matches!(
            err,
            ResourceError::LimitExceeded {
                kind: ResourceKind::StreamsIn,
                ..
            }
        ));

        rc.add_streams(0, 1).unwrap();
        assert_eq!(rc.streams(), (1, 1));

        rc.remove_streams(1, 1);
        assert_eq!(rc.streams(), (0, 0));

        // total cap binds even when the direction caps would not
        let mut rc = Counters::new(Limit {
            streams_in: 8,
            streams_out: 8,
            streams: 2,
            ..Limit::unlimited()
        });
        rc.add_streams(1, 1).unwrap();
        let err = rc.add_streams(1, 0).unwrap_err();
        assert!(matches!(
            err,
            ResourceError::LimitExceeded {
                kind: ResourceKind::StreamsTotal,
                ..
            }
        ));
    }

    #[test]
    fn conn_caps_include_fd() {
        let mut rc = Counters::new(limit());

        rc.add_conns(1, 0, 1).unwrap();
        let err = rc.add_conns(0, 1, 1).unwrap_err();
        assert!(matches!(
            err,
            ResourceError::LimitExceeded {
                kind: ResourceKind::Fd,
                ..
            }
        ));
        // the failed fd check must not leak the conn counters
        assert_eq!(rc.conns(), (1, 0));
        assert_eq!(rc.fd(), 1);

        rc.add_conns(0, 1, 0).unwrap();
        rc.remove_conns(1, 1, 1);
        assert!(rc.stat().is_empty());
    }

    #[test]
    fn bulk_reserve_rolls_back_on_failure() {
        let mut rc = Counters::new(limit());
        let stat = ScopeStat {
            memory: 1024,
            num_streams_in: 1,
            num_streams_out: 0,
            num_conns_in: 2, // over the conns_in cap
            num_conns_out: 0,
            num_fd: 0,
        };
        assert!(rc.reserve_bulk(&stat).is_err());
        assert!(rc.stat().is_empty());

        let ok = ScopeStat {
            memory: 1024,
            num_streams_in: 1,
            num_streams_out: 0,
            num_conns_in: 1,
            num_conns_out: 0,
            num_fd: 1,
        };
        rc.reserve_bulk(&ok).unwrap();
        assert_eq!(rc.stat(), ok);
        rc.release_bulk(&ok);
        assert!(rc.stat().is_empty());
    }

    #[test]
    #[should_panic(expected = "BUG: too much memory released")]
    fn negative_memory_release_panics() {
        let mut rc = Counters::new(limit());
        rc.release_memory(1);
    }

    #[test]
    #[should_panic(expected = "BUG: too many inbound streams released")]
    fn negative_stream_release_panics() {
        let mut rc = Counters::new(limit());
        rc.remove_streams(1, 0);
    }
}
