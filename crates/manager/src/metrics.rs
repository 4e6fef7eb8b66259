//! Metrics reporting hooks
//!
//! The manager notifies a [`MetricsReporter`] on every allow/block decision
//! so rejection rates are observable. Exporters (Prometheus, OTLP, logs)
//! implement the trait and are plugged in at construction; the core carries
//! no exporter of its own.

use peermit_types::{Direction, PeerId, ProtocolId};
use std::sync::Arc;

/// Sink for resource manager allow/block signals.
///
/// All methods default to no-ops so reporters only override the signals
/// they care about.
#[allow(unused_variables)]
pub trait MetricsReporter: Send + Sync {
    /// Invoked when opening a connection is allowed.
    fn allow_conn(&self, dir: Direction, use_fd: bool) {}
    /// Invoked when opening a connection is blocked.
    fn block_conn(&self, dir: Direction, use_fd: bool) {}

    /// Invoked when opening a stream is allowed.
    fn allow_stream(&self, peer: &PeerId, dir: Direction) {}
    /// Invoked when opening a stream is blocked.
    fn block_stream(&self, peer: &PeerId, dir: Direction) {}

    /// Invoked when attaching a connection to a peer is allowed.
    fn allow_peer(&self, peer: &PeerId) {}
    /// Invoked when attaching a connection to a peer is blocked.
    fn block_peer(&self, peer: &PeerId) {}

    /// Invoked when setting the protocol for a stream is allowed.
    fn allow_protocol(&self, proto: &ProtocolId) {}
    /// Invoked when setting the protocol for a stream is blocked.
    fn block_protocol(&self, proto: &ProtocolId) {}
    /// Invoked when the per-protocol peer scope blocks the attachment.
    fn block_protocol_peer(&self, proto: &ProtocolId, peer: &PeerId) {}

    /// Invoked when setting the service for a stream is allowed.
    fn allow_service(&self, svc: &str) {}
    /// Invoked when setting the service for a stream is blocked.
    fn block_service(&self, svc: &str) {}
    /// Invoked when the per-service peer scope blocks the attachment.
    fn block_service_peer(&self, svc: &str, peer: &PeerId) {}

    /// Invoked when a memory reservation is allowed.
    fn allow_memory(&self, size: i64) {}
    /// Invoked when a memory reservation is blocked.
    fn block_memory(&self, size: i64) {}
}

/// Fans every signal out to multiple reporters.
#[derive(Default)]
pub struct MultiMetricsReporter {
    reporters: Vec<Arc<dyn MetricsReporter>>,
}

impl MultiMetricsReporter {
    #[must_use]
    pub fn new(reporters: Vec<Arc<dyn MetricsReporter>>) -> Self {
        Self { reporters }
    }

    pub fn push(&mut self, reporter: Arc<dyn MetricsReporter>) {
        self.reporters.push(reporter);
    }
}

impl MetricsReporter for MultiMetricsReporter {
    fn allow_conn(&self, dir: Direction, use_fd: bool) {
        for r in &self.reporters {
            r.allow_conn(dir, use_fd);
        }
    }

    fn block_conn(&self, dir: Direction, use_fd: bool) {
        for r in &self.reporters {
            r.block_conn(dir, use_fd);
        }
    }

    fn allow_stream(&self, peer: &PeerId, dir: Direction) {
        for r in &self.reporters {
            r.allow_stream(peer, dir);
        }
    }

    fn block_stream(&self, peer: &PeerId, dir: Direction) {
        for r in &self.reporters {
            r.block_stream(peer, dir);
        }
    }

    fn allow_peer(&self, peer: &PeerId) {
        for r in &self.reporters {
            r.allow_peer(peer);
        }
    }

    fn block_peer(&self, peer: &PeerId) {
        for r in &self.reporters {
            r.block_peer(peer);
        }
    }

    fn allow_protocol(&self, proto: &ProtocolId) {
        for r in &self.reporters {
            r.allow_protocol(proto);
        }
    }

    fn block_protocol(&self, proto: &ProtocolId) {
        for r in &self.reporters {
            r.block_protocol(proto);
        }
    }

    fn block_protocol_peer(&self, proto: &ProtocolId, peer: &PeerId) {
        for r in &self.reporters {
            r.block_protocol_peer(proto, peer);
        }
    }

    fn allow_service(&self, svc: &str) {
        for r in &self.reporters {
            r.allow_service(svc);
        }
    }

    fn block_service(&self, svc: &str) {
        for r in &self.reporters {
            r.block_service(svc);
        }
    }

    fn block_service_peer(&self, svc: &str, peer: &PeerId) {
        for r in &self.reporters {
            r.block_service_peer(svc, peer);
        }
    }

    fn allow_memory(&self, size: i64) {
        for r in &self.reporters {
            r.allow_memory(size);
        }
    }

    fn block_memory(&self, size: i64) {
        for r in &self.reporters {
            r.block_memory(size);
        }
    }
}

/// Cheap cloneable handle; a disabled handle swallows every signal.
#[derive(Clone, Default)]
pub(crate) struct MetricsHandle {
    reporter: Option<Arc<dyn MetricsReporter>>,
}

impl MetricsHandle {
    pub(crate) fn new(reporter: Option<Arc<dyn MetricsReporter>>) -> Self {
        Self { reporter }
    }

    pub(crate) fn allow_conn(&self, dir: Direction, use_fd: bool) {
        if let Some(r) = &self.reporter {
            r.allow_conn(dir, use_fd);
        }
    }

    pub(crate) fn block_conn(&self, dir: Direction, use_fd: bool) {
        if let Some(r) = &self.reporter {
            r.block_conn(dir, use_fd);
        }
    }

    pub(crate) fn allow_stream(&self, peer: &PeerId, dir: Direction) {
        if let Some(r) = &self.reporter {
            r.allow_stream(peer, dir);
        }
    }

    pub(crate) fn block_stream(&self, peer: &PeerId, dir: Direction) {
        if let Some(r) = &self.reporter {
            r.block_stream(peer, dir);
        }
    }

    pub(crate) fn allow_peer(&self, peer: &PeerId) {
        if let Some(r) = &self.reporter {
            r.allow_peer(peer);
        }
    }

    pub(crate) fn block_peer(&self, peer: &PeerId) {
        if let Some(r) = &self.reporter {
            r.block_peer(peer);
        }
    }

    pub(crate) fn allow_protocol(&self, proto: &ProtocolId) {
        if let Some(r) = &self.reporter {
            r.allow_protocol(proto);
        }
    }

    pub(crate) fn block_protocol(&self, proto: &ProtocolId) {
        if let Some(r) = &self.reporter {
            r.block_protocol(proto);
        }
    }

    pub(crate) fn block_protocol_peer(&self, proto: &ProtocolId, peer: &PeerId) {
        if let Some(r) = &self.reporter {
            r.block_protocol_peer(proto, peer);
        }
    }

    pub(crate) fn allow_service(&self, svc: &str) {
        if let Some(r) = &self.reporter {
            r.allow_service(svc);
        }
    }

    pub(crate) fn block_service(&self, svc: &str) {
        if let Some(r) = &self.reporter {
            r.block_service(svc);
        }
    }

    pub(crate) fn block_service_peer(&self, svc: &str, peer: &PeerId) {
        if let Some(r) = &self.reporter {
            r.block_service_peer(svc, peer);
        }
    }

    pub(crate) fn allow_memory(&self, size: i64) {
        if let Some(r) = &self.reporter {
            r.allow_memory(size);
        }
    }

    pub(crate) fn block_memory(&self, size: i64) {
        if let Some(r) = &self.reporter {
            r.block_memory(size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingReporter {
        allowed: AtomicUsize,
        blocked: AtomicUsize,
    }

    impl MetricsReporter for CountingReporter {
        fn allow_memory(&self, _size: i64) {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        }

        fn block_memory(&self, _size: i64) {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn multi_reporter_fans_out() {
        let a = Arc::new(CountingReporter::default());
        let b = Arc::new(CountingReporter::default());
        let multi = MultiMetricsReporter::new(vec![a.clone(), b.clone()]);

        multi.allow_memory(1);
        multi.allow_memory(1);
        multi.block_memory(1);

        for r in [&a, &b] {
            assert_eq!(r.allowed.load(Ordering::Relaxed), 2);
            assert_eq!(r.blocked.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn disabled_handle_is_a_noop() {
        let handle = MetricsHandle::default();
        handle.allow_memory(1);
        handle.block_conn(Direction::Inbound, true);
    }
}
