//! The resource manager
//!
//! Owns the root scopes, the lazily populated per-service / per-protocol /
//! per-peer scope directories, and the factories for connection and stream
//! scopes. A background task reclaims directory scopes once they become
//! unused.

use crate::allowlist::Allowlist;
use crate::conn::ConnScope;
use crate::metrics::{MetricsHandle, MetricsReporter, MultiMetricsReporter};
use crate::scope::ResourceScope;
use crate::stream::StreamScope;
use crate::trace::{TraceEmitter, TraceHandle};
use peermit_errors::Error;
use peermit_limits::LimitTable;
use peermit_types::{Direction, Multiaddr, PeerId, ProtocolId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Directories {
    svc: HashMap<String, Arc<ResourceScope>>,
    proto: HashMap<ProtocolId, Arc<ResourceScope>>,
    peer: HashMap<PeerId, Arc<ResourceScope>>,
    svc_peer: HashMap<(String, PeerId), Arc<ResourceScope>>,
    proto_peer: HashMap<(ProtocolId, PeerId), Arc<ResourceScope>>,
}

pub(crate) struct ManagerInner {
    pub(crate) limits: LimitTable,
    pub(crate) trace: TraceHandle,
    pub(crate) metrics: MetricsHandle,
    pub(crate) allowlist: Arc<Allowlist>,
    pub(crate) system: Arc<ResourceScope>,
    pub(crate) transient: Arc<ResourceScope>,
    pub(crate) allowlisted_system: Arc<ResourceScope>,
    pub(crate) allowlisted_transient: Arc<ResourceScope>,
    dirs: Mutex<Directories>,
    next_conn_id: AtomicU64,
    next_stream_id: AtomicU64,
}

impl ManagerInner {
    fn lock_dirs(&self) -> MutexGuard<'_, Directories> {
        self.dirs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up or create the scope for a peer. The returned scope carries a
    /// reference the caller must balance with `dec_ref` (directly, or by
    /// handing it to a leaf's constraint list).
    pub(crate) fn get_peer_scope(&self, peer: &PeerId) -> Arc<ResourceScope> {
        let mut dirs = self.lock_dirs();
        let scope = dirs.peer.entry(peer.clone()).or_insert_with(|| {
            ResourceScope::new(
                format!("peer:{peer}"),
                self.limits.peer_limit(peer),
                vec![Arc::clone(&self.system)],
                self.trace.clone(),
                self.metrics.clone(),
            )
        });
        scope.inc_ref();
        Arc::clone(scope)
    }

    pub(crate) fn get_service_scope(&self, svc: &str) -> Arc<ResourceScope> {
        let mut dirs = self.lock_dirs();
        let scope = Self::service_entry(
            &mut dirs,
            svc,
            &self.limits,
            &self.system,
            &self.trace,
            &self.metrics,
        );
        scope.inc_ref();
        Arc::clone(scope)
    }

    fn service_entry<'a>(
        dirs: &'a mut Directories,
        svc: &str,
        limits: &LimitTable,
        system: &Arc<ResourceScope>,
        trace: &TraceHandle,
        metrics: &MetricsHandle,
    ) -> &'a Arc<ResourceScope> {
        dirs.svc.entry(svc.to_string()).or_insert_with(|| {
            ResourceScope::new(
                format!("service:{svc}"),
                limits.service_limit(svc),
                vec![Arc::clone(system)],
                trace.clone(),
                metrics.clone(),
            )
        })
    }

    pub(crate) fn get_service_peer_scope(&self, svc: &str, peer: &PeerId) -> Arc<ResourceScope> {
        let mut dirs = self.lock_dirs();
        let parent = Arc::clone(Self::service_entry(
            &mut dirs,
            svc,
            &self.limits,
            &self.system,
            &self.trace,
            &self.metrics,
        ));
        let scope = dirs
            .svc_peer
            .entry((svc.to_string(), peer.clone()))
            .or_insert_with(|| {
                ResourceScope::new(
                    format!("service:{svc}.peer:{peer}"),
                    self.limits.service_peer_limit(svc),
                    vec![parent, Arc::clone(&self.system)],
                    self.trace.clone(),
                    self.metrics.clone(),
                )
            });
        scope.inc_ref();
        Arc::clone(scope)
    }

    pub(crate) fn get_protocol_scope(&self, proto: &ProtocolId) -> Arc<ResourceScope> {
        let mut dirs = self.lock_dirs();
        let scope = Self::protocol_entry(
            &mut dirs,
            proto,
            &self.limits,
            &self.system,
            &self.trace,
            &self.metrics,
        );
        scope.inc_ref();
        Arc::clone(scope)
    }

    fn protocol_entry<'a>(
        dirs: &'a mut Directories,
        proto: &ProtocolId,
        limits: &LimitTable,
        system: &Arc<ResourceScope>,
        trace: &TraceHandle,
        metrics: &MetricsHandle,
    ) -> &'a Arc<ResourceScope> {
        dirs.proto.entry(proto.clone()).or_insert_with(|| {
            ResourceScope::new(
                format!("protocol:{proto}"),
                limits.protocol_limit(proto),
                vec![Arc::clone(system)],
                trace.clone(),
                metrics.clone(),
            )
        })
    }

    pub(crate) fn get_protocol_peer_scope(
        &self,
        proto: &ProtocolId,
        peer: &PeerId,
    ) -> Arc<ResourceScope> {
        let mut dirs = self.lock_dirs();
        let parent = Arc::clone(Self::protocol_entry(
            &mut dirs,
            proto,
            &self.limits,
            &self.system,
            &self.trace,
            &self.metrics,
        ));
        let scope = dirs
            .proto_peer
            .entry((proto.clone(), peer.clone()))
            .or_insert_with(|| {
                ResourceScope::new(
                    format!("protocol:{proto}.peer:{peer}"),
                    self.limits.protocol_peer_limit(proto),
                    vec![parent, Arc::clone(&self.system)],
                    self.trace.clone(),
                    self.metrics.clone(),
                )
            });
        scope.inc_ref();
        Arc::clone(scope)
    }

    fn open_connection(
        self: &Arc<Self>,
        dir: Direction,
        use_fd: bool,
        endpoint: Multiaddr,
    ) -> Result<ConnScope, Error> {
        let allowlisted = self.allowlist.allowed(&endpoint);
        let (system, transient) = if allowlisted {
            (
                Arc::clone(&self.allowlisted_system),
                Arc::clone(&self.allowlisted_transient),
            )
        } else {
            (Arc::clone(&self.system), Arc::clone(&self.transient))
        };

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let scope = ResourceScope::new(
            format!("conn-{id}"),
            self.limits.conn,
            vec![Arc::clone(&transient), Arc::clone(&system)],
            self.trace.clone(),
            self.metrics.clone(),
        );

        if let Err(e) = scope.add_conn(dir, use_fd) {
            scope.done();
            self.metrics.block_conn(dir, use_fd);
            return Err(e);
        }
        self.metrics.allow_conn(dir, use_fd);

        Ok(ConnScope {
            scope,
            dir,
            use_fd,
            endpoint,
            allowlisted,
            system,
            transient,
            mgr: Arc::clone(self),
            peer: Mutex::new(None),
        })
    }

    fn open_stream(self: &Arc<Self>, peer: &PeerId, dir: Direction) -> Result<StreamScope, Error> {
        let peer_scope = self.get_peer_scope(peer);

        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed) + 1;
        let scope = ResourceScope::new(
            format!("stream-{id}"),
            self.limits.stream,
            vec![
                Arc::clone(&peer_scope),
                Arc::clone(&self.transient),
                Arc::clone(&self.system),
            ],
            self.trace.clone(),
            self.metrics.clone(),
        );
        // the constraint list holds the live reference now
        peer_scope.dec_ref();

        if let Err(e) = scope.add_stream(dir) {
            scope.done();
            self.metrics.block_stream(peer, dir);
            return Err(e);
        }
        self.metrics.allow_stream(peer, dir);

        Ok(StreamScope::new(
            scope,
            dir,
            peer.clone(),
            peer_scope,
            Arc::clone(self),
        ))
    }

    fn gc(&self) {
        let mut dirs = self.lock_dirs();
        let mut reclaimed = 0_usize;

        dirs.proto.retain(|_, scope| {
            if scope.is_unused() {
                scope.done();
                reclaimed += 1;
                false
            } else {
                true
            }
        });

        let mut dead_peers = Vec::new();
        dirs.peer.retain(|peer, scope| {
            if scope.is_unused() {
                scope.done();
                reclaimed += 1;
                dead_peers.push(peer.clone());
                false
            } else {
                true
            }
        });

        if !dead_peers.is_empty() {
            dirs.svc_peer.retain(|(_, peer), scope| {
                if dead_peers.contains(peer) && scope.is_unused() {
                    scope.done();
                    reclaimed += 1;
                    false
                } else {
                    true
                }
            });
            dirs.proto_peer.retain(|(_, peer), scope| {
                if dead_peers.contains(peer) && scope.is_unused() {
                    scope.done();
                    reclaimed += 1;
                    false
                } else {
                    true
                }
            });
        }

        if reclaimed > 0 {
            tracing::debug!(reclaimed, "reclaimed unused resource scopes");
        }
    }
}

struct GcTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

fn spawn_gc(inner: &Arc<ManagerInner>, interval: Duration) -> GcTask {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => inner.gc(),
                _ = shutdown_rx.changed() => return,
            }
        }
    });
    GcTask { shutdown, handle }
}

/// The resource manager.
///
/// Gates acquisition of memory, streams, connections, and file descriptors
/// against a hierarchy of limit scopes. Constructed with
/// [`ResourceManager::new`] or through the [`builder`](ResourceManager::builder);
/// both must run within a tokio runtime because the garbage collector and
/// the optional trace writer are background tasks. Call
/// [`close`](ResourceManager::close) on shutdown.
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
    gc: Mutex<Option<GcTask>>,
}

impl ResourceManager {
    /// Create a manager with default options.
    ///
    /// # Errors
    ///
    /// Construction itself cannot fail without options; the `Result` matches
    /// the builder's signature.
    pub fn new(limits: LimitTable) -> Result<Self, Error> {
        ResourceManagerBuilder::new(limits).build()
    }

    #[must_use]
    pub fn builder(limits: LimitTable) -> ResourceManagerBuilder {
        ResourceManagerBuilder::new(limits)
    }

    /// Open an accounting scope for a new connection.
    ///
    /// The allowlist decides whether the connection charges the default or
    /// the allowlisted root tree; the connection is then charged to the
    /// chosen transient scope until [`ConnScope::set_peer`] runs.
    ///
    /// # Errors
    ///
    /// Returns [`peermit_errors::ResourceError::LimitExceeded`] when a cap
    /// along the chain refuses the connection.
    pub fn open_connection(
        &self,
        dir: Direction,
        use_fd: bool,
        endpoint: Multiaddr,
    ) -> Result<ConnScope, Error> {
        self.inner.open_connection(dir, use_fd, endpoint)
    }

    /// Open an accounting scope for a new stream to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`peermit_errors::ResourceError::LimitExceeded`] when a cap
    /// along the chain refuses the stream.
    pub fn open_stream(&self, peer: &PeerId, dir: Direction) -> Result<StreamScope, Error> {
        self.inner.open_stream(peer, dir)
    }

    /// Run `f` with the system scope.
    pub fn view_system<R>(&self, f: impl FnOnce(&Arc<ResourceScope>) -> R) -> R {
        f(&self.inner.system)
    }

    /// Run `f` with the transient scope.
    pub fn view_transient<R>(&self, f: impl FnOnce(&Arc<ResourceScope>) -> R) -> R {
        f(&self.inner.transient)
    }

    /// Run `f` with the scope for service `svc`, creating it on first use.
    /// The scope is referenced for the duration of the closure.
    pub fn view_service<R>(&self, svc: &str, f: impl FnOnce(&Arc<ResourceScope>) -> R) -> R {
        let scope = self.inner.get_service_scope(svc);
        let result = f(&scope);
        scope.dec_ref();
        result
    }

    /// Run `f` with the scope for protocol `proto`, creating it on first
    /// use. The scope is referenced for the duration of the closure.
    pub fn view_protocol<R>(
        &self,
        proto: &ProtocolId,
        f: impl FnOnce(&Arc<ResourceScope>) -> R,
    ) -> R {
        let scope = self.inner.get_protocol_scope(proto);
        let result = f(&scope);
        scope.dec_ref();
        result
    }

    /// Run `f` with the scope for `peer`, creating it on first use. The
    /// scope is referenced for the duration of the closure.
    pub fn view_peer<R>(&self, peer: &PeerId, f: impl FnOnce(&Arc<ResourceScope>) -> R) -> R {
        let scope = self.inner.get_peer_scope(peer);
        let result = f(&scope);
        scope.dec_ref();
        result
    }

    /// The allowlist consulted by `open_connection` and `set_peer`. Entries
    /// can be added and removed while the manager runs.
    #[must_use]
    pub fn allowlist(&self) -> &Arc<Allowlist> {
        &self.inner.allowlist
    }

    #[must_use]
    pub fn limits(&self) -> &LimitTable {
        &self.inner.limits
    }

    /// Run one garbage collection pass immediately.
    pub fn collect_garbage(&self) {
        self.inner.gc();
    }

    /// Stop the garbage collector, complete the root scopes, and flush the
    /// trace. Idempotent.
    pub async fn close(&self) {
        let task = self
            .gc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else { return };
        let _ = task.shutdown.send(true);
        let _ = task.handle.await;

        self.inner.allowlisted_transient.done();
        self.inner.allowlisted_system.done();
        self.inner.transient.done();
        self.inner.system.done();

        self.inner.trace.close().await;
    }
}

/// Builder for [`ResourceManager`].
pub struct ResourceManagerBuilder {
    limits: LimitTable,
    trace_path: Option<PathBuf>,
    reporters: Vec<Arc<dyn MetricsReporter>>,
    allowlisted_addrs: Vec<Multiaddr>,
    gc_interval: Duration,
}

impl ResourceManagerBuilder {
    #[must_use]
    pub fn new(limits: LimitTable) -> Self {
        Self {
            limits,
            trace_path: None,
            reporters: Vec::new(),
            allowlisted_addrs: Vec::new(),
            gc_interval: DEFAULT_GC_INTERVAL,
        }
    }

    /// Write a gzip-compressed NDJSON trace of every accounting transition
    /// to `path`.
    #[must_use]
    pub fn with_trace(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_path = Some(path.into());
        self
    }

    /// Register a metrics reporter. May be called multiple times; reporters
    /// compose.
    #[must_use]
    pub fn with_metrics(mut self, reporter: Arc<dyn MetricsReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    /// Seed the allowlist with trusted multiaddrs.
    #[must_use]
    pub fn with_allowlisted_multiaddrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.allowlisted_addrs.extend(addrs);
        self
    }

    /// Override the garbage collection cadence (default 60 s).
    #[must_use]
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Construct the manager and start its background tasks.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when a seeded allowlist multiaddr is invalid or the
    /// trace output file cannot be created.
    pub fn build(self) -> Result<ResourceManager, Error> {
        let Self {
            limits,
            trace_path,
            reporters,
            allowlisted_addrs,
            gc_interval,
        } = self;

        let allowlist = Arc::new(Allowlist::new());
        for addr in &allowlisted_addrs {
            allowlist.add(addr)?;
        }

        let reporter = match reporters.len() {
            0 => None,
            1 => reporters.into_iter().next(),
            _ => Some(Arc::new(MultiMetricsReporter::new(reporters)) as Arc<dyn MetricsReporter>),
        };
        let metrics = MetricsHandle::new(reporter);

        let trace = match &trace_path {
            Some(path) => TraceHandle::new(TraceEmitter::start(path, &limits)?),
            None => TraceHandle::default(),
        };

        let system = ResourceScope::new(
            "system",
            limits.system,
            Vec::new(),
            trace.clone(),
            metrics.clone(),
        );
        let transient = ResourceScope::new(
            "transient",
            limits.transient,
            vec![Arc::clone(&system)],
            trace.clone(),
            metrics.clone(),
        );
        let allowlisted_system = ResourceScope::new(
            "system",
            limits.allowlisted_system,
            Vec::new(),
            trace.clone(),
            metrics.clone(),
        );
        let allowlisted_transient = ResourceScope::new(
            "transient",
            limits.allowlisted_transient,
            vec![Arc::clone(&allowlisted_system)],
            trace.clone(),
            metrics.clone(),
        );

        let inner = Arc::new(ManagerInner {
            limits,
            trace,
            metrics,
            allowlist,
            system,
            transient,
            allowlisted_system,
            allowlisted_transient,
            dirs: Mutex::new(Directories::default()),
            next_conn_id: AtomicU64::new(0),
            next_stream_id: AtomicU64::new(0),
        });

        let gc = spawn_gc(&inner, gc_interval);

        Ok(ResourceManager {
            inner,
            gc: Mutex::new(Some(gc)),
        })
    }
}
