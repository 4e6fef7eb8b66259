//! Stream scopes

use crate::manager::ManagerInner;
use crate::scope::ResourceScope;
use peermit_errors::{Error, ResourceError};
use peermit_types::{Direction, MemoryPressure, PeerId, ProtocolId, ScopeStat};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct StreamAttach {
    proto: Option<Arc<ResourceScope>>,
    proto_peer: Option<Arc<ResourceScope>>,
    svc: Option<Arc<ResourceScope>>,
    svc_peer: Option<Arc<ResourceScope>>,
}

/// Accounting scope for one stream.
///
/// A stream is opened against a peer and charged to the transient tree
/// until [`set_protocol`](Self::set_protocol) attaches it to a protocol;
/// [`set_service`](Self::set_service) can then move it onto a service.
/// Dropping the scope completes it.
pub struct StreamScope {
    pub(crate) scope: Arc<ResourceScope>,
    pub(crate) dir: Direction,
    pub(crate) peer_id: PeerId,
    pub(crate) peer: Arc<ResourceScope>,
    pub(crate) mgr: Arc<ManagerInner>,
    attach: Mutex<StreamAttach>,
}

impl StreamScope {
    pub(crate) fn new(
        scope: Arc<ResourceScope>,
        dir: Direction,
        peer_id: PeerId,
        peer: Arc<ResourceScope>,
        mgr: Arc<ManagerInner>,
    ) -> Self {
        Self {
            scope,
            dir,
            peer_id,
            peer,
            mgr,
            attach: Mutex::new(StreamAttach::default()),
        }
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.dir
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.scope.name()
    }

    #[must_use]
    pub fn stat(&self) -> ScopeStat {
        self.scope.stat()
    }

    #[must_use]
    pub fn peer_scope(&self) -> Arc<ResourceScope> {
        Arc::clone(&self.peer)
    }

    /// The protocol scope this stream is charged to. `None` before
    /// `set_protocol` and again after `set_service` moves the charge on.
    #[must_use]
    pub fn protocol_scope(&self) -> Option<Arc<ResourceScope>> {
        self.lock_attach().proto.clone()
    }

    /// The service scope this stream is charged to, once `set_service` has
    /// succeeded.
    #[must_use]
    pub fn service_scope(&self) -> Option<Arc<ResourceScope>> {
        self.lock_attach().svc.clone()
    }

    /// Reserve memory against this stream and its parent chain.
    ///
    /// # Errors
    ///
    /// See [`ResourceScope::reserve_memory`].
    pub fn reserve_memory(&self, size: i64) -> Result<MemoryPressure, Error> {
        self.scope.reserve_memory(size)
    }

    pub fn release_memory(&self, size: i64) {
        self.scope.release_memory(size);
    }

    /// Start a transaction sub-scope on this stream.
    ///
    /// # Errors
    ///
    /// See [`ResourceScope::begin_transaction`].
    pub fn begin_transaction(&self) -> Result<Arc<ResourceScope>, Error> {
        self.scope.begin_transaction()
    }

    fn lock_attach(&self) -> MutexGuard<'_, StreamAttach> {
        self.attach.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach the stream to a protocol.
    ///
    /// The stream's usage moves from the transient scope onto the protocol
    /// scope and the per-protocol peer scope; on failure the transient chain
    /// remains charged as before.
    ///
    /// # Errors
    ///
    /// [`ResourceError::AlreadyAttached`] on a second call or after
    /// `set_service`, [`ResourceError::LimitExceeded`] when either target
    /// scope refuses the usage, and [`ResourceError::ScopeClosed`] when the
    /// stream is done.
    pub fn set_protocol(&self, proto: &ProtocolId) -> Result<(), Error> {
        let mut attach = self.lock_attach();
        if attach.proto.is_some() || attach.svc.is_some() {
            return Err(ResourceError::AlreadyAttached {
                scope: self.scope.name().to_string(),
                what: "protocol".to_string(),
            }
            .into());
        }

        let proto_scope = self.mgr.get_protocol_scope(proto);
        let proto_peer_scope = self.mgr.get_protocol_peer_scope(proto, &self.peer_id);

        let mut st = self.scope.lock_state();
        if st.done {
            drop(st);
            proto_scope.dec_ref();
            proto_peer_scope.dec_ref();
            return Err(ResourceError::ScopeClosed {
                scope: self.scope.name().to_string(),
            }
            .into());
        }

        let stat = st.counters.stat();
        if let Err(e) = proto_scope.reserve_for_child(&stat) {
            drop(st);
            proto_scope.dec_ref();
            proto_peer_scope.dec_ref();
            self.mgr.metrics.block_protocol(proto);
            return Err(e);
        }
        if let Err(e) = proto_peer_scope.reserve_for_child(&stat) {
            proto_scope.release_for_child(&stat);
            drop(st);
            proto_scope.dec_ref();
            proto_peer_scope.dec_ref();
            self.mgr.metrics.block_protocol_peer(proto, &self.peer_id);
            return Err(e);
        }

        self.mgr.transient.release_for_child(&stat);
        self.mgr.transient.dec_ref();
        st.constraints = vec![
            Arc::clone(&self.peer),
            Arc::clone(&proto_peer_scope),
            Arc::clone(&proto_scope),
            Arc::clone(&self.mgr.system),
        ];
        drop(st);

        attach.proto = Some(proto_scope);
        attach.proto_peer = Some(proto_peer_scope);
        self.mgr.metrics.allow_protocol(proto);
        Ok(())
    }

    /// Attach the stream to a service.
    ///
    /// Requires a protocol attachment. The stream's usage moves onto the
    /// service scope and the per-service peer scope; the protocol scopes are
    /// released and leave the constraint chain. On failure the stream stays
    /// attached to its protocol and remains chargeable there.
    ///
    /// # Errors
    ///
    /// [`ResourceError::AlreadyAttached`] on a second call,
    /// [`ResourceError::InvalidTransition`] before `set_protocol`,
    /// [`ResourceError::LimitExceeded`] when either target scope refuses the
    /// usage, and [`ResourceError::ScopeClosed`] when the stream is done.
    pub fn set_service(&self, svc: &str) -> Result<(), Error> {
        let mut attach = self.lock_attach();
        if attach.svc.is_some() {
            return Err(ResourceError::AlreadyAttached {
                scope: self.scope.name().to_string(),
                what: "service".to_string(),
            }
            .into());
        }
        let (Some(proto_scope), Some(proto_peer_scope)) =
            (attach.proto.clone(), attach.proto_peer.clone())
        else {
            return Err(ResourceError::InvalidTransition {
                scope: self.scope.name().to_string(),
                message: "stream must be attached to a protocol before a service".to_string(),
            }
            .into());
        };

        let svc_scope = self.mgr.get_service_scope(svc);
        let svc_peer_scope = self.mgr.get_service_peer_scope(svc, &self.peer_id);

        let mut st = self.scope.lock_state();
        if st.done {
            drop(st);
            svc_scope.dec_ref();
            svc_peer_scope.dec_ref();
            return Err(ResourceError::ScopeClosed {
                scope: self.scope.name().to_string(),
            }
            .into());
        }

        let stat = st.counters.stat();
        if let Err(e) = svc_scope.reserve_for_child(&stat) {
            drop(st);
            svc_scope.dec_ref();
            svc_peer_scope.dec_ref();
            self.mgr.metrics.block_service(svc);
            return Err(e);
        }
        if let Err(e) = svc_peer_scope.reserve_for_child(&stat) {
            svc_scope.release_for_child(&stat);
            drop(st);
            svc_scope.dec_ref();
            svc_peer_scope.dec_ref();
            self.mgr.metrics.block_service_peer(svc, &self.peer_id);
            return Err(e);
        }

        // the protocol chain is left behind once the service accepts
        proto_peer_scope.release_for_child(&stat);
        proto_peer_scope.dec_ref();
        proto_scope.release_for_child(&stat);
        proto_scope.dec_ref();
        st.constraints = vec![
            Arc::clone(&self.peer),
            Arc::clone(&svc_peer_scope),
            Arc::clone(&svc_scope),
            Arc::clone(&self.mgr.system),
        ];
        drop(st);

        attach.proto = None;
        attach.proto_peer = None;
        attach.svc = Some(svc_scope);
        attach.svc_peer = Some(svc_peer_scope);
        self.mgr.metrics.allow_service(svc);
        Ok(())
    }

    /// Complete the scope, returning everything it holds. Idempotent.
    pub fn done(&self) {
        self.scope.done();
    }
}

impl Drop for StreamScope {
    fn drop(&mut self) {
        self.scope.done();
    }
}
