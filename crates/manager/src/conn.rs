//! Connection scopes

use crate::manager::ManagerInner;
use crate::scope::ResourceScope;
use peermit_errors::{Error, ResourceError};
use peermit_types::{Direction, MemoryPressure, Multiaddr, PeerId, ScopeStat};
use std::sync::{Arc, Mutex, PoisonError};

/// Accounting scope for one connection.
///
/// A fresh connection is charged to the transient tree until
/// [`set_peer`](Self::set_peer) attaches it to its remote identity, at which
/// point the usage moves from the transient scope onto the peer scope.
/// Dropping the scope completes it.
pub struct ConnScope {
    pub(crate) scope: Arc<ResourceScope>,
    pub(crate) dir: Direction,
    pub(crate) use_fd: bool,
    pub(crate) endpoint: Multiaddr,
    pub(crate) allowlisted: bool,
    pub(crate) system: Arc<ResourceScope>,
    pub(crate) transient: Arc<ResourceScope>,
    pub(crate) mgr: Arc<ManagerInner>,
    pub(crate) peer: Mutex<Option<Arc<ResourceScope>>>,
}

impl std::fmt::Debug for ConnScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnScope")
            .field("dir", &self.dir)
            .field("use_fd", &self.use_fd)
            .field("endpoint", &self.endpoint)
            .field("allowlisted", &self.allowlisted)
            .finish_non_exhaustive()
    }
}

impl ConnScope {
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.dir
    }

    #[must_use]
    pub fn uses_fd(&self) -> bool {
        self.use_fd
    }

    #[must_use]
    pub fn endpoint(&self) -> &Multiaddr {
        &self.endpoint
    }

    /// Whether this connection was admitted through the allowlisted tree.
    #[must_use]
    pub fn is_allowlisted(&self) -> bool {
        self.allowlisted
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.scope.name()
    }

    #[must_use]
    pub fn stat(&self) -> ScopeStat {
        self.scope.stat()
    }

    /// The peer scope this connection is attached to, if any.
    #[must_use]
    pub fn peer_scope(&self) -> Option<Arc<ResourceScope>> {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reserve memory against this connection and its parent chain.
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

    /// Start a transaction sub-scope on this connection.
    ///
    /// # Errors
    ///
    /// See [`ResourceScope::begin_transaction`].
    pub fn begin_transaction(&self) -> Result<Arc<ResourceScope>, Error> {
        self.scope.begin_transaction()
    }

    /// Attach the connection to its now-known remote identity.
    ///
    /// The connection's usage is withdrawn from the transient scope and
    /// reserved on the peer scope; on failure the transient chain remains
    /// charged as before. Connections admitted through the allowlist
    /// additionally require the peer to be covered by a matching entry.
    ///
    /// # Errors
    ///
    /// [`ResourceError::AlreadyAttached`] on a second call,
    /// [`ResourceError::AllowlistRejected`] when a gated entry does not
    /// confirm the peer, [`ResourceError::LimitExceeded`] when the peer
    /// scope refuses the usage, and [`ResourceError::ScopeClosed`] when the
    /// connection is done.
    pub fn set_peer(&self, peer: &PeerId) -> Result<(), Error> {
        let mut attached = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        if attached.is_some() {
            return Err(ResourceError::AlreadyAttached {
                scope: self.scope.name().to_string(),
                what: "peer".to_string(),
            }
            .into());
        }

        if self.allowlisted && !self.mgr.allowlist.allowed_peer_and_addr(peer, &self.endpoint) {
            self.mgr.metrics.block_peer(peer);
            return Err(ResourceError::AllowlistRejected {
                peer: peer.to_string(),
                addr: self.endpoint.to_string(),
            }
            .into());
        }

        let peer_scope = self.mgr.get_peer_scope(peer);

        // The stat snapshot and the constraint swap must be one atomic step
        // with respect to this leaf, so the lock is held across the move.
        let mut st = self.scope.lock_state();
        if st.done {
            drop(st);
            peer_scope.dec_ref();
            return Err(ResourceError::ScopeClosed {
                scope: self.scope.name().to_string(),
            }
            .into());
        }

        let stat = st.counters.stat();
        if let Err(e) = peer_scope.reserve_for_child(&stat) {
            drop(st);
            peer_scope.dec_ref();
            self.mgr.metrics.block_peer(peer);
            return Err(e);
        }

        self.transient.release_for_child(&stat);
        self.transient.dec_ref();
        st.constraints = vec![Arc::clone(&peer_scope), Arc::clone(&self.system)];
        drop(st);

        *attached = Some(peer_scope);
        self.mgr.metrics.allow_peer(peer);
        Ok(())
    }

    /// Complete the scope, returning everything it holds. Idempotent.
    pub fn done(&self) {
        self.scope.done();
    }
}

impl Drop for ConnScope {
    fn drop(&mut self) {
        self.scope.done();
    }
}
