//! Accounting scopes
//!
//! A [`ResourceScope`] is one node in the accounting DAG. Its constraints
//! are a linearized list of every ancestor that must accept a reservation:
//! the scope charges itself, then each constraint locally, rolling back the
//! charged prefix if any ancestor refuses. Materializing the flattened
//! ancestor list at construction keeps diamonds in the DAG from being
//! charged twice and bounds each operation's cost.
//!
//! Transaction scopes are the same type in owner mode: a single owner
//! instead of a constraints list. Propagation recurses through the owner,
//! which is expected to be a member of the DAG.

use crate::counters::Counters;
use crate::metrics::MetricsHandle;
use crate::trace::TraceHandle;
use peermit_errors::{Error, ResourceError};
use peermit_limits::Limit;
use peermit_types::{Direction, MemoryPressure, ScopeStat};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) struct ScopeState {
    pub(crate) counters: Counters,
    pub(crate) constraints: Vec<Arc<ResourceScope>>,
    pub(crate) done: bool,
    pub(crate) ref_count: i32,
}

/// A node in the resource accounting DAG.
///
/// All mutable state sits behind one mutex; within a call chain locks are
/// taken leaf first, then parent by parent along the constraints list. The
/// list is linearized and the graph acyclic, so no scope is ever locked
/// twice.
pub struct ResourceScope {
    name: String,
    limit: Limit,
    /// Set only for transaction scopes; such a scope has no constraints.
    owner: Option<Arc<ResourceScope>>,
    trace: TraceHandle,
    metrics: MetricsHandle,
    state: Mutex<ScopeState>,
}

impl std::fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceScope")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

fn dir_deltas(dir: Direction) -> (i32, i32) {
    match dir {
        Direction::Inbound => (1, 0),
        Direction::Outbound => (0, 1),
    }
}

impl ResourceScope {
    pub(crate) fn new(
        name: impl Into<String>,
        limit: Limit,
        constraints: Vec<Arc<ResourceScope>>,
        trace: TraceHandle,
        metrics: MetricsHandle,
    ) -> Arc<ResourceScope> {
        for cst in &constraints {
            cst.inc_ref();
        }
        let name = name.into();
        trace.create_scope(&name, &limit);
        Arc::new(ResourceScope {
            name,
            limit,
            owner: None,
            trace,
            metrics,
            state: Mutex::new(ScopeState {
                counters: Counters::new(limit),
                constraints,
                done: false,
                ref_count: 0,
            }),
        })
    }

    /// Start a transaction sub-scope.
    ///
    /// The transaction carries its owner's limit and propagates all of its
    /// reservations through the owner. Terminate it with [`done`](Self::done)
    /// to roll everything back at once.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::ScopeClosed`] when this scope is done.
    pub fn begin_transaction(self: &Arc<Self>) -> Result<Arc<ResourceScope>, Error> {
        {
            let mut st = self.lock_state();
            if st.done {
                return Err(self.closed());
            }
            st.ref_count += 1;
        }
        Ok(Arc::new(ResourceScope {
            name: self.name.clone(),
            limit: self.limit,
            owner: Some(Arc::clone(self)),
            trace: self.trace.clone(),
            metrics: self.metrics.clone(),
            state: Mutex::new(ScopeState {
                counters: Counters::new(self.limit),
                constraints: Vec::new(),
                done: false,
                ref_count: 0,
            }),
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn limit(&self) -> Limit {
        self.limit
    }

    #[must_use]
    pub fn stat(&self) -> ScopeStat {
        self.lock_state().counters.stat()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed(&self) -> Error {
        ResourceError::ScopeClosed {
            scope: self.name.clone(),
        }
        .into()
    }

    /// Reserve `size` bytes on this scope and every ancestor.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::ScopeClosed`] when the scope is done and
    /// [`ResourceError::LimitExceeded`] when any cap refuses; a refused
    /// reservation leaves no counter changed anywhere.
    pub fn reserve_memory(&self, size: i64) -> Result<MemoryPressure, Error> {
        let mut st = self.lock_state();
        if st.done {
            return Err(self.closed());
        }

        let local = match st.counters.reserve_memory(size) {
            Ok(level) => level,
            Err(e) => {
                self.trace
                    .block_reserve_memory(&self.name, size, st.counters.memory());
                if size != 0 {
                    self.metrics.block_memory(size);
                }
                return Err(e.with_scope(&self.name).into());
            }
        };

        match self.reserve_memory_for_edges(&st, size) {
            Ok(edges) => {
                let level = local.combine(edges);
                self.trace
                    .reserve_memory(&self.name, level, size, st.counters.memory());
                if size != 0 {
                    self.metrics.allow_memory(size);
                }
                Ok(level)
            }
            Err(e) => {
                st.counters.release_memory(size);
                self.trace
                    .block_reserve_memory(&self.name, size, st.counters.memory());
                if size != 0 {
                    self.metrics.block_memory(size);
                }
                Err(e)
            }
        }
    }

    fn reserve_memory_for_edges(
        &self,
        st: &ScopeState,
        size: i64,
    ) -> Result<MemoryPressure, Error> {
        if let Some(owner) = &self.owner {
            return owner.reserve_memory(size);
        }

        let mut level = MemoryPressure::Ok;
        let mut charged = 0;
        let mut failure = None;
        for cst in &st.constraints {
            match cst.reserve_memory_for_child(size) {
                Ok(l) => {
                    level = level.combine(l);
                    charged += 1;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for cst in &st.constraints[..charged] {
                cst.release_memory_for_child(size);
            }
            return Err(err);
        }
        Ok(level)
    }

    /// Reserve on local counters only; the recursion step of constraint
    /// propagation. The caller's linearized list covers this scope's own
    /// ancestors.
    fn reserve_memory_for_child(&self, size: i64) -> Result<MemoryPressure, Error> {
        let mut st = self.lock_state();
        if st.done {
            return Err(self.closed());
        }
        st.counters
            .reserve_memory(size)
            .map_err(|e| e.with_scope(&self.name).into())
    }

    /// Release `size` bytes here and on every ancestor. No-op after done.
    pub fn release_memory(&self, size: i64) {
        let mut st = self.lock_state();
        if st.done {
            return;
        }
        st.counters.release_memory(size);
        self.release_memory_for_edges(&st, size);
        self.trace
            .release_memory(&self.name, size, st.counters.memory());
    }

    fn release_memory_for_edges(&self, st: &ScopeState, size: i64) {
        if let Some(owner) = &self.owner {
            owner.release_memory(size);
            return;
        }
        for cst in &st.constraints {
            cst.release_memory_for_child(size);
        }
    }

    fn release_memory_for_child(&self, size: i64) {
        let mut st = self.lock_state();
        if st.done {
            return;
        }
        st.counters.release_memory(size);
    }

    pub(crate) fn add_stream(&self, dir: Direction) -> Result<(), Error> {
        let (inc_in, inc_out) = dir_deltas(dir);
        let mut st = self.lock_state();
        if st.done {
            return Err(self.closed());
        }

        if let Err(e) = st.counters.add_streams(inc_in, inc_out) {
            let (nin, nout) = st.counters.streams();
            self.trace.block_add_stream(&self.name, dir, nin, nout);
            return Err(e.with_scope(&self.name).into());
        }

        if let Err(e) = self.add_stream_for_edges(&st, dir) {
            st.counters.remove_streams(inc_in, inc_out);
            let (nin, nout) = st.counters.streams();
            self.trace.block_add_stream(&self.name, dir, nin, nout);
            return Err(e);
        }

        let (nin, nout) = st.counters.streams();
        self.trace.add_stream(&self.name, dir, nin, nout);
        Ok(())
    }

    fn add_stream_for_edges(&self, st: &ScopeState, dir: Direction) -> Result<(), Error> {
        if let Some(owner) = &self.owner {
            return owner.add_stream(dir);
        }

        let mut charged = 0;
        let mut failure = None;
        for cst in &st.constraints {
            match cst.add_stream_for_child(dir) {
                Ok(()) => charged += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for cst in &st.constraints[..charged] {
                cst.remove_stream_for_child(dir);
            }
            return Err(err);
        }
        Ok(())
    }

    fn add_stream_for_child(&self, dir: Direction) -> Result<(), Error> {
        let (inc_in, inc_out) = dir_deltas(dir);
        let mut st = self.lock_state();
        if st.done {
            return Err(self.closed());
        }
        st.counters
            .add_streams(inc_in, inc_out)
            .map_err(|e| e.with_scope(&self.name).into())
    }

    pub(crate) fn remove_stream(&self, dir: Direction) {
        let (dec_in, dec_out) = dir_deltas(dir);
        let mut st = self.lock_state();
        if st.done {
            return;
        }
        st.counters.remove_streams(dec_in, dec_out);
        self.remove_stream_for_edges(&st, dir);
        let (nin, nout) = st.counters.streams();
        self.trace.remove_stream(&self.name, dir, nin, nout);
    }

    fn remove_stream_for_edges(&self, st: &ScopeState, dir: Direction) {
        if let Some(owner) = &self.owner {
            owner.remove_stream(dir);
            return;
        }
        for cst in &st.constraints {
            cst.remove_stream_for_child(dir);
        }
    }

    fn remove_stream_for_child(&self, dir: Direction) {
        let (dec_in, dec_out) = dir_deltas(dir);
        let mut st = self.lock_state();
        if st.done {
            return;
        }
        st.counters.remove_streams(dec_in, dec_out);
    }

    pub(crate) fn add_conn(&self, dir: Direction, use_fd: bool) -> Result<(), Error> {
        let (inc_in, inc_out) = dir_deltas(dir);
        let fd = i32::from(use_fd);
        let mut st = self.lock_state();
        if st.done {
            return Err(self.closed());
        }

        if let Err(e) = st.counters.add_conns(inc_in, inc_out, fd) {
            let (nin, nout) = st.counters.conns();
            self.trace
                .block_add_conn(&self.name, dir, use_fd, nin, nout, st.counters.fd());
            return Err(e.with_scope(&self.name).into());
        }

        if let Err(e) = self.add_conn_for_edges(&st, dir, use_fd) {
            st.counters.remove_conns(inc_in, inc_out, fd);
            let (nin, nout) = st.counters.conns();
            self.trace
                .block_add_conn(&self.name, dir, use_fd, nin, nout, st.counters.fd());
            return Err(e);
        }

        let (nin, nout) = st.counters.conns();
        self.trace
            .add_conn(&self.name, dir, use_fd, nin, nout, st.counters.fd());
        Ok(())
    }

    fn add_conn_for_edges(&self, st: &ScopeState, dir: Direction, use_fd: bool) -> Result<(), Error> {
        if let Some(owner) = &self.owner {
            return owner.add_conn(dir, use_fd);
        }

        let mut charged = 0;
        let mut failure = None;
        for cst in &st.constraints {
            match cst.add_conn_for_child(dir, use_fd) {
                Ok(()) => charged += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for cst in &st.constraints[..charged] {
                cst.remove_conn_for_child(dir, use_fd);
            }
            return Err(err);
        }
        Ok(())
    }

    fn add_conn_for_child(&self, dir: Direction, use_fd: bool) -> Result<(), Error> {
        let (inc_in, inc_out) = dir_deltas(dir);
        let mut st = self.lock_state();
        if st.done {
            return Err(self.closed());
        }
        st.counters
            .add_conns(inc_in, inc_out, i32::from(use_fd))
            .map_err(|e| e.with_scope(&self.name).into())
    }

    pub(crate) fn remove_conn(&self, dir: Direction, use_fd: bool) {
        let (dec_in, dec_out) = dir_deltas(dir);
        let mut st = self.lock_state();
        if st.done {
            return;
        }
        st.counters.remove_conns(dec_in, dec_out, i32::from(use_fd));
        self.remove_conn_for_edges(&st, dir, use_fd);
        let (nin, nout) = st.counters.conns();
        self.trace
            .remove_conn(&self.name, dir, use_fd, nin, nout, st.counters.fd());
    }

    fn remove_conn_for_edges(&self, st: &ScopeState, dir: Direction, use_fd: bool) {
        if let Some(owner) = &self.owner {
            owner.remove_conn(dir, use_fd);
            return;
        }
        for cst in &st.constraints {
            cst.remove_conn_for_child(dir, use_fd);
        }
    }

    fn remove_conn_for_child(&self, dir: Direction, use_fd: bool) {
        let (dec_in, dec_out) = dir_deltas(dir);
        let mut st = self.lock_state();
        if st.done {
            return;
        }
        st.counters.remove_conns(dec_in, dec_out, i32::from(use_fd));
    }

    /// Reserve a whole usage snapshot on local counters, all or nothing.
    /// Used when a leaf moves onto a new parent chain.
    pub(crate) fn reserve_for_child(&self, stat: &ScopeStat) -> Result<(), Error> {
        let mut st = self.lock_state();
        if st.done {
            return Err(self.closed());
        }
        st.counters
            .reserve_bulk(stat)
            .map_err(|e| e.with_scope(&self.name).into())
    }

    /// Release a usage snapshot from local counters. No-op after done.
    pub(crate) fn release_for_child(&self, stat: &ScopeStat) {
        let mut st = self.lock_state();
        if st.done {
            return;
        }
        st.counters.release_bulk(stat);
    }

    /// Release a usage snapshot here and along the parent chain. This is the
    /// owner-mode counterpart of `release_for_child`: transaction owners
    /// must pass the release on to their own ancestors.
    pub(crate) fn release_resources(&self, stat: &ScopeStat) {
        let mut st = self.lock_state();
        if st.done {
            return;
        }
        st.counters.release_bulk(stat);
        if let Some(owner) = &self.owner {
            owner.release_resources(stat);
        } else {
            for cst in &st.constraints {
                cst.release_for_child(stat);
            }
        }
    }

    /// Complete the scope: return everything it holds to its parents, zero
    /// the counters, and reject all further operations. Idempotent.
    pub fn done(&self) {
        let mut st = self.lock_state();
        if st.done {
            return;
        }

        let stat = st.counters.stat();
        if let Some(owner) = &self.owner {
            owner.release_resources(&stat);
            owner.dec_ref();
        } else {
            for cst in &st.constraints {
                cst.release_for_child(&stat);
                cst.dec_ref();
            }
        }

        st.counters.zero();
        st.done = true;
        self.trace.destroy_scope(&self.name);
    }

    pub(crate) fn inc_ref(&self) {
        self.lock_state().ref_count += 1;
    }

    pub(crate) fn dec_ref(&self) {
        let mut st = self.lock_state();
        st.ref_count -= 1;
        assert!(
            st.ref_count >= 0,
            "BUG: released too many references on scope {}",
            self.name
        );
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> i32 {
        self.lock_state().ref_count
    }

    /// A scope is unused when it is done, or when nothing references it and
    /// it holds no resources. Only unused scopes may be garbage collected.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        let st = self.lock_state();
        if st.done {
            return true;
        }
        if st.ref_count > 0 {
            return false;
        }
        st.counters.stat().is_empty()
    }
}
