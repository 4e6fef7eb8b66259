#![deny(clippy::pedantic, unsafe_code)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_panics_doc // counter underflow panics signal caller bugs
)]

//! Hierarchical resource accounting for peer-to-peer hosts
//!
//! This crate tracks the resources a networking host hands out (memory
//! reservations, streams, connections, and file descriptors) and refuses
//! acquisitions that would push any scope past its configured limits. The
//! manager only knows what callers tell it: check with it before actually
//! allocating, and release through it when the resource is returned.
//!
//! Accounting is organized as a DAG of scopes. The system scope is the
//! root; the transient scope holds connections and streams that have not
//! yet been attached to a peer, protocol, or service; per-peer,
//! per-protocol, and per-service scopes are created lazily and reclaimed by
//! a background garbage collector once unused. An allowlist of trusted
//! networks routes privileged remotes onto a separate root tree with its
//! own limits.
//!
//! ```no_run
//! use peermit_manager::{Direction, Multiaddr, PeerId, ResourceManager};
//! use peermit_manager::default_table;
//!
//! # async fn example() -> Result<(), peermit_manager::Error> {
//! let mgr = ResourceManager::new(default_table())?;
//!
//! let addr: Multiaddr = "/ip4/1.2.3.4/tcp/1234".parse()?;
//! let conn = mgr.open_connection(Direction::Inbound, true, addr)?;
//! conn.set_peer(&PeerId::from("QmFoo"))?;
//!
//! let stream = mgr.open_stream(&PeerId::from("QmFoo"), Direction::Inbound)?;
//! stream.set_protocol(&"/app/1.0.0".into())?;
//! stream.reserve_memory(4096)?;
//!
//! stream.done();
//! conn.done();
//! mgr.close().await;
//! # Ok(())
//! # }
//! ```

pub mod allowlist;
mod conn;
mod counters;
pub mod manager;
pub mod metrics;
mod scope;
mod stream;
pub mod trace;

pub use allowlist::{Allowlist, IpNet};
pub use conn::ConnScope;
pub use manager::{ResourceManager, ResourceManagerBuilder};
pub use metrics::{MetricsReporter, MultiMetricsReporter};
pub use scope::ResourceScope;
pub use stream::StreamScope;
pub use trace::{ScopeClass, TraceEmitter, TraceEvt, TraceEvtType};

// Re-export the foundation types callers need at the API surface.
pub use peermit_errors::{AllowlistError, Error, ResourceError, ResourceKind};
pub use peermit_limits::{default_table, Limit, LimitTable};
pub use peermit_types::{
    Direction, MemoryPressure, Multiaddr, PeerId, ProtocolId, ScopeStat,
};
