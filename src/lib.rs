//! dnsgate: TCP/DoT front-end engine for an authoritative-DNS load balancer
//!
//! dnsgate accepts stream connections from DNS clients (plain TCP or DoT),
//! optionally consumes a PROXY-protocol preamble, demultiplexes
//! length-prefixed DNS messages, runs each query through a processing
//! pipeline, forwards it to a downstream backend over a pooled TCP
//! connection, and shuttles the response back, without head-of-line
//! blocking inside a client connection.
//!
//! # Architecture
//!
//! ```text
//! Client ──TCP/DoT──▶ Acceptor ──(channel)──▶ Worker
//!                                               │ spawns
//!                                               ▼
//!                                      Client connection SM
//!                                        │ dispatch      ▲ responses
//!                                        ▼               │ (any order)
//!                                      Backend connection ──▶ Backend
//!                                        ▲
//!                                        └── per-worker idle-connection cache
//! ```
//!
//! - The **acceptor** applies the ACL and admission caps, then hands the
//!   socket to a worker with a zero-timeout round-robin dispatch.
//! - Each **worker** owns a cache of idle backend connections and sweeps
//!   it for dead sockets on a fixed interval.
//! - The **client connection** is a flat state machine over explicit
//!   read/write progress; many queries may be in flight at once and
//!   responses are written in completion order, one at a time.
//! - The **backend connection** pipelines queries FIFO on one socket,
//!   matches responses by DNS id, and reconnects-and-resends within a
//!   retry budget.
//!
//! # Quick Start
//!
//! ```no_run
//! use dnsgate::config::{BackendConfig, GateConfig, ListenerConfig};
//!
//! let config = GateConfig::new()
//!     .with_listener(ListenerConfig::new("0.0.0.0:53".parse().unwrap()))
//!     .with_backend(BackendConfig::new("ns1", "192.0.2.53:53".parse().unwrap()));
//! config.validate().expect("valid configuration");
//! ```
//!
//! # Modules
//!
//! - [`config`]: configuration types and loading
//! - [`error`]: error hierarchy
//! - [`frontend`]: acceptor, worker pool, client connection, stream handler
//! - [`backend`]: backend state, backend connection, connection cache
//! - [`pipeline`]: query/response processing contracts
//! - [`proto`]: minimal DNS wire helpers
//! - [`proxy_protocol`]: PROXY v1/v2 codec
//! - [`rings`]: response observation ring

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod backend;
pub mod config;
pub mod error;
pub mod frontend;
pub mod pipeline;
pub mod proto;
pub mod proxy_protocol;
pub mod rings;

// Re-export commonly used types at the crate root
pub use backend::{Backend, BackendConnectionCache, BackendConnectionHandle, BackendStats};
pub use config::{BackendConfig, GateConfig, LimitsConfig, ListenerConfig, TlsConfig};
pub use error::{GateError, GateResult};
pub use frontend::{
    Acceptor, Acl, ClientConnection, ClientTracker, ConnectionInfo, DnsStream, EngineContext,
    Frontend, FrontendStats, WorkerPool,
};
pub use pipeline::{
    ForwardingPipeline, QueryContext, QueryPipeline, QueryVerdict, ResponseContext,
    SelectionStrategy,
};
pub use rings::{ResponseEntry, ResponseRing};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
