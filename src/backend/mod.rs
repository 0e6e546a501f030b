//! Downstream backends
//!
//! This module holds everything on the backend side of the engine: the
//! backend identity and counters, the per-socket backend connection task
//! that pipelines queries and decodes responses, and the per-worker cache
//! of idle, reusable backend connections.
//!
//! # Ownership
//!
//! A live backend connection is held by exactly one of two places at any
//! time: a client connection's active map (while a query is outstanding on
//! it) or the worker's cache (while idle and reusable). The connection's
//! back-reference to a client is the per-query reply channel; when the
//! client is gone, delivery fails and the response is discarded.

pub mod cache;
pub mod connection;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use hickory_proto::rr::Name;

use crate::config::BackendConfig;

pub use cache::BackendConnectionCache;
pub use connection::{BackendConnectionHandle, QueryReplySender};

/// One downstream backend server
///
/// Identity for the connection cache and the active-connection maps is the
/// backend name, which is validated unique at configuration load.
#[derive(Debug)]
pub struct Backend {
    /// Unique backend name
    pub name: String,
    /// Address queries are forwarded to
    pub addr: SocketAddr,
    /// Whether fresh connections start with a PROXY v2 payload
    pub use_proxy_protocol: bool,
    /// Reconnect budget before in-flight queries are failed
    pub retries: u32,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Read timeout while responses are pending
    pub read_timeout: Duration,
    /// Write timeout
    pub write_timeout: Duration,
    /// Counters
    pub stats: BackendStats,
}

impl Backend {
    /// Build a backend from its configuration
    #[must_use]
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            addr: config.address,
            use_proxy_protocol: config.use_proxy_protocol,
            retries: config.retries,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            stats: BackendStats::default(),
        }
    }
}

/// Backend-side counters, updated with relaxed atomics
#[derive(Debug, Default)]
pub struct BackendStats {
    /// Queries written to this backend
    pub queries: AtomicU64,
    /// Responses read from this backend
    pub responses: AtomicU64,
    /// Queries currently awaiting a response (XFR excluded)
    pub outstanding: AtomicUsize,
    /// Open TCP connections to this backend
    pub tcp_current_connections: AtomicUsize,
    /// Connections that died while a query was being written
    pub tcp_died_sending_query: AtomicU64,
    /// Connections that died while a response was being read
    pub tcp_died_reading_response: AtomicU64,
    /// Read deadline expiries
    pub tcp_read_timeouts: AtomicU64,
    /// Write deadline expiries
    pub tcp_write_timeouts: AtomicU64,
    /// Connections abandoned after the retry budget was exhausted
    pub tcp_gave_up: AtomicU64,
    /// Cached connections handed back out
    pub tcp_reused_connections: AtomicU64,
}

impl BackendStats {
    /// Snapshot the counters
    #[must_use]
    pub fn snapshot(&self) -> BackendStatsSnapshot {
        BackendStatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            outstanding: self.outstanding.load(Ordering::Relaxed),
            tcp_current_connections: self.tcp_current_connections.load(Ordering::Relaxed),
            tcp_died_sending_query: self.tcp_died_sending_query.load(Ordering::Relaxed),
            tcp_died_reading_response: self.tcp_died_reading_response.load(Ordering::Relaxed),
            tcp_read_timeouts: self.tcp_read_timeouts.load(Ordering::Relaxed),
            tcp_write_timeouts: self.tcp_write_timeouts.load(Ordering::Relaxed),
            tcp_gave_up: self.tcp_gave_up.load(Ordering::Relaxed),
            tcp_reused_connections: self.tcp_reused_connections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BackendStats`]
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendStatsSnapshot {
    /// Queries written to this backend
    pub queries: u64,
    /// Responses read from this backend
    pub responses: u64,
    /// Queries currently awaiting a response
    pub outstanding: usize,
    /// Open TCP connections
    pub tcp_current_connections: usize,
    /// Died while writing a query
    pub tcp_died_sending_query: u64,
    /// Died while reading a response
    pub tcp_died_reading_response: u64,
    /// Read deadline expiries
    pub tcp_read_timeouts: u64,
    /// Write deadline expiries
    pub tcp_write_timeouts: u64,
    /// Retry budget exhaustions
    pub tcp_gave_up: u64,
    /// Cache reuses
    pub tcp_reused_connections: u64,
}

/// Per-query record kept while the query is in flight at a backend
///
/// Carries what is needed to validate and route the response back: the
/// original wire id, the question, the (post-PROXY) client address, and
/// the receive timestamp for latency accounting.
#[derive(Debug, Clone)]
pub struct QueryIdState {
    /// DNS id as sent by the client
    pub original_id: u16,
    /// Query name
    pub qname: Name,
    /// Query type, raw
    pub qtype: u16,
    /// Query class, raw
    pub qclass: u16,
    /// Client the response must go back to
    pub client: SocketAddr,
    /// When the full query was read from the client
    pub received_at: Instant,
}

/// A framed query on its way to a backend
#[derive(Debug)]
pub struct TcpQuery {
    /// Wire bytes: 2-byte length prefix, then the message (and, for
    /// TLV-bearing PROXY payloads, the payload before both)
    pub buffer: Vec<u8>,
    /// In-flight record for the response path
    pub ids: QueryIdState,
    /// Whether this query starts a zone transfer
    pub is_xfr: bool,
}

/// A response on its way back to a client connection
#[derive(Debug)]
pub struct TcpResponse {
    /// Message bytes, unframed; the length prefix is prepended at send time
    pub buffer: Vec<u8>,
    /// The in-flight record the response was matched against; `None` for
    /// self-generated responses
    pub ids: Option<QueryIdState>,
    /// The backend connection that produced the response, for cache release
    pub connection: Option<BackendConnectionHandle>,
    /// Whether the engine generated this response itself
    pub self_generated: bool,
}

impl TcpResponse {
    /// Build a self-generated response (NOTIMP synthesis, pipeline answers)
    #[must_use]
    pub fn self_generated(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            ids: None,
            connection: None,
            self_generated: true,
        }
    }
}

/// Events delivered to a client connection's event channel
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A response arrived from a backend
    Response(TcpResponse),
    /// A backend failed a query; the in-flight slot must be released
    IoError(QueryIdState),
}
