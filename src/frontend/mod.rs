//! Client-facing front-end
//!
//! Everything between the listening socket and the dispatch into a
//! backend lives here: the acceptor with its admission rules, the worker
//! pool the acceptor hands sockets to, the per-connection state machine,
//! and the stream handler that papers over plain TCP vs DoT.

pub mod acceptor;
pub mod connection;
pub mod stream;
pub mod worker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::config::{LimitsConfig, ListenerConfig};
use crate::error::GateResult;
use crate::pipeline::QueryPipeline;
use crate::rings::ResponseRing;

pub use acceptor::{Acceptor, Acl, ClientTracker};
pub use connection::ClientConnection;
pub use stream::DnsStream;
pub use worker::WorkerPool;

/// Shared state every component of the engine needs a hand on
#[derive(Debug)]
pub struct EngineContext {
    /// The query/response processing pipeline
    pub pipeline: Arc<dyn QueryPipeline>,
    /// Response observation sink
    pub rings: Arc<ResponseRing>,
    /// Engine limits and timeouts
    pub limits: LimitsConfig,
    /// Admission bookkeeping shared between acceptors and workers
    pub tracker: Arc<ClientTracker>,
}

/// One listening endpoint: immutable configuration plus counters
///
/// Lives for the whole process; every connection accepted on the endpoint
/// holds a reference.
pub struct Frontend {
    /// Address the endpoint listens on
    pub local: SocketAddr,
    /// TLS acceptor for DoT endpoints
    pub tls: Option<TlsAcceptor>,
    /// Networks allowed to connect; empty allows everyone
    pub acl: Acl,
    /// Networks whose connections must open with a PROXY preamble
    pub proxy_protocol_from: Acl,
    /// In-flight queries allowed per client connection
    pub max_in_flight_per_conn: usize,
    /// Counters
    pub stats: FrontendStats,
}

impl std::fmt::Debug for Frontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frontend")
            .field("local", &self.local)
            .field("tls", &self.tls.is_some())
            .field("max_in_flight_per_conn", &self.max_in_flight_per_conn)
            .finish()
    }
}

impl Frontend {
    /// Build a frontend from its listener configuration
    ///
    /// # Errors
    ///
    /// Fails when TLS is configured but the certificate or key cannot be
    /// loaded.
    pub fn from_config(config: &ListenerConfig) -> GateResult<Self> {
        let tls = match &config.tls {
            Some(tls_config) => Some(stream::build_tls_acceptor(
                &tls_config.certificate,
                &tls_config.key,
            )?),
            None => None,
        };

        Ok(Self {
            local: config.address,
            tls,
            acl: Acl::new(config.acl.clone()),
            proxy_protocol_from: Acl::new(config.proxy_protocol_from.clone()),
            max_in_flight_per_conn: config.max_in_flight_per_conn.max(1),
            stats: FrontendStats::default(),
        })
    }

    /// Whether a peer must open with a PROXY-protocol preamble
    #[must_use]
    pub fn expects_proxy_protocol_from(&self, addr: &SocketAddr) -> bool {
        self.proxy_protocol_from.matches(addr.ip())
    }

    /// Whether a peer passes the endpoint ACL
    #[must_use]
    pub fn allows(&self, addr: &SocketAddr) -> bool {
        self.acl.is_empty() || self.acl.matches(addr.ip())
    }
}

/// One-shot ownership envelope for an accepted socket
///
/// Built by the acceptor, shipped to a worker, consumed by the client
/// connection.
#[derive(Debug)]
pub struct ConnectionInfo {
    /// The accepted socket
    pub stream: TcpStream,
    /// Socket peer address
    pub remote: SocketAddr,
    /// The endpoint the socket arrived on
    pub frontend: Arc<Frontend>,
}

/// Front-end counters, updated with relaxed atomics
#[derive(Debug, Default)]
pub struct FrontendStats {
    /// Queries read on this endpoint
    pub queries: AtomicU64,
    /// Responses relayed or generated on this endpoint
    pub responses: AtomicU64,
    /// Currently open client connections
    pub tcp_current_connections: AtomicUsize,
    /// Connections that died before a response was being written
    pub tcp_died_reading_query: AtomicU64,
    /// Connections that died while a response was being written
    pub tcp_died_sending_response: AtomicU64,
    /// Connections dropped on a client deadline
    pub tcp_client_timeouts: AtomicU64,
    /// Completed TLS handshakes
    pub tls_handshakes: AtomicU64,
    /// Queries carried over TLS 1.0
    pub tls10_queries: AtomicU64,
    /// Queries carried over TLS 1.1
    pub tls11_queries: AtomicU64,
    /// Queries carried over TLS 1.2
    pub tls12_queries: AtomicU64,
    /// Queries carried over TLS 1.3
    pub tls13_queries: AtomicU64,
    /// Queries carried over an unrecognized TLS version
    pub tls_unknown_queries: AtomicU64,
    /// NoError responses sent to clients
    pub frontend_noerror: AtomicU64,
    /// ServFail responses sent to clients
    pub frontend_servfail: AtomicU64,
    /// NXDomain responses sent to clients
    pub frontend_nxdomain: AtomicU64,
    /// Frames below the DNS header size
    pub non_compliant_queries: AtomicU64,
    /// Malformed PROXY preambles
    pub proxy_protocol_invalid: AtomicU64,
    /// Connections dropped by the ACL
    pub acl_drops: AtomicU64,
}

impl FrontendStats {
    /// Snapshot the counters
    #[must_use]
    pub fn snapshot(&self) -> FrontendStatsSnapshot {
        FrontendStatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            tcp_current_connections: self.tcp_current_connections.load(Ordering::Relaxed),
            tcp_died_reading_query: self.tcp_died_reading_query.load(Ordering::Relaxed),
            tcp_died_sending_response: self.tcp_died_sending_response.load(Ordering::Relaxed),
            tcp_client_timeouts: self.tcp_client_timeouts.load(Ordering::Relaxed),
            tls_handshakes: self.tls_handshakes.load(Ordering::Relaxed),
            frontend_noerror: self.frontend_noerror.load(Ordering::Relaxed),
            frontend_servfail: self.frontend_servfail.load(Ordering::Relaxed),
            frontend_nxdomain: self.frontend_nxdomain.load(Ordering::Relaxed),
            non_compliant_queries: self.non_compliant_queries.load(Ordering::Relaxed),
            proxy_protocol_invalid: self.proxy_protocol_invalid.load(Ordering::Relaxed),
            acl_drops: self.acl_drops.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the headline [`FrontendStats`] counters
#[derive(Debug, Clone, Copy, Default)]
pub struct FrontendStatsSnapshot {
    /// Queries read
    pub queries: u64,
    /// Responses relayed or generated
    pub responses: u64,
    /// Currently open client connections
    pub tcp_current_connections: usize,
    /// Died before a response was being written
    pub tcp_died_reading_query: u64,
    /// Died while a response was being written
    pub tcp_died_sending_response: u64,
    /// Client deadline drops
    pub tcp_client_timeouts: u64,
    /// Completed TLS handshakes
    pub tls_handshakes: u64,
    /// NoError responses
    pub frontend_noerror: u64,
    /// ServFail responses
    pub frontend_servfail: u64,
    /// NXDomain responses
    pub frontend_nxdomain: u64,
    /// Frames below the DNS header size
    pub non_compliant_queries: u64,
    /// Malformed PROXY preambles
    pub proxy_protocol_invalid: u64,
    /// ACL drops
    pub acl_drops: u64,
}
