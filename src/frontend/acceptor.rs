//! Acceptor: one accept loop per listening endpoint
//!
//! The acceptor owns admission: the endpoint ACL, the cap on connections
//! queued towards workers, and the optional per-client connection cap.
//! Admitted sockets get `TCP_NODELAY` and are handed to a worker with a
//! zero-timeout round-robin dispatch; a failed handoff drops the socket
//! and rolls the admission counters back. The acceptor never owns a
//! socket past the handoff.

use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use ipnet::IpNet;
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace};

use super::{ConnectionInfo, EngineContext, Frontend, WorkerPool};
use crate::error::{GateError, GateResult};

/// Network allow-list
///
/// Used both as the endpoint ACL (where an empty list means "everyone")
/// and as the PROXY-protocol peer list (where an empty list means
/// "nobody"); the caller picks the empty-list meaning.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    networks: Vec<IpNet>,
}

impl Acl {
    /// Create an allow-list over `networks`
    #[must_use]
    pub fn new(networks: Vec<IpNet>) -> Self {
        Self { networks }
    }

    /// Whether any network contains `ip`
    #[must_use]
    pub fn matches(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(&ip))
    }

    /// Whether the list is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

/// Admission bookkeeping shared by acceptors, workers, and connections
///
/// Tracks how many accepted sockets are queued towards workers and how
/// many connections each client address currently has open. Both caps are
/// optional; a cap of zero disables the corresponding rule.
#[derive(Debug)]
pub struct ClientTracker {
    per_client: DashMap<IpAddr, AtomicUsize>,
    queued: AtomicUsize,
    max_queued: usize,
    max_per_client: usize,
    stats: TrackerStats,
}

/// Counters for admission decisions
#[derive(Debug, Default)]
pub struct TrackerStats {
    /// Connections admitted
    pub accepted: AtomicU64,
    /// Connections rejected on the queued-connection cap
    pub rejected_queued: AtomicU64,
    /// Connections rejected on the per-client cap
    pub rejected_per_client: AtomicU64,
}

impl ClientTracker {
    /// Create a tracker with the given caps (0 disables a cap)
    #[must_use]
    pub fn new(max_queued: usize, max_per_client: usize) -> Self {
        Self {
            per_client: DashMap::new(),
            queued: AtomicUsize::new(0),
            max_queued,
            max_per_client,
            stats: TrackerStats::default(),
        }
    }

    /// Reserve a slot in the worker queue
    #[must_use]
    pub fn try_enqueue(&self) -> bool {
        if self.max_queued == 0 {
            self.queued.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        let reserved = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if reserved > self.max_queued {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.stats.rejected_queued.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Give a queue slot back (worker pickup or dispatch failure)
    pub fn dequeue(&self) {
        let previous = self.queued.fetch_sub(1, Ordering::SeqCst);
        if previous == 0 {
            // underflow protection
            self.queued.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Number of connections currently queued towards workers
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Count a connection against its client address
    ///
    /// Returns `false` when the client is at its cap; nothing is counted
    /// in that case.
    #[must_use]
    pub fn try_acquire_client(&self, ip: IpAddr) -> bool {
        if self.max_per_client == 0 {
            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let entry = self
            .per_client
            .entry(ip)
            .or_insert_with(|| AtomicUsize::new(0));
        let count = entry.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.max_per_client {
            entry.fetch_sub(1, Ordering::SeqCst);
            self.stats
                .rejected_per_client
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release a client slot taken by [`Self::try_acquire_client`]
    pub fn release_client(&self, ip: IpAddr) {
        if self.max_per_client == 0 {
            return;
        }
        if let Some(entry) = self.per_client.get(&ip) {
            let previous = entry.fetch_sub(1, Ordering::SeqCst);
            if previous == 0 {
                entry.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.per_client
            .remove_if(&ip, |_, count| count.load(Ordering::SeqCst) == 0);
    }

    /// Current connection count for one client address
    #[must_use]
    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.per_client
            .get(&ip)
            .map_or(0, |entry| entry.load(Ordering::SeqCst))
    }

    /// Admission counters
    #[must_use]
    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }
}

/// Accept loop for one listening endpoint
pub struct Acceptor {
    frontend: Arc<Frontend>,
    listener: TcpListener,
    ctx: Arc<EngineContext>,
    workers: Arc<WorkerPool>,
}

impl Acceptor {
    /// Bind the endpoint's listening socket
    ///
    /// # Errors
    ///
    /// Returns a network error when the socket cannot be bound.
    pub async fn bind(
        frontend: Arc<Frontend>,
        ctx: Arc<EngineContext>,
        workers: Arc<WorkerPool>,
    ) -> GateResult<Self> {
        let listener = TcpListener::bind(frontend.local)
            .await
            .map_err(|e| GateError::network_io(format!("binding {}", frontend.local), e))?;
        info!(addr = %frontend.local, tls = frontend.tls.is_some(), "listener bound");
        Ok(Self {
            frontend,
            listener,
            ctx,
            workers,
        })
    }

    /// The bound local address (relevant when binding port 0)
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> GateResult<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| GateError::network_io("reading local address", e))
    }

    /// Accept connections forever
    ///
    /// # Errors
    ///
    /// Returns only on fatal accept errors; transient ones are logged and
    /// skipped.
    pub async fn run(&self) -> GateResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => self.admit(stream, remote),
                Err(e) => {
                    if is_fatal_accept_error(&e) {
                        error!(error = %e, "fatal accept error");
                        return Err(GateError::network_io("accepting connection", e));
                    }
                    debug!(error = %e, "transient accept error");
                }
            }
        }
    }

    /// Run one accepted socket through admission and hand it to a worker
    fn admit(&self, stream: tokio::net::TcpStream, remote: std::net::SocketAddr) {
        let frontend = &self.frontend;
        let tracker = &self.ctx.tracker;

        if !frontend.allows(&remote) {
            frontend.stats.acl_drops.fetch_add(1, Ordering::Relaxed);
            debug!(remote = %remote, "connection dropped by ACL");
            return;
        }

        stream.set_nodelay(true).ok();

        if !tracker.try_enqueue() {
            debug!(remote = %remote, "too many queued connections, dropping");
            return;
        }
        if !tracker.try_acquire_client(remote.ip()) {
            tracker.dequeue();
            debug!(remote = %remote, "per-client connection cap reached, dropping");
            return;
        }

        frontend
            .stats
            .tcp_current_connections
            .fetch_add(1, Ordering::Relaxed);

        let info = ConnectionInfo {
            stream,
            remote,
            frontend: Arc::clone(frontend),
        };

        if self.workers.dispatch(info).is_err() {
            // zero-timeout handoff failed; roll every counter back
            tracker.dequeue();
            tracker.release_client(remote.ip());
            frontend
                .stats
                .tcp_current_connections
                .fetch_sub(1, Ordering::Relaxed);
            debug!(remote = %remote, "no worker available, dropping connection");
            return;
        }

        trace!(remote = %remote, "connection handed to worker");
    }
}

fn is_fatal_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::AddrInUse | io::ErrorKind::InvalidInput
    )
}
