//! Worker pool
//!
//! A fixed set of worker tasks receives accepted sockets from the
//! acceptors over bounded channels (FIFO per worker), spawns a client
//! connection task for each, and owns the per-worker cache of idle
//! backend connections, scanning it for dead sockets on a fixed
//! interval.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, trace};

use super::{ClientConnection, ConnectionInfo, EngineContext};
use crate::backend::BackendConnectionCache;

/// Handle to the worker tasks, used by acceptors for dispatch
#[derive(Debug)]
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<ConnectionInfo>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `workers` worker tasks
    #[must_use]
    pub fn spawn(workers: usize, ctx: &Arc<EngineContext>) -> Self {
        let workers = workers.max(1);
        let depth = ctx.limits.max_queued_connections.max(1);
        let mut senders = Vec::with_capacity(workers);

        for id in 0..workers {
            let (tx, rx) = mpsc::channel(depth);
            senders.push(tx);
            tokio::spawn(worker_loop(id, rx, Arc::clone(ctx)));
        }

        Self {
            senders,
            next: AtomicUsize::new(0),
        }
    }

    /// Number of workers
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Hand a connection to the next worker, round-robin
    ///
    /// One attempt, no waiting: the zero-timeout pipe write of the
    /// original design. The envelope comes back on failure so the caller
    /// can roll its accounting back.
    ///
    /// # Errors
    ///
    /// Returns the envelope when the picked worker's queue is full or the
    /// worker is gone.
    pub fn dispatch(&self, info: ConnectionInfo) -> Result<(), ConnectionInfo> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[index].try_send(info).map_err(|e| match e {
            mpsc::error::TrySendError::Full(info) | mpsc::error::TrySendError::Closed(info) => {
                info
            }
        })
    }
}

/// One worker: receive sockets, spawn connections, sweep the cache
async fn worker_loop(
    id: usize,
    mut rx: mpsc::Receiver<ConnectionInfo>,
    ctx: Arc<EngineContext>,
) {
    let cache = Arc::new(Mutex::new(BackendConnectionCache::new(
        ctx.limits.max_cached_connections_per_backend,
    )));
    let cleanup_interval =
        Duration::from_secs(ctx.limits.backend_cleanup_interval_secs.max(1));
    let mut cleanup = time::interval_at(time::Instant::now() + cleanup_interval, cleanup_interval);

    debug!(worker = id, "worker started");

    loop {
        tokio::select! {
            info = rx.recv() => {
                let Some(info) = info else {
                    debug!(worker = id, "worker channel closed, stopping");
                    break;
                };
                ctx.tracker.dequeue();
                trace!(worker = id, remote = %info.remote, "connection received");
                tokio::spawn(ClientConnection::run(
                    info,
                    Arc::clone(&ctx),
                    Arc::clone(&cache),
                ));
            }
            _ = cleanup.tick() => {
                let mut cache = cache.lock();
                let before = cache.len();
                cache.cleanup_closed();
                let evicted = before - cache.len();
                if evicted > 0 {
                    debug!(worker = id, evicted, "evicted dead cached backend connections");
                }
            }
        }
    }
}
