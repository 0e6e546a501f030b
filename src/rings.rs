//! Response observation ring
//!
//! Every completed response is recorded in a bounded in-memory ring for
//! inspection (top-talkers, latency digging, dynamic blocking in the
//! bigger system). Insertion must never block the connection task: the
//! ring uses a try-lock and simply drops the observation on contention.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use hickory_proto::rr::Name;
use parking_lot::Mutex;

/// One recorded response
#[derive(Debug, Clone)]
pub struct ResponseEntry {
    /// Client the response was sent to (post-PROXY-protocol address)
    pub client: SocketAddr,
    /// Query name
    pub qname: Name,
    /// Query type, raw
    pub qtype: u16,
    /// Backend-to-client latency
    pub latency: Duration,
    /// Response size in bytes (unframed)
    pub size: usize,
    /// Response code
    pub rcode: u8,
    /// Name of the backend that answered, if any
    pub backend: Option<String>,
}

/// Bounded ring of response observations
#[derive(Debug)]
pub struct ResponseRing {
    entries: Mutex<VecDeque<ResponseEntry>>,
    capacity: usize,
}

impl ResponseRing {
    /// Create a ring holding at most `capacity` entries
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Record a response
    ///
    /// Never blocks: if the ring is contended the observation is dropped.
    pub fn insert(&self, entry: ResponseEntry) {
        if let Some(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Number of entries currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the ring is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the current entries, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<ResponseEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}
