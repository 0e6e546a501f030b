//! Per-worker cache of idle backend connections
//!
//! Each worker keeps its own cache; connection tasks spawned by that
//! worker share it and nothing else does, so the lock never crosses
//! workers. A connection lives in exactly one place at a time: a client
//! connection's active map while a query is outstanding on it, or here
//! while idle and reusable.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use super::connection::BackendConnectionHandle;
use super::Backend;

/// Cache of idle, reusable backend connections, keyed by backend name
#[derive(Debug)]
pub struct BackendConnectionCache {
    connections: HashMap<String, VecDeque<BackendConnectionHandle>>,
    max_per_backend: usize,
}

impl BackendConnectionCache {
    /// Create a cache keeping at most `max_per_backend` idle connections
    /// per backend
    #[must_use]
    pub fn new(max_per_backend: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_per_backend: max_per_backend.max(1),
        }
    }

    /// Get a connection to `backend`
    ///
    /// Returns a cached idle connection when one exists (oldest first,
    /// marked reused), otherwise establishes a fresh one.
    #[must_use]
    pub fn acquire(&mut self, backend: &Arc<Backend>) -> BackendConnectionHandle {
        if let Some(list) = self.connections.get_mut(&backend.name) {
            while let Some(conn) = list.pop_front() {
                if conn.is_closed() {
                    // died while cached; skip it
                    continue;
                }
                conn.set_reused();
                trace!(backend = %backend.name, "reusing cached connection");
                return conn;
            }
        }
        trace!(backend = %backend.name, "establishing fresh connection");
        BackendConnectionHandle::establish(Arc::clone(backend))
    }

    /// Return an idle connection to the cache
    ///
    /// The connection is kept only if it may be reused and the per-backend
    /// cap has room; otherwise it is dropped, which closes the socket once
    /// the last handle is gone.
    pub fn release(&mut self, conn: BackendConnectionHandle) {
        if !conn.can_be_reused() {
            trace!(backend = %conn.backend().name, "dropping non-reusable connection");
            return;
        }

        let list = self
            .connections
            .entry(conn.backend().name.clone())
            .or_default();
        if list.len() >= self.max_per_backend {
            trace!(backend = %conn.backend().name, "cache full, dropping connection");
            return;
        }
        list.push_back(conn);
    }

    /// Evict every cached connection whose socket is no longer usable
    ///
    /// Idempotent; empty backend entries are removed.
    pub fn cleanup_closed(&mut self) {
        self.connections.retain(|_, list| {
            list.retain(|conn| !conn.is_closed());
            !list.is_empty()
        });
    }

    /// Number of cached connections for `backend`
    #[must_use]
    pub fn cached_count(&self, backend: &str) -> usize {
        self.connections.get(backend).map_or(0, VecDeque::len)
    }

    /// Total number of cached connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.values().map(VecDeque::len).sum()
    }

    /// Whether the cache holds no connections
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn backend(name: &str) -> Arc<Backend> {
        Arc::new(Backend::from_config(&BackendConfig::new(
            name,
            "127.0.0.1:1".parse().unwrap(),
        )))
    }

    // ========================================================================
    // Acquire / Release Tests
    // ========================================================================

    #[tokio::test]
    async fn test_acquire_fresh_then_release_then_reuse() {
        let mut cache = BackendConnectionCache::new(20);
        let ns1 = backend("ns1");

        let conn = cache.acquire(&ns1);
        assert!(conn.is_fresh());
        assert_eq!(cache.cached_count("ns1"), 0);

        cache.release(conn);
        assert_eq!(cache.cached_count("ns1"), 1);

        let again = cache.acquire(&ns1);
        assert!(!again.is_fresh());
        assert_eq!(cache.cached_count("ns1"), 0);
    }

    #[tokio::test]
    async fn test_release_respects_cap() {
        let mut cache = BackendConnectionCache::new(2);
        let ns1 = backend("ns1");

        let conns: Vec<_> = (0..3).map(|_| cache.acquire(&ns1)).collect();
        for conn in conns {
            cache.release(conn);
        }
        assert_eq!(cache.cached_count("ns1"), 2);
    }

    #[tokio::test]
    async fn test_release_refuses_non_reusable() {
        let mut cache = BackendConnectionCache::new(20);
        let ns1 = backend("ns1");

        let conn = cache.acquire(&ns1);
        conn.set_tlv_payload_added();
        cache.release(conn);
        assert_eq!(cache.cached_count("ns1"), 0);

        let xfr_conn = cache.acquire(&ns1);
        xfr_conn.mark_xfr().unwrap();
        cache.release(xfr_conn);
        assert_eq!(cache.cached_count("ns1"), 0);
    }

    #[tokio::test]
    async fn test_acquire_returns_oldest_first() {
        let mut cache = BackendConnectionCache::new(20);
        let ns1 = backend("ns1");

        let first = cache.acquire(&ns1);
        let second = cache.acquire(&ns1);
        // tag the first connection so it can be recognized after release
        let tag = vec![crate::proxy_protocol::ProxyTlv {
            kind: 0xe0,
            value: b"first".to_vec(),
        }];
        first.set_tlvs_sent(tag.clone());
        cache.release(first);
        cache.release(second);

        let got = cache.acquire(&ns1);
        assert!(got.matches_tlvs(Some(&tag)));
    }

    #[tokio::test]
    async fn test_backends_are_isolated() {
        let mut cache = BackendConnectionCache::new(20);
        let ns1 = backend("ns1");
        let ns2 = backend("ns2");

        let conn = cache.acquire(&ns1);
        cache.release(conn);

        assert_eq!(cache.cached_count("ns1"), 1);
        assert_eq!(cache.cached_count("ns2"), 0);

        let fresh = cache.acquire(&ns2);
        assert!(fresh.is_fresh());
        assert_eq!(cache.cached_count("ns1"), 1);
    }

    // ========================================================================
    // Cleanup Tests
    // ========================================================================

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let mut cache = BackendConnectionCache::new(20);
        let ns1 = backend("ns1");

        let conn = cache.acquire(&ns1);
        cache.release(conn);

        cache.cleanup_closed();
        let after_first = cache.cached_count("ns1");
        cache.cleanup_closed();
        assert_eq!(cache.cached_count("ns1"), after_first);
    }

    #[tokio::test]
    async fn test_cleanup_removes_empty_entries() {
        let mut cache = BackendConnectionCache::new(20);
        let ns1 = backend("ns1");

        let conn = cache.acquire(&ns1);
        cache.release(conn);
        // take it back out; the entry for ns1 stays but is empty
        let _conn = cache.acquire(&ns1);
        assert!(cache.connections.contains_key("ns1"));

        cache.cleanup_closed();
        assert!(!cache.connections.contains_key("ns1"));
    }
}
