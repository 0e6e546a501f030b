//! Backend connection
//!
//! One task per TCP socket to a backend. Queries are pipelined FIFO onto
//! the socket; responses are length-prefix decoded and matched to their
//! in-flight record by DNS id, then delivered to the originating client
//! connection's event channel. A connection that dies with queries in
//! flight reconnects and resends them, bounded by the backend's retry
//! budget; zone-transfer sessions that already carried traffic are never
//! retried. Exhausting the budget fails every pending query towards its
//! owner.
//!
//! The handle is the only public surface: the client connection and the
//! worker cache share it, and exactly one of them holds it at any time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use super::{Backend, ConnectionEvent, QueryIdState, TcpQuery, TcpResponse};
use crate::error::{GateError, GateResult};
use crate::proto::{self, DNS_HEADER_SIZE};
use crate::proxy_protocol::ProxyTlv;

/// Sender half of a client connection's event channel
pub type QueryReplySender = mpsc::UnboundedSender<ConnectionEvent>;

/// Depth of the request channel between a client connection and the task
const REQUEST_CHANNEL_DEPTH: usize = 64;

/// State shared between the handle and the connection task
#[derive(Debug)]
struct ConnShared {
    /// The socket is gone; the connection must not be handed out again
    closed: AtomicBool,
    /// Never handed out of the cache (or reconnected) since creation
    fresh: AtomicBool,
    /// Consumed by a zone-transfer session
    used_for_xfr: AtomicBool,
    /// A TLV-bearing PROXY payload was written; reuse is forbidden
    tlv_locked: AtomicBool,
    /// Queries written and not yet answered or failed
    in_flight: AtomicUsize,
    /// Queries ever written on this connection
    queries: AtomicU64,
    /// PROXY TLVs sent on this connection, for reuse matching
    tlvs_sent: Mutex<Option<Vec<ProxyTlv>>>,
    /// PROXY payload to write before the first query bytes
    proxy_payload: Mutex<Option<Vec<u8>>>,
}

impl ConnShared {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            fresh: AtomicBool::new(true),
            used_for_xfr: AtomicBool::new(false),
            tlv_locked: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            queries: AtomicU64::new(0),
            tlvs_sent: Mutex::new(None),
            proxy_payload: Mutex::new(None),
        }
    }
}

/// A request queued towards the connection task
struct BackendRequest {
    query: TcpQuery,
    reply: QueryReplySender,
}

/// Shared handle to one backend connection
///
/// Cloning is cheap; the underlying socket and its task are shared.
#[derive(Debug, Clone)]
pub struct BackendConnectionHandle {
    backend: Arc<Backend>,
    tx: mpsc::Sender<BackendRequest>,
    shared: Arc<ConnShared>,
}

impl BackendConnectionHandle {
    /// Create a connection to `backend` and spawn its task
    ///
    /// The socket is established lazily, when the first query is queued.
    #[must_use]
    pub fn establish(backend: Arc<Backend>) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_DEPTH);
        let shared = Arc::new(ConnShared::new());

        let task = ConnectionTask {
            backend: Arc::clone(&backend),
            shared: Arc::clone(&shared),
            rx,
            weak_tx: tx.downgrade(),
            stream: None,
            pending: VecDeque::new(),
            read_phase: ReadPhase::Prefix,
            read_buf: vec![0u8; 2],
            read_pos: 0,
            read_deadline: Instant::now() + backend.read_timeout,
            failures: 0,
            payload_written: false,
            xfr_started: false,
        };
        tokio::spawn(task.run());

        Self {
            backend,
            tx,
            shared,
        }
    }

    /// The backend this connection leads to
    #[must_use]
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Whether two handles refer to the same underlying connection
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Whether the socket has been observed dead
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Whether no query is currently in flight
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire) == 0
    }

    /// Whether this connection has never been handed out before
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.shared.fresh.load(Ordering::Acquire)
    }

    /// Mark the connection as handed out of the cache
    pub fn set_reused(&self) {
        self.shared.fresh.store(false, Ordering::Release);
        self.backend
            .stats
            .tcp_reused_connections
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Whether new queries may be pipelined onto this connection
    #[must_use]
    pub fn can_accept_new_queries(&self) -> bool {
        !self.is_closed() && !self.shared.used_for_xfr.load(Ordering::Acquire)
    }

    /// Whether the connection may return to the shared cache
    ///
    /// Dead connections, zone-transfer sessions, and connections that
    /// carried TLV-bearing PROXY payloads never go back.
    #[must_use]
    pub fn can_be_reused(&self) -> bool {
        !self.is_closed()
            && !self.shared.used_for_xfr.load(Ordering::Acquire)
            && !self.shared.tlv_locked.load(Ordering::Acquire)
    }

    /// Dedicate this connection to a zone-transfer session
    ///
    /// # Errors
    ///
    /// Fails if the connection already carried a zone transfer.
    pub fn mark_xfr(&self) -> GateResult<()> {
        if self.shared.used_for_xfr.swap(true, Ordering::AcqRel) {
            return Err(GateError::backend(
                &self.backend.name,
                "connection already consumed by a zone transfer",
            ));
        }
        Ok(())
    }

    /// Compare previously sent PROXY TLVs against a query's TLV set
    #[must_use]
    pub fn matches_tlvs(&self, tlvs: Option<&Vec<ProxyTlv>>) -> bool {
        let sent = self.shared.tlvs_sent.lock();
        match (tlvs, sent.as_ref()) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Record the TLVs this connection has carried
    ///
    /// Later values are ignored; matching happened before queueing.
    pub fn set_tlvs_sent(&self, tlvs: Vec<ProxyTlv>) {
        let mut sent = self.shared.tlvs_sent.lock();
        if sent.is_none() {
            *sent = Some(tlvs);
        }
    }

    /// Hand the connection a PROXY payload to write before the first query
    pub fn set_proxy_payload(&self, payload: Vec<u8>) {
        let mut slot = self.shared.proxy_payload.lock();
        if slot.is_none() {
            *slot = Some(payload);
        }
    }

    /// Record that a TLV-bearing payload was folded into a query buffer
    ///
    /// Locks the connection out of the shared cache for good.
    pub fn set_tlv_payload_added(&self) {
        self.shared.tlv_locked.store(true, Ordering::Release);
    }

    /// Queue a framed query onto this connection
    ///
    /// Responses and failure notices come back on `reply`.
    ///
    /// # Errors
    ///
    /// Fails if the connection task is gone.
    pub async fn queue_query(
        &self,
        query: TcpQuery,
        reply: QueryReplySender,
    ) -> GateResult<()> {
        self.tx
            .send(BackendRequest { query, reply })
            .await
            .map_err(|_| GateError::backend(&self.backend.name, "connection task is gone"))
    }
}

// ============================================================================
// Connection task
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Prefix,
    Body,
}

enum Step {
    Continue,
    Shutdown,
    Failed,
    TimedOut,
}

enum Wake {
    Request(Option<BackendRequest>),
    Read(std::io::Result<usize>),
    Timeout,
}

struct ConnectionTask {
    backend: Arc<Backend>,
    shared: Arc<ConnShared>,
    rx: mpsc::Receiver<BackendRequest>,
    weak_tx: mpsc::WeakSender<BackendRequest>,
    stream: Option<TcpStream>,
    pending: VecDeque<BackendRequest>,
    read_phase: ReadPhase,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_deadline: Instant,
    failures: u32,
    payload_written: bool,
    xfr_started: bool,
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            let step = if self.pending.is_empty() {
                self.idle_step().await
            } else {
                self.active_step().await
            };

            match step {
                Step::Continue => {}
                Step::Shutdown => break,
                Step::TimedOut => {
                    self.backend
                        .stats
                        .tcp_read_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    self.fail_all_pending();
                    break;
                }
                Step::Failed => {
                    if !self.try_recover().await {
                        self.backend
                            .stats
                            .tcp_gave_up
                            .fetch_add(1, Ordering::Relaxed);
                        self.fail_all_pending();
                        break;
                    }
                }
            }
        }

        self.shared.closed.store(true, Ordering::Release);
        self.disconnect();
    }

    /// Wait for work while nothing is in flight
    ///
    /// A live socket is still watched: EOF, an error, or unsolicited data
    /// marks the connection unusable so the cache never hands it out again.
    async fn idle_step(&mut self) -> Step {
        let wake = match self.stream.as_mut() {
            Some(stream) => {
                let mut probe = [0u8; 1];
                tokio::select! {
                    request = self.rx.recv() => Wake::Request(request),
                    result = stream.read(&mut probe) => Wake::Read(result),
                }
            }
            None => Wake::Request(self.rx.recv().await),
        };

        match wake {
            Wake::Request(Some(request)) => self.handle_request(request).await,
            Wake::Request(None) => Step::Shutdown,
            Wake::Read(result) => {
                match result {
                    Ok(0) => trace!(backend = %self.backend.name, "idle connection closed by backend"),
                    Ok(_) => debug!(backend = %self.backend.name, "unsolicited data on idle connection"),
                    Err(e) => trace!(backend = %self.backend.name, error = %e, "idle connection error"),
                }
                Step::Shutdown
            }
            Wake::Timeout => Step::Continue,
        }
    }

    /// Wait for work while responses are pending
    async fn active_step(&mut self) -> Step {
        let deadline = self.read_deadline;
        let wake = {
            let Some(stream) = self.stream.as_mut() else {
                return Step::Failed;
            };
            tokio::select! {
                request = self.rx.recv() => Wake::Request(request),
                result = stream.read(&mut self.read_buf[self.read_pos..]) => Wake::Read(result),
                () = time::sleep_until(deadline) => Wake::Timeout,
            }
        };

        match wake {
            Wake::Request(Some(request)) => self.handle_request(request).await,
            // every handle is gone: whoever queued these queries cannot
            // consume their responses anymore
            Wake::Request(None) => Step::Shutdown,
            Wake::Read(Ok(0)) => {
                self.backend
                    .stats
                    .tcp_died_reading_response
                    .fetch_add(1, Ordering::Relaxed);
                Step::Failed
            }
            Wake::Read(Ok(n)) => {
                self.read_pos += n;
                self.read_deadline = Instant::now() + self.backend.read_timeout;
                if self.read_pos == self.read_buf.len() {
                    self.advance_read_phase()
                } else {
                    Step::Continue
                }
            }
            Wake::Read(Err(e)) => {
                debug!(backend = %self.backend.name, error = %e, "read error");
                self.backend
                    .stats
                    .tcp_died_reading_response
                    .fetch_add(1, Ordering::Relaxed);
                Step::Failed
            }
            Wake::Timeout => Step::TimedOut,
        }
    }

    fn advance_read_phase(&mut self) -> Step {
        match self.read_phase {
            ReadPhase::Prefix => {
                let size = proto::decode_frame_length([self.read_buf[0], self.read_buf[1]]);
                if size < DNS_HEADER_SIZE {
                    debug!(backend = %self.backend.name, size, "response frame below header size");
                    return Step::Failed;
                }
                self.read_phase = ReadPhase::Body;
                self.read_buf = vec![0u8; size];
                self.read_pos = 0;
                Step::Continue
            }
            ReadPhase::Body => self.dispatch_response(),
        }
    }

    fn reset_read_state(&mut self) {
        self.read_phase = ReadPhase::Prefix;
        self.read_buf = vec![0u8; 2];
        self.read_pos = 0;
    }

    /// Route a fully read response frame to its owner
    fn dispatch_response(&mut self) -> Step {
        let buffer = std::mem::replace(&mut self.read_buf, Vec::new());
        self.reset_read_state();

        if self.shared.used_for_xfr.load(Ordering::Acquire) {
            // every frame of the transfer goes to the one pending query
            let Some(entry) = self.pending.front() else {
                return Step::Failed;
            };
            self.failures = 0;
            if !self.xfr_started {
                self.xfr_started = true;
                self.backend.stats.responses.fetch_add(1, Ordering::Relaxed);
            }
            let response = TcpResponse {
                buffer,
                ids: Some(entry.query.ids.clone()),
                connection: self.make_handle(),
                self_generated: false,
            };
            if entry.reply.send(ConnectionEvent::Response(response)).is_err() {
                trace!(backend = %self.backend.name, "zone transfer consumer is gone");
                return Step::Shutdown;
            }
            return Step::Continue;
        }

        let id = proto::message_id(&buffer);
        let Some(position) = self
            .pending
            .iter()
            .position(|entry| entry.query.ids.original_id == id)
        else {
            warn!(backend = %self.backend.name, id, "response with unknown id, failing connection");
            return Step::Failed;
        };

        let entry = self.pending.remove(position).expect("position just found");
        self.failures = 0;
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.backend.stats.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.backend.stats.responses.fetch_add(1, Ordering::Relaxed);

        let response = TcpResponse {
            buffer,
            ids: Some(entry.query.ids.clone()),
            connection: self.make_handle(),
            self_generated: false,
        };
        // a failed send means the client connection is gone; the response
        // is simply discarded
        let _ = entry.reply.send(ConnectionEvent::Response(response));
        Step::Continue
    }

    async fn handle_request(&mut self, request: BackendRequest) -> Step {
        if !request.query.is_xfr
            && self
                .pending
                .iter()
                .any(|entry| entry.query.ids.original_id == request.query.ids.original_id)
        {
            debug!(
                backend = %self.backend.name,
                id = request.query.ids.original_id,
                "duplicate query id on one connection, rejecting"
            );
            let _ = request
                .reply
                .send(ConnectionEvent::IoError(request.query.ids.clone()));
            return Step::Continue;
        }

        if let Err(e) = self.ensure_connected().await {
            debug!(backend = %self.backend.name, error = %e, "connect failed");
            self.pending.push_back(request);
            self.account_last_pending();
            return Step::Failed;
        }

        let is_xfr = request.query.is_xfr;
        self.pending.push_back(request);
        self.account_last_pending();

        let index = self.pending.len() - 1;
        match self.write_query(index).await {
            Ok(()) => {
                self.shared.queries.fetch_add(1, Ordering::Relaxed);
                self.backend.stats.queries.fetch_add(1, Ordering::Relaxed);
                self.read_deadline = Instant::now() + self.backend.read_timeout;
                trace!(backend = %self.backend.name, xfr = is_xfr, "query written");
                Step::Continue
            }
            Err(e) => {
                debug!(backend = %self.backend.name, error = %e, "write failed");
                self.backend
                    .stats
                    .tcp_died_sending_query
                    .fetch_add(1, Ordering::Relaxed);
                Step::Failed
            }
        }
    }

    /// Count the just-queued entry as in flight
    fn account_last_pending(&self) {
        let entry = self.pending.back().expect("entry was just pushed");
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        if !entry.query.is_xfr {
            self.backend.stats.outstanding.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn ensure_connected(&mut self) -> GateResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let connect = TcpStream::connect(self.backend.addr);
        let stream = time::timeout(self.backend.connect_timeout, connect)
            .await
            .map_err(|_| {
                GateError::timeout(
                    format!("connecting to backend {}", self.backend.name),
                    self.backend.connect_timeout,
                )
            })?
            .map_err(|e| {
                GateError::network_io(format!("connecting to backend {}", self.backend.name), e)
            })?;
        stream.set_nodelay(true).ok();

        self.backend
            .stats
            .tcp_current_connections
            .fetch_add(1, Ordering::Relaxed);
        self.payload_written = false;
        self.reset_read_state();
        self.stream = Some(stream);
        debug!(backend = %self.backend.name, addr = %self.backend.addr, "connected");
        Ok(())
    }

    /// Write one pending query, preceded by the PROXY payload if it has
    /// not been written on this socket yet
    ///
    /// TLV-locked connections carry their payload inside the first query
    /// buffer; any payload handed over afterwards is ignored.
    async fn write_query(&mut self, index: usize) -> GateResult<()> {
        let payload = if self.payload_written || self.shared.tlv_locked.load(Ordering::Acquire) {
            None
        } else {
            self.shared.proxy_payload.lock().clone()
        };

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| GateError::backend(&self.backend.name, "not connected"))?;
        let buffer = &self.pending[index].query.buffer;
        let write_timeout = self.backend.write_timeout;

        let write = async {
            if let Some(payload) = &payload {
                stream.write_all(payload).await?;
            }
            stream.write_all(buffer).await?;
            Ok::<(), std::io::Error>(())
        };

        match time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {
                if payload.is_some() {
                    self.payload_written = true;
                }
                Ok(())
            }
            Ok(Err(e)) => Err(GateError::network_io("writing query to backend", e)),
            Err(_) => {
                self.backend
                    .stats
                    .tcp_write_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                Err(GateError::timeout("writing query to backend", write_timeout))
            }
        }
    }

    /// Reconnect and resend every pending query, within the retry budget
    ///
    /// Zone-transfer sessions that already carried a query are never
    /// retried: the transfer state on the backend side is gone.
    async fn try_recover(&mut self) -> bool {
        if self.shared.used_for_xfr.load(Ordering::Acquire)
            && self.shared.queries.load(Ordering::Relaxed) > 0
        {
            return false;
        }
        if self.pending.is_empty() {
            return false;
        }

        while self.failures < self.backend.retries {
            self.failures += 1;
            self.disconnect();
            self.shared.fresh.store(true, Ordering::Release);

            debug!(
                backend = %self.backend.name,
                attempt = self.failures,
                pending = self.pending.len(),
                "reconnecting to resend in-flight queries"
            );

            if self.ensure_connected().await.is_err() {
                continue;
            }

            let mut resent = true;
            for index in 0..self.pending.len() {
                if self.write_query(index).await.is_err() {
                    resent = false;
                    break;
                }
            }
            if resent {
                self.read_deadline = Instant::now() + self.backend.read_timeout;
                return true;
            }
        }

        false
    }

    /// Report every pending query as failed to its owner
    fn fail_all_pending(&mut self) {
        for entry in self.pending.drain(..) {
            self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            if !entry.query.is_xfr {
                self.backend.stats.outstanding.fetch_sub(1, Ordering::Relaxed);
            }
            let _ = entry
                .reply
                .send(ConnectionEvent::IoError(entry.query.ids.clone()));
        }
    }

    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            self.backend
                .stats
                .tcp_current_connections
                .fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn make_handle(&self) -> Option<BackendConnectionHandle> {
        self.weak_tx.upgrade().map(|tx| BackendConnectionHandle {
            backend: Arc::clone(&self.backend),
            tx,
            shared: Arc::clone(&self.shared),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn test_backend(addr: SocketAddr) -> Arc<Backend> {
        let mut config = BackendConfig::new("test", addr);
        config.connect_timeout_secs = 2;
        config.read_timeout_secs = 2;
        config.write_timeout_secs = 2;
        config.retries = 2;
        Arc::new(Backend::from_config(&config))
    }

    fn ids(id: u16) -> QueryIdState {
        QueryIdState {
            original_id: id,
            qname: hickory_proto::rr::Name::from_str("example.com.").unwrap(),
            qtype: 1,
            qclass: 1,
            client: "127.0.0.1:40000".parse().unwrap(),
            received_at: std::time::Instant::now(),
        }
    }

    fn framed_query(id: u16) -> Vec<u8> {
        let mut message = vec![
            (id >> 8) as u8,
            (id & 0xff) as u8,
            0x01,
            0x00,
            0x00,
            0x01,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
        ];
        message.extend_from_slice(&[
            0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00,
            0x01, 0x00, 0x01,
        ]);
        crate::proto::prepend_frame_length(&mut message).unwrap();
        message
    }

    fn query(id: u16) -> TcpQuery {
        TcpQuery {
            buffer: framed_query(id),
            ids: ids(id),
            is_xfr: false,
        }
    }

    async fn read_framed(stream: &mut TcpStream) -> Vec<u8> {
        let mut prefix = [0u8; 2];
        stream.read_exact(&mut prefix).await.unwrap();
        let len = proto::decode_frame_length(prefix);
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        body
    }

    async fn write_framed(stream: &mut TcpStream, message: &[u8]) {
        let mut framed = message.to_vec();
        proto::prepend_frame_length(&mut framed).unwrap();
        stream.write_all(&framed).await.unwrap();
    }

    /// Turn a query message into a minimal response (qr bit set)
    fn answer_for(query: &[u8]) -> Vec<u8> {
        let mut response = query.to_vec();
        response[2] |= 0x80;
        response
    }

    // ========================================================================
    // Happy Path Tests
    // ========================================================================

    #[tokio::test]
    async fn test_single_query_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let q = read_framed(&mut stream).await;
            write_framed(&mut stream, &answer_for(&q)).await;
        });

        let backend = test_backend(addr);
        let conn = BackendConnectionHandle::establish(Arc::clone(&backend));
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        conn.queue_query(query(0x1234), reply_tx).await.unwrap();

        match reply_rx.recv().await.unwrap() {
            ConnectionEvent::Response(response) => {
                assert_eq!(proto::message_id(&response.buffer), 0x1234);
                assert_eq!(response.ids.unwrap().original_id, 0x1234);
                assert!(response.connection.is_some());
            }
            other => panic!("expected response, got {other:?}"),
        }

        assert!(conn.is_idle());
        assert!(conn.can_be_reused());
        assert_eq!(backend.stats.snapshot().responses, 1);
        assert_eq!(backend.stats.snapshot().outstanding, 0);
    }

    #[tokio::test]
    async fn test_pipelined_queries_answered_out_of_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let q1 = read_framed(&mut stream).await;
            let q2 = read_framed(&mut stream).await;
            // answer the second query first
            write_framed(&mut stream, &answer_for(&q2)).await;
            write_framed(&mut stream, &answer_for(&q1)).await;
        });

        let backend = test_backend(addr);
        let conn = BackendConnectionHandle::establish(backend);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        conn.queue_query(query(1), reply_tx.clone()).await.unwrap();
        conn.queue_query(query(2), reply_tx).await.unwrap();

        let first = match reply_rx.recv().await.unwrap() {
            ConnectionEvent::Response(r) => r.ids.unwrap().original_id,
            other => panic!("expected response, got {other:?}"),
        };
        let second = match reply_rx.recv().await.unwrap() {
            ConnectionEvent::Response(r) => r.ids.unwrap().original_id,
            other => panic!("expected response, got {other:?}"),
        };

        assert_eq!(first, 2);
        assert_eq!(second, 1);
        assert!(conn.is_idle());
    }

    #[tokio::test]
    async fn test_proxy_payload_written_before_first_query() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let payload = b"PROXYISH".to_vec();
        let expected = payload.clone();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = vec![0u8; expected.len()];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(head, expected);
            let q = read_framed(&mut stream).await;
            write_framed(&mut stream, &answer_for(&q)).await;
        });

        let backend = test_backend(addr);
        let conn = BackendConnectionHandle::establish(backend);
        conn.set_proxy_payload(payload);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        conn.queue_query(query(7), reply_tx).await.unwrap();
        assert!(matches!(
            reply_rx.recv().await.unwrap(),
            ConnectionEvent::Response(_)
        ));
    }

    // ========================================================================
    // Failure and Recovery Tests
    // ========================================================================

    #[tokio::test]
    async fn test_reconnect_resends_pending_query() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // first connection: read the query, then slam the door
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_framed(&mut stream).await;
            drop(stream);
            // second connection: behave
            let (mut stream, _) = listener.accept().await.unwrap();
            let q = read_framed(&mut stream).await;
            write_framed(&mut stream, &answer_for(&q)).await;
        });

        let backend = test_backend(addr);
        let conn = BackendConnectionHandle::establish(Arc::clone(&backend));
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        conn.queue_query(query(9), reply_tx).await.unwrap();

        match reply_rx.recv().await.unwrap() {
            ConnectionEvent::Response(response) => {
                assert_eq!(proto::message_id(&response.buffer), 9);
            }
            other => panic!("expected response after reconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_gave_up_notifies_owner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // close every connection after reading the query
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 512];
                let _ = stream.read(&mut buf).await;
            }
        });

        let backend = test_backend(addr);
        let conn = BackendConnectionHandle::establish(Arc::clone(&backend));
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        conn.queue_query(query(5), reply_tx).await.unwrap();

        match reply_rx.recv().await.unwrap() {
            ConnectionEvent::IoError(failed) => assert_eq!(failed.original_id, 5),
            other => panic!("expected io error, got {other:?}"),
        }
        assert!(conn.is_closed());
        assert!(!conn.can_be_reused());
        assert_eq!(backend.stats.snapshot().tcp_gave_up, 1);
    }

    #[tokio::test]
    async fn test_unknown_response_id_fails_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let q = read_framed(&mut stream).await;
                let mut bogus = answer_for(&q);
                bogus[0] ^= 0xff; // wrong id
                write_framed(&mut stream, &bogus).await;
            }
        });

        let backend = test_backend(addr);
        let conn = BackendConnectionHandle::establish(backend);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        conn.queue_query(query(3), reply_tx).await.unwrap();

        // every reconnect attempt returns another bogus id, so the
        // connection eventually gives up and fails the query
        match reply_rx.recv().await.unwrap() {
            ConnectionEvent::IoError(failed) => assert_eq!(failed.original_id, 3),
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let q = read_framed(&mut stream).await;
            // hold the first response long enough for the duplicate to land
            tokio::time::sleep(Duration::from_millis(200)).await;
            write_framed(&mut stream, &answer_for(&q)).await;
        });

        let backend = test_backend(addr);
        let conn = BackendConnectionHandle::establish(backend);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        conn.queue_query(query(11), reply_tx.clone()).await.unwrap();
        conn.queue_query(query(11), reply_tx).await.unwrap();

        match reply_rx.recv().await.unwrap() {
            ConnectionEvent::IoError(failed) => assert_eq!(failed.original_id, 11),
            other => panic!("expected duplicate rejection, got {other:?}"),
        }
        match reply_rx.recv().await.unwrap() {
            ConnectionEvent::Response(response) => {
                assert_eq!(proto::message_id(&response.buffer), 11);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    // ========================================================================
    // Zone Transfer Tests
    // ========================================================================

    #[tokio::test]
    async fn test_xfr_streams_every_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let q = read_framed(&mut stream).await;
            for _ in 0..3 {
                write_framed(&mut stream, &answer_for(&q)).await;
            }
        });

        let backend = test_backend(addr);
        let conn = BackendConnectionHandle::establish(Arc::clone(&backend));
        conn.mark_xfr().unwrap();
        assert!(!conn.can_accept_new_queries());
        assert!(!conn.can_be_reused());

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let mut q = query(21);
        q.is_xfr = true;
        conn.queue_query(q, reply_tx).await.unwrap();

        for frame in 0..3 {
            match reply_rx.recv().await.unwrap() {
                ConnectionEvent::Response(response) => {
                    assert_eq!(proto::message_id(&response.buffer), 21);
                }
                other => panic!("expected xfr frame, got {other:?}"),
            }
            if frame < 2 {
                // the slot stays occupied for the whole session
                assert!(!conn.is_idle());
            }
        }

        // only the first frame counts as a response
        assert_eq!(backend.stats.snapshot().responses, 1);

        // backend closing the stream ends the session with an error notice
        match reply_rx.recv().await.unwrap() {
            ConnectionEvent::IoError(failed) => assert_eq!(failed.original_id, 21),
            other => panic!("expected end-of-session notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mark_xfr_twice_fails() {
        let backend = test_backend("127.0.0.1:1".parse().unwrap());
        let conn = BackendConnectionHandle::establish(backend);
        assert!(conn.mark_xfr().is_ok());
        assert!(conn.mark_xfr().is_err());
    }

    // ========================================================================
    // TLV Matching Tests
    // ========================================================================

    #[test]
    fn test_matches_tlvs() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let backend = test_backend("127.0.0.1:1".parse().unwrap());
        let conn = BackendConnectionHandle::establish(backend);

        let tlvs = vec![ProxyTlv {
            kind: 0xe0,
            value: b"edge".to_vec(),
        }];

        assert!(conn.matches_tlvs(None));
        assert!(!conn.matches_tlvs(Some(&tlvs)));

        conn.set_tlvs_sent(tlvs.clone());
        assert!(conn.matches_tlvs(Some(&tlvs)));
        assert!(!conn.matches_tlvs(None));
    }

    #[test]
    fn test_tlv_payload_locks_reuse() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let backend = test_backend("127.0.0.1:1".parse().unwrap());
        let conn = BackendConnectionHandle::establish(backend);

        assert!(conn.can_be_reused());
        conn.set_tlv_payload_added();
        assert!(!conn.can_be_reused());
    }
}
