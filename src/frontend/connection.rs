//! Client connection state machine
//!
//! One task per accepted socket. The machine moves through
//! `ReadingProxyHeader → ReadingQuerySize → ReadingQuery` on the way in,
//! and `SendingResponse` / `Idle` on the way out. Read and write progress
//! is explicit (`buffer + pos`), so arbitrary short reads and writes
//! survive event-loop iterations, and a response arriving from a backend
//! can interrupt the machine between frames.
//!
//! Head-of-line blocking is avoided on the response path: up to
//! `max_in_flight_per_conn` queries may be outstanding, responses are
//! written in whatever order backends finish, and only the bytes on the
//! wire are serialized: one response is written at a time, the rest wait
//! in the connection's queue.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::ProtocolVersion;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use super::stream::DnsStream;
use super::{ConnectionInfo, EngineContext, Frontend};
use crate::backend::{
    Backend, BackendConnectionCache, BackendConnectionHandle, ConnectionEvent, QueryIdState,
    TcpQuery, TcpResponse,
};
use crate::error::{GateError, GateResult};
use crate::pipeline::{QueryContext, QueryVerdict, ResponseContext};
use crate::proto::{self, DNS_HEADER_SIZE};
use crate::proxy_protocol::{self, ProxyDecode, ProxyTlv, PROXY_HEADER_MIN_SIZE};
use crate::rings::ResponseEntry;

/// What the connection's socket is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    ReadingProxyHeader,
    ReadingQuerySize,
    ReadingQuery,
    SendingResponse,
    Idle,
}

/// Which frame the read progress belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    ProxyHeader,
    QuerySize,
    QueryBody,
}

/// Loop control for one state-machine step
enum Flow {
    Continue,
    Close,
}

enum Wake {
    Event(Option<ConnectionEvent>),
    Io(std::io::Result<usize>),
    Timeout,
    DurationCap,
}

/// Accounting kept about the response currently on the wire
#[derive(Debug)]
struct SendingRecord {
    ids: Option<QueryIdState>,
    backend: Option<String>,
    self_generated: bool,
    rcode: u8,
    size: usize,
}

/// Per-accepted-socket state machine
pub struct ClientConnection {
    frontend: Arc<Frontend>,
    ctx: Arc<EngineContext>,
    cache: Arc<Mutex<BackendConnectionCache>>,
    stream: DnsStream,
    remote: SocketAddr,
    proxied_remote: SocketAddr,
    proxied_destination: SocketAddr,
    server_name: Option<String>,

    state: ConnState,
    read_phase: ReadPhase,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_want: usize,
    query_size: usize,

    write_buf: Vec<u8>,
    write_pos: usize,
    current_response: Option<SendingRecord>,
    queued_responses: VecDeque<TcpResponse>,

    active_backends: HashMap<String, Vec<BackendConnectionHandle>>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,

    queries_count: u64,
    in_flight: usize,
    is_xfr: bool,
    xfr_started: bool,
    reading_first_query: bool,
    proxy_payload_has_tlv: bool,
    proxy_values: Option<Vec<ProxyTlv>>,

    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Instant,
    write_deadline: Instant,
    duration_deadline: Option<Instant>,
}

impl ClientConnection {
    /// Entry point: consume an envelope, drive the connection to its end
    ///
    /// Spawned by the worker that received the envelope. All accounting
    /// the acceptor started (current-connection gauge, per-client count)
    /// is settled here.
    pub async fn run(
        info: ConnectionInfo,
        ctx: Arc<EngineContext>,
        cache: Arc<Mutex<BackendConnectionCache>>,
    ) {
        let frontend = Arc::clone(&info.frontend);
        let remote = info.remote;
        let tracker = Arc::clone(&ctx.tracker);

        match Self::start(info, ctx, cache).await {
            Ok(conn) => conn.process().await,
            Err(e) => {
                frontend
                    .stats
                    .tcp_died_reading_query
                    .fetch_add(1, Ordering::Relaxed);
                debug!(remote = %remote, error = %e, "connection setup failed");
            }
        }

        frontend
            .stats
            .tcp_current_connections
            .fetch_sub(1, Ordering::Relaxed);
        tracker.release_client(remote.ip());
    }

    /// Perform the handshake and build the machine in its initial state
    async fn start(
        info: ConnectionInfo,
        ctx: Arc<EngineContext>,
        cache: Arc<Mutex<BackendConnectionCache>>,
    ) -> GateResult<Self> {
        let ConnectionInfo {
            stream,
            remote,
            frontend,
        } = info;

        let read_timeout = Duration::from_secs(ctx.limits.client_read_timeout_secs.max(1));
        let write_timeout = Duration::from_secs(ctx.limits.client_write_timeout_secs.max(1));

        let stream = match &frontend.tls {
            Some(acceptor) => {
                let accept = acceptor.accept(stream);
                let tls = time::timeout(read_timeout, accept)
                    .await
                    .map_err(|_| GateError::timeout("TLS handshake", read_timeout))?
                    .map_err(|e| GateError::tls(format!("handshake with {remote}: {e}")))?;
                frontend.stats.tls_handshakes.fetch_add(1, Ordering::Relaxed);
                DnsStream::Tls(Box::new(tls))
            }
            None => DnsStream::Plain(stream),
        };
        let server_name = stream.server_name_indication();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let duration_deadline = (ctx.limits.max_connection_duration_secs > 0)
            .then(|| now + Duration::from_secs(ctx.limits.max_connection_duration_secs));

        let mut conn = Self {
            frontend: Arc::clone(&frontend),
            ctx,
            cache,
            stream,
            remote,
            proxied_remote: remote,
            proxied_destination: frontend.local,
            server_name,
            state: ConnState::ReadingQuerySize,
            read_phase: ReadPhase::QuerySize,
            read_buf: Vec::new(),
            read_pos: 0,
            read_want: 0,
            query_size: 0,
            write_buf: Vec::new(),
            write_pos: 0,
            current_response: None,
            queued_responses: VecDeque::new(),
            active_backends: HashMap::new(),
            event_tx,
            event_rx,
            queries_count: 0,
            in_flight: 0,
            is_xfr: false,
            xfr_started: false,
            reading_first_query: true,
            proxy_payload_has_tlv: false,
            proxy_values: None,
            read_timeout,
            write_timeout,
            read_deadline: now + read_timeout,
            write_deadline: now + write_timeout,
            duration_deadline,
        };
        conn.reset_for_new_query();

        if conn.frontend.expects_proxy_protocol_from(&remote) {
            conn.state = ConnState::ReadingProxyHeader;
            conn.read_phase = ReadPhase::ProxyHeader;
            conn.read_buf.clear();
            conn.read_buf.resize(PROXY_HEADER_MIN_SIZE, 0);
            conn.read_pos = 0;
            conn.read_want = PROXY_HEADER_MIN_SIZE;
        }

        trace!(remote = %remote, tls = conn.stream.is_tls(), "connection started");
        Ok(conn)
    }

    /// Drive the machine until it closes, settling the die counters
    async fn process(mut self) {
        match self.drive().await {
            Ok(()) => {
                trace!(remote = %self.remote, queries = self.queries_count, "connection closed");
            }
            Err(e) => {
                // every pre-response state counts as died-reading; only a
                // write in progress counts as died-sending
                if self.state == ConnState::SendingResponse {
                    self.frontend
                        .stats
                        .tcp_died_sending_response
                        .fetch_add(1, Ordering::Relaxed);
                } else {
                    self.frontend
                        .stats
                        .tcp_died_reading_query
                        .fetch_add(1, Ordering::Relaxed);
                }
                if self.reading_first_query {
                    trace!(remote = %self.remote, error = %e, "connection died before first query");
                } else {
                    debug!(remote = %self.remote, error = %e, "connection died");
                }
            }
        }
        let _ = self.stream.shutdown().await;
    }

    async fn drive(&mut self) -> GateResult<()> {
        loop {
            if let Some(deadline) = self.duration_deadline {
                if Instant::now() >= deadline {
                    debug!(remote = %self.remote, "maximum connection duration reached");
                    return Ok(());
                }
            }

            let flow = match self.state {
                ConnState::ReadingProxyHeader
                | ConnState::ReadingQuerySize
                | ConnState::ReadingQuery => self.read_step().await?,
                ConnState::SendingResponse => self.write_step().await?,
                ConnState::Idle => self.idle_step().await?,
            };

            if matches!(flow, Flow::Close) {
                return Ok(());
            }
        }
    }

    // ========================================================================
    // Event loop steps
    // ========================================================================

    async fn read_step(&mut self) -> GateResult<Flow> {
        let deadline = self.read_deadline;
        let want = self.read_want;
        let wake = {
            let Self {
                stream,
                event_rx,
                read_buf,
                read_pos,
                ..
            } = self;
            tokio::select! {
                event = event_rx.recv() => Wake::Event(event),
                result = stream.read(&mut read_buf[*read_pos..want]) => Wake::Io(result),
                () = time::sleep_until(deadline) => Wake::Timeout,
            }
        };

        match wake {
            Wake::Event(Some(event)) => self.on_event(event),
            Wake::Event(None) => Ok(Flow::Continue),
            Wake::Io(Ok(0)) => Err(GateError::network("connection closed by client")),
            Wake::Io(Ok(n)) => {
                self.read_pos += n;
                self.read_deadline = Instant::now() + self.read_timeout;
                if self.read_pos == self.read_want {
                    self.on_read_complete().await
                } else {
                    Ok(Flow::Continue)
                }
            }
            Wake::Io(Err(e)) => Err(GateError::network_io("reading from client", e)),
            Wake::Timeout => Ok(self.on_read_timeout()),
            Wake::DurationCap => Ok(Flow::Close),
        }
    }

    async fn write_step(&mut self) -> GateResult<Flow> {
        let deadline = self.write_deadline;
        let wake = {
            let Self {
                stream,
                event_rx,
                write_buf,
                write_pos,
                ..
            } = self;
            tokio::select! {
                event = event_rx.recv() => Wake::Event(event),
                result = stream.write(&write_buf[*write_pos..]) => Wake::Io(result),
                () = time::sleep_until(deadline) => Wake::Timeout,
            }
        };

        match wake {
            Wake::Event(Some(event)) => self.on_event(event),
            Wake::Event(None) => Ok(Flow::Continue),
            Wake::Io(Ok(0)) => Err(GateError::network("client stopped accepting bytes")),
            Wake::Io(Ok(n)) => {
                self.write_pos += n;
                self.write_deadline = Instant::now() + self.write_timeout;
                if self.write_pos == self.write_buf.len() {
                    self.on_response_sent()
                } else {
                    Ok(Flow::Continue)
                }
            }
            Wake::Io(Err(e)) => Err(GateError::network_io("writing to client", e)),
            Wake::Timeout => {
                self.frontend
                    .stats
                    .tcp_client_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                debug!(remote = %self.remote, "write timeout, dropping connection");
                Ok(Flow::Close)
            }
            Wake::DurationCap => Ok(Flow::Close),
        }
    }

    /// Parked: not reading from the client, waiting on backends
    async fn idle_step(&mut self) -> GateResult<Flow> {
        let cap = self.duration_deadline;
        let wake = {
            let Self { event_rx, .. } = self;
            tokio::select! {
                event = event_rx.recv() => Wake::Event(event),
                () = time::sleep_until(cap.unwrap_or_else(Instant::now)), if cap.is_some() => {
                    Wake::DurationCap
                }
            }
        };

        match wake {
            Wake::Event(Some(event)) => self.on_event(event),
            Wake::Event(None) => Ok(Flow::Continue),
            Wake::DurationCap => {
                debug!(remote = %self.remote, "maximum connection duration reached while idle");
                Ok(Flow::Close)
            }
            _ => Ok(Flow::Continue),
        }
    }

    /// Read deadline policy: with nothing in flight the client is simply
    /// gone; with queries in flight, stop reading and wait for backends
    fn on_read_timeout(&mut self) -> Flow {
        if self.in_flight == 0 {
            self.frontend
                .stats
                .tcp_client_timeouts
                .fetch_add(1, Ordering::Relaxed);
            debug!(remote = %self.remote, "client read timeout, dropping connection");
            Flow::Close
        } else {
            trace!(remote = %self.remote, in_flight = self.in_flight, "read timeout with queries in flight, going idle");
            self.state = ConnState::Idle;
            Flow::Continue
        }
    }

    // ========================================================================
    // Read-side frame handling
    // ========================================================================

    async fn on_read_complete(&mut self) -> GateResult<Flow> {
        match self.read_phase {
            ReadPhase::ProxyHeader => self.on_proxy_header(),
            ReadPhase::QuerySize => self.on_query_size(),
            ReadPhase::QueryBody => self.handle_query().await,
        }
    }

    fn on_proxy_header(&mut self) -> GateResult<Flow> {
        match proxy_protocol::decode_header(&self.read_buf[..self.read_pos]) {
            ProxyDecode::Invalid => {
                self.frontend
                    .stats
                    .proxy_protocol_invalid
                    .fetch_add(1, Ordering::Relaxed);
                debug!(remote = %self.remote, "invalid PROXY protocol header");
                Ok(Flow::Close)
            }
            ProxyDecode::Incomplete { needed } => {
                self.read_want = self.read_pos + needed;
                self.read_buf.resize(self.read_want, 0);
                Ok(Flow::Continue)
            }
            ProxyDecode::Complete(header) => {
                if let Some((source, destination)) = header.addresses {
                    // rules, logs, and the backend payload all see the
                    // proxied addresses from here on
                    if !self.frontend.allows(&source) {
                        self.frontend.stats.acl_drops.fetch_add(1, Ordering::Relaxed);
                        debug!(remote = %self.remote, proxied = %source, "proxied source dropped by ACL");
                        return Ok(Flow::Close);
                    }
                    self.proxied_remote = source;
                    self.proxied_destination = destination;
                }
                if !header.tlvs.is_empty() {
                    self.proxy_values = Some(header.tlvs);
                }
                trace!(remote = %self.remote, proxied = %self.proxied_remote, "PROXY header consumed");

                let leftover = self.read_buf[header.consumed..self.read_pos].to_vec();
                self.reset_for_new_query();
                self.state = ConnState::ReadingQuerySize;
                self.ingest(&leftover);
                Ok(Flow::Continue)
            }
        }
    }

    fn on_query_size(&mut self) -> GateResult<Flow> {
        let size = proto::decode_frame_length([self.read_buf[0], self.read_buf[1]]);
        if size < DNS_HEADER_SIZE {
            self.frontend
                .stats
                .non_compliant_queries
                .fetch_add(1, Ordering::Relaxed);
            debug!(remote = %self.remote, size, "query frame below header size");
            return Ok(Flow::Close);
        }

        self.query_size = size;
        // room for in-place rewriting later in the pipeline
        let capacity = (size + 512).max(self.ctx.limits.max_buffer_floor);
        self.read_buf.resize(capacity, 0);
        self.read_pos = 0;
        self.read_want = size;
        self.read_phase = ReadPhase::QueryBody;
        self.state = ConnState::ReadingQuery;
        Ok(Flow::Continue)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn handle_query(&mut self) -> GateResult<Flow> {
        let mut buffer = mem::take(&mut self.read_buf);
        buffer.truncate(self.query_size);
        self.reset_for_new_query();

        self.reading_first_query = false;
        self.queries_count += 1;
        self.frontend.stats.queries.fetch_add(1, Ordering::Relaxed);
        self.count_tls_query();

        let received_at = std::time::Instant::now();

        if !proto::check_query_headers(&buffer) {
            // not a query; swallow it and keep the connection going
            trace!(remote = %self.proxied_remote, "query rejected by header checks");
            return self.after_dispatch();
        }

        if proto::qdcount(&buffer) == 0 {
            proto::set_notimp(&mut buffer);
            self.in_flight += 1;
            return self.start_sending(TcpResponse::self_generated(buffer));
        }

        let question = proto::parse_question(&buffer)?;
        self.is_xfr = question.is_xfr();

        let verdict = {
            let mut query = QueryContext {
                buffer: &mut buffer,
                question: &question,
                client: self.proxied_remote,
                destination: self.proxied_destination,
                server_name: self.server_name.as_deref(),
                proxy_tlvs: self.proxy_values.as_deref(),
                is_xfr: self.is_xfr,
            };
            self.ctx.pipeline.process_query(&mut query)
        };

        match verdict {
            QueryVerdict::Drop => {
                trace!(remote = %self.proxied_remote, qname = %question.name, "query dropped");
                Ok(Flow::Close)
            }
            QueryVerdict::Respond => {
                self.in_flight += 1;
                self.start_sending(TcpResponse::self_generated(buffer))
            }
            QueryVerdict::Forward(backend) => {
                self.forward_query(backend, buffer, &question, received_at)
                    .await
            }
        }
    }

    async fn forward_query(
        &mut self,
        backend: Arc<Backend>,
        mut buffer: Vec<u8>,
        question: &proto::Question,
        received_at: std::time::Instant,
    ) -> GateResult<Flow> {
        let ids = QueryIdState {
            original_id: proto::message_id(&buffer),
            qname: question.name.clone(),
            qtype: question.qtype,
            qclass: question.qclass,
            client: self.proxied_remote,
            received_at,
        };

        proto::prepend_frame_length(&mut buffer)?;

        let conn = self.backend_connection_for(&backend);
        if self.is_xfr {
            conn.mark_xfr()?;
        }

        if backend.use_proxy_protocol {
            // once a TLV has been sent on this client connection, every
            // later payload is TLV-bearing as well
            if !self.proxy_payload_has_tlv {
                self.proxy_payload_has_tlv = self.proxy_values.is_some();
            }
            let payload = proxy_protocol::encode_v2(
                Some((self.proxied_remote, self.proxied_destination)),
                self.proxy_values.as_deref().unwrap_or(&[]),
            );
            if self.proxy_payload_has_tlv && conn.is_fresh() {
                // the connection can never be shared anyway, fold the
                // payload into the query itself
                buffer.splice(0..0, payload);
                conn.set_tlv_payload_added();
            } else {
                // written ahead of the first query bytes; a no-op on
                // connections that already carried their payload
                conn.set_proxy_payload(payload);
            }
            if let Some(tlvs) = &self.proxy_values {
                conn.set_tlvs_sent(tlvs.clone());
            }
        }

        debug!(
            qname = %ids.qname,
            qtype = ids.qtype,
            client = %self.proxied_remote,
            backend = %backend.name,
            dot = self.stream.is_tls(),
            "query relayed to backend"
        );

        conn.queue_query(
            TcpQuery {
                buffer,
                ids,
                is_xfr: self.is_xfr,
            },
            self.event_tx.clone(),
        )
        .await?;
        self.in_flight += 1;

        self.after_dispatch()
    }

    /// Common tail after a query left the read path
    fn after_dispatch(&mut self) -> GateResult<Flow> {
        if let Some(next) = self.queued_responses.pop_front() {
            return self.start_sending(next);
        }
        if self.can_accept_new_queries() {
            self.state = ConnState::ReadingQuerySize;
            self.read_deadline = Instant::now() + self.read_timeout;
        } else {
            self.state = ConnState::Idle;
        }
        Ok(Flow::Continue)
    }

    /// Find or create a backend connection this query may be pipelined on
    ///
    /// Zone transfers never share: they consume a connection of their own.
    fn backend_connection_for(&mut self, backend: &Arc<Backend>) -> BackendConnectionHandle {
        let tlvs = self.proxy_values.as_ref();
        if !self.is_xfr {
            if let Some(list) = self.active_backends.get(&backend.name) {
                for conn in list {
                    if conn.can_accept_new_queries() && conn.matches_tlvs(tlvs) {
                        conn.set_reused();
                        return conn.clone();
                    }
                }
            }
        }

        let conn = self.cache.lock().acquire(backend);
        self.active_backends
            .entry(backend.name.clone())
            .or_default()
            .push(conn.clone());
        conn
    }

    // ========================================================================
    // Response path
    // ========================================================================

    fn on_event(&mut self, event: ConnectionEvent) -> GateResult<Flow> {
        match event {
            ConnectionEvent::Response(response) => self.on_backend_response(response),
            ConnectionEvent::IoError(ids) => self.on_backend_io_error(&ids),
        }
    }

    fn on_backend_response(&mut self, mut response: TcpResponse) -> GateResult<Flow> {
        // an idle, reusable connection goes back to the shared cache the
        // moment its last response arrives
        if !self.is_xfr {
            if let Some(conn) = &response.connection {
                if conn.is_idle() && conn.can_be_reused() {
                    self.release_active_connection(conn.clone());
                }
            }
        }

        if response.buffer.len() < DNS_HEADER_SIZE {
            return Ok(Flow::Continue);
        }
        let Some(ids) = response.ids.clone() else {
            return Ok(Flow::Continue);
        };

        if self.is_xfr {
            if !self.xfr_started {
                self.xfr_started = true;
                self.frontend.stats.responses.fetch_add(1, Ordering::Relaxed);
            }
            return self.send_or_queue(response);
        }

        if !proto::response_content_matches(&response.buffer, &ids.qname, ids.qtype, ids.qclass) {
            trace!(qname = %ids.qname, "response does not answer the query, dropped");
            return Ok(Flow::Continue);
        }

        let keep = {
            let backend_name = response
                .connection
                .as_ref()
                .map(|conn| conn.backend().name.clone());
            let mut ctx = ResponseContext {
                buffer: &mut response.buffer,
                client: ids.client,
                backend: backend_name.as_deref(),
            };
            self.ctx.pipeline.process_response(&mut ctx)
        };
        if !keep {
            trace!(qname = %ids.qname, "response dropped by response rules");
            return Ok(Flow::Continue);
        }

        self.frontend.stats.responses.fetch_add(1, Ordering::Relaxed);
        self.send_or_queue(response)
    }

    /// Write now when the socket is free, queue otherwise
    fn send_or_queue(&mut self, response: TcpResponse) -> GateResult<Flow> {
        match self.state {
            ConnState::Idle | ConnState::ReadingProxyHeader | ConnState::ReadingQuerySize => {
                self.start_sending(response)
            }
            _ => {
                self.queued_responses.push_back(response);
                trace!(
                    queued = self.queued_responses.len(),
                    "response queued behind current I/O"
                );
                Ok(Flow::Continue)
            }
        }
    }

    fn start_sending(&mut self, response: TcpResponse) -> GateResult<Flow> {
        let TcpResponse {
            mut buffer,
            ids,
            connection,
            self_generated,
        } = response;

        let rcode = if buffer.len() >= DNS_HEADER_SIZE {
            proto::rcode(&buffer)
        } else {
            0
        };
        let size = buffer.len();
        proto::prepend_frame_length(&mut buffer)?;

        self.current_response = Some(SendingRecord {
            ids,
            backend: connection.map(|conn| conn.backend().name.clone()),
            self_generated,
            rcode,
            size,
        });
        self.write_buf = buffer;
        self.write_pos = 0;
        self.state = ConnState::SendingResponse;
        self.write_deadline = Instant::now() + self.write_timeout;
        Ok(Flow::Continue)
    }

    fn on_response_sent(&mut self) -> GateResult<Flow> {
        let record = self
            .current_response
            .take()
            .ok_or_else(|| GateError::network("sending state without a response"))?;
        self.write_buf = Vec::new();
        self.write_pos = 0;

        if !self.is_xfr {
            self.in_flight = self.in_flight.saturating_sub(1);

            match record.rcode {
                0 => self
                    .frontend
                    .stats
                    .frontend_noerror
                    .fetch_add(1, Ordering::Relaxed),
                2 => self
                    .frontend
                    .stats
                    .frontend_servfail
                    .fetch_add(1, Ordering::Relaxed),
                3 => self
                    .frontend
                    .stats
                    .frontend_nxdomain
                    .fetch_add(1, Ordering::Relaxed),
                _ => 0,
            };

            if !record.self_generated {
                if let Some(ids) = &record.ids {
                    let latency = ids.received_at.elapsed();
                    self.ctx.rings.insert(ResponseEntry {
                        client: ids.client,
                        qname: ids.qname.clone(),
                        qtype: ids.qtype,
                        latency,
                        size: record.size,
                        rcode: record.rcode,
                        backend: record.backend.clone(),
                    });
                    debug!(
                        qname = %ids.qname,
                        client = %ids.client,
                        latency_us = latency.as_micros() as u64,
                        "response relayed to client"
                    );
                }
            }

            let max_queries = self.ctx.limits.max_queries_per_conn;
            if max_queries != 0 && self.queries_count > max_queries {
                debug!(remote = %self.remote, queries = self.queries_count, "maximum queries per connection reached");
                return Ok(Flow::Close);
            }
            if let Some(deadline) = self.duration_deadline {
                if Instant::now() >= deadline {
                    debug!(remote = %self.remote, "maximum connection duration reached");
                    return Ok(Flow::Close);
                }
            }
        }

        if let Some(next) = self.queued_responses.pop_front() {
            return self.start_sending(next);
        }

        if self.is_xfr {
            if self.in_flight == 0 {
                // the backend ended the session while frames were still
                // being written out
                debug!(remote = %self.remote, "zone transfer session ended");
                return Ok(Flow::Close);
            }
            // still reading from the backend, not from the client
            self.state = ConnState::Idle;
            return Ok(Flow::Continue);
        }

        if self.can_accept_new_queries() {
            self.state = self.resume_read_state();
            self.read_deadline = Instant::now() + self.read_timeout;
        } else {
            self.state = ConnState::Idle;
        }
        Ok(Flow::Continue)
    }

    fn on_backend_io_error(&mut self, ids: &QueryIdState) -> GateResult<Flow> {
        self.in_flight = self.in_flight.saturating_sub(1);
        debug!(qname = %ids.qname, client = %ids.client, "backend failed the query");
        self.prune_active_connections();

        if self.state == ConnState::SendingResponse {
            // finish what is on the wire first
            return Ok(Flow::Continue);
        }
        if let Some(next) = self.queued_responses.pop_front() {
            return self.start_sending(next);
        }
        if self.in_flight == 0 && self.state == ConnState::Idle {
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    // ========================================================================
    // Bookkeeping helpers
    // ========================================================================

    fn can_accept_new_queries(&self) -> bool {
        if self.is_xfr {
            return false;
        }
        self.in_flight < self.frontend.max_in_flight_per_conn
    }

    fn reset_for_new_query(&mut self) {
        self.read_phase = ReadPhase::QuerySize;
        self.read_buf.clear();
        self.read_buf.resize(2, 0);
        self.read_pos = 0;
        self.read_want = 2;
        self.query_size = 0;
    }

    /// Feed bytes that were read past a consumed preamble back into the
    /// current frame
    fn ingest(&mut self, leftover: &[u8]) {
        debug_assert!(leftover.len() <= self.read_want - self.read_pos);
        let n = leftover.len().min(self.read_want - self.read_pos);
        self.read_buf[self.read_pos..self.read_pos + n].copy_from_slice(&leftover[..n]);
        self.read_pos += n;
    }

    fn resume_read_state(&self) -> ConnState {
        match self.read_phase {
            ReadPhase::ProxyHeader => ConnState::ReadingProxyHeader,
            ReadPhase::QuerySize => ConnState::ReadingQuerySize,
            ReadPhase::QueryBody => ConnState::ReadingQuery,
        }
    }

    /// Move one active backend connection back to the worker cache
    fn release_active_connection(&mut self, conn: BackendConnectionHandle) {
        let name = conn.backend().name.clone();
        if let Some(list) = self.active_backends.get_mut(&name) {
            if let Some(position) = list.iter().position(|c| c.same_connection(&conn)) {
                let handle = list.remove(position);
                self.cache.lock().release(handle);
            }
            if list.is_empty() {
                self.active_backends.remove(&name);
            }
        }
    }

    /// Drop dead connections from the active map
    fn prune_active_connections(&mut self) {
        self.active_backends.retain(|_, list| {
            list.retain(|conn| !conn.is_closed());
            !list.is_empty()
        });
    }

    fn count_tls_query(&self) {
        if !self.stream.is_tls() {
            return;
        }
        let stats = &self.frontend.stats;
        match self.stream.tls_version() {
            Some(ProtocolVersion::TLSv1_0) => stats.tls10_queries.fetch_add(1, Ordering::Relaxed),
            Some(ProtocolVersion::TLSv1_1) => stats.tls11_queries.fetch_add(1, Ordering::Relaxed),
            Some(ProtocolVersion::TLSv1_2) => stats.tls12_queries.fetch_add(1, Ordering::Relaxed),
            Some(ProtocolVersion::TLSv1_3) => stats.tls13_queries.fetch_add(1, Ordering::Relaxed),
            _ => stats.tls_unknown_queries.fetch_add(1, Ordering::Relaxed),
        };
    }
}
