//! Reliable byte streams between applications.
//!
//! Every application attached to a node gets its own table of sockets. Connections are opened
//! with a SYN / SYN-ACK exchange, after which both ends send byte-sequenced DATA segments. Only
//! one segment is outstanding per connection at a time; its payload is limited by the smaller of
//! the congestion window and the window most recently advertised by the peer. Unacknowledged
//! bytes stay at the front of the send queue and are resent from the oldest on timeout.
//!
//! Application calls which cannot complete yet (accept, connect, send, recv) are not answered
//! until some later segment or timer allows it. An application has at most one such call
//! outstanding; requests arriving in the meantime wait their turn.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;

use tracing::{debug, info, trace};

use crate::network;

pub mod segment;
pub mod service;

use segment::{SegmentHeader, SegmentKind, HEADER_SIZE};
use service::Request;

const SEND_BUFFER_DEFAULT: usize = 65535;
const RECEIVE_BUFFER_DEFAULT: usize = 65535;
const CONGESTION_WINDOW_DEFAULT: usize = 1024;
const LISTEN_BACKLOG_DEFAULT: usize = 10;
const RTO_DEFAULT_MS: u64 = 1000;
const ACK_DELAY_DEFAULT_MS: u64 = 100;

const EPHEMERAL_PORT_BASE: u16 = 49151;

/// Configuration for a [`TransportLayer`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of each connection's send queue, in bytes.
    ///
    /// Default value: 65,535
    pub send_buffer: usize,

    /// Capacity of each connection's receive queue, in bytes.
    ///
    /// Maximum value: 65,535 \
    /// Default value: 65,535
    pub receive_buffer: usize,

    /// Largest payload sent in one segment.
    ///
    /// Default value: 1024
    pub congestion_window: usize,

    /// Connections which may wait for accept on one listening port.
    ///
    /// Default value: 10
    pub listen_backlog: usize,

    /// Retransmission timeout.
    ///
    /// Default value: 1000
    pub rto_ms: u64,

    /// Longest time an acknowledgement is held back hoping to piggyback on data.
    ///
    /// Default value: 100
    pub ack_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            send_buffer: SEND_BUFFER_DEFAULT,
            receive_buffer: RECEIVE_BUFFER_DEFAULT,
            congestion_window: CONGESTION_WINDOW_DEFAULT,
            listen_backlog: LISTEN_BACKLOG_DEFAULT,
            rto_ms: RTO_DEFAULT_MS,
            ack_delay_ms: ACK_DELAY_DEFAULT_MS,
        }
    }
}

impl Config {
    pub fn validate(&self) {
        assert!(
            self.send_buffer > 0,
            "invalid transport configuration: send_buffer == 0"
        );
        assert!(
            self.receive_buffer > 0 && self.receive_buffer <= u16::MAX as usize,
            "invalid transport configuration: receive_buffer outside [1, 65535]"
        );
        assert!(
            self.congestion_window > 0
                && self.congestion_window <= network::MAX_PAYLOAD_SIZE - HEADER_SIZE,
            "invalid transport configuration: congestion_window outside [1, {}]",
            network::MAX_PAYLOAD_SIZE - HEADER_SIZE
        );
        assert!(
            self.rto_ms > self.ack_delay_ms,
            "invalid transport configuration: rto_ms <= ack_delay_ms"
        );
    }
}

/// Identifies an application attached to a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(pub u32);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app{}", self.0)
    }
}

pub trait HostContext {
    // Called to hand a segment to the network layer. Returns false if it could not be sent.
    fn send_segment(&mut self, destination: Ipv4Addr, segment_bytes: &[u8]) -> bool;

    // Called to request a call to handle_timer with the given id at the given time
    fn set_timer(&mut self, timer_id: u64, time_ms: u64);

    // Called to answer an application request
    fn respond(&mut self, app: AppId, response: Box<[u8]>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    SynSent,
    SynReceived,
    Established,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pending {
    Accept(u16),
    Connect(i32),
    Recv { socket: i32, length: u16 },
    Send { socket: i32, accepted: u32 },
}

type Endpoint = (u16, Ipv4Addr, u16);

struct Connection {
    state: State,
    local_port: u16,
    remote: Ipv4Addr,
    remote_port: u16,
    // Whether the local port was allocated by connect, and is freed with the connection
    owns_port: bool,
    initial_seq: u32,
    // Sequence number of the first byte in send_queue
    send_base: u32,
    // Next sequence number expected from the peer
    receive_next: u32,
    send_queue: VecDeque<u8>,
    receive_queue: VecDeque<u8>,
    peer_window: u16,
    // Window carried by the last segment we sent
    advertised_window: u16,
    closing: bool,
    fin_sent: bool,
    fin_acked: bool,
    remote_closed: bool,
    ack_due: bool,
    // Current timer and its deadline
    timer: Option<(u64, u64)>,
}

impl Connection {
    fn new(state: State, endpoint: Endpoint, initial_seq: u32) -> Self {
        let (local_port, remote, remote_port) = endpoint;

        Self {
            state,
            local_port,
            remote,
            remote_port,
            owns_port: false,
            initial_seq,
            send_base: initial_seq.wrapping_add(1),
            receive_next: 0,
            send_queue: VecDeque::new(),
            receive_queue: VecDeque::new(),
            peer_window: 0,
            advertised_window: 0,
            closing: false,
            fin_sent: false,
            fin_acked: false,
            remote_closed: false,
            ack_due: false,
            timer: None,
        }
    }

    fn endpoint(&self) -> Endpoint {
        (self.local_port, self.remote, self.remote_port)
    }

    fn has_unacked(&self) -> bool {
        match self.state {
            State::SynSent | State::SynReceived => true,
            State::Established => {
                !self.send_queue.is_empty() || (self.fin_sent && !self.fin_acked)
            }
        }
    }

    // Our FIN is acknowledged but the peer has not sent theirs
    fn awaiting_peer_fin(&self) -> bool {
        self.closing && self.fin_acked && !self.remote_closed
    }

    fn needs_timer(&self) -> bool {
        self.has_unacked() || self.awaiting_peer_fin()
    }

    fn wants_transmit(&self) -> bool {
        self.state == State::Established
            && (!self.send_queue.is_empty() || (self.closing && !self.fin_sent))
    }
}

struct App {
    last_socket: i32,
    connections: HashMap<i32, Connection>,
    endpoints: HashMap<Endpoint, i32>,
    // Listening ports and their queues of connections awaiting accept
    listening: HashMap<u16, VecDeque<i32>>,
    pending: Option<Pending>,
    requests: VecDeque<Request>,
}

impl App {
    fn new() -> Self {
        Self {
            last_socket: 0,
            connections: HashMap::new(),
            endpoints: HashMap::new(),
            listening: HashMap::new(),
            pending: None,
            requests: VecDeque::new(),
        }
    }

    fn allocate_socket(&mut self) -> Option<i32> {
        let start = self.last_socket;

        loop {
            self.last_socket = if self.last_socket == i32::MAX {
                1
            } else {
                self.last_socket + 1
            };

            if !self.connections.contains_key(&self.last_socket) {
                return Some(self.last_socket);
            }

            if self.last_socket == start {
                return None;
            }
        }
    }
}

#[derive(Default)]
struct Timers {
    targets: HashMap<u64, (AppId, i32)>,
    next_id: u64,
}

impl Timers {
    fn allocate(&mut self, app: AppId, socket: i32) -> u64 {
        let timer_id = self.next_id;
        self.next_id += 1;
        self.targets.insert(timer_id, (app, socket));
        timer_id
    }
}

/// Transport layer of a single node.
pub struct TransportLayer {
    config: Config,
    apps: HashMap<AppId, App>,
    // Owner of every bound port, whether listening or allocated by connect
    ports: HashMap<u16, AppId>,
    last_port: u16,
    timers: Timers,
}

impl TransportLayer {
    pub fn new(config: Config) -> Self {
        config.validate();

        Self {
            config,
            apps: HashMap::new(),
            ports: HashMap::new(),
            last_port: EPHEMERAL_PORT_BASE,
            timers: Timers::default(),
        }
    }

    pub fn add_app(&mut self, app: AppId) {
        if self.apps.insert(app, App::new()).is_some() {
            debug!(%app, "application re-added, previous state discarded");
        }
    }

    /// Detaches an application, destroying its connections and releasing its ports. Timers still
    /// pending for those connections become no-ops.
    pub fn remove_app(&mut self, app: AppId) {
        if self.apps.remove(&app).is_none() {
            return;
        }

        self.ports.retain(|_, owner| *owner != app);

        debug!(%app, "application removed");
    }

    /// Queues a request from `app` and executes whatever can run now.
    pub fn handle_request(
        &mut self,
        ctx: &mut impl HostContext,
        app: AppId,
        request: Request,
        now_ms: u64,
    ) {
        let Some(app_state) = self.apps.get_mut(&app) else {
            debug!(%app, "request from unknown application");
            return;
        };

        app_state.requests.push_back(request);

        self.drain_requests(ctx, app, now_ms);
    }

    fn drain_requests(&mut self, ctx: &mut impl HostContext, app: AppId, now_ms: u64) {
        loop {
            let Some(app_state) = self.apps.get_mut(&app) else {
                return;
            };

            if app_state.pending.is_some() {
                return;
            }

            let Some(request) = app_state.requests.pop_front() else {
                return;
            };

            self.execute(ctx, app, request, now_ms);
        }
    }

    fn execute(&mut self, ctx: &mut impl HostContext, app: AppId, request: Request, now_ms: u64) {
        match request {
            Request::Listen { port } => self.listen(ctx, app, port),
            Request::Accept { port } => self.accept(ctx, app, port),
            Request::Connect { address, port } => self.connect(ctx, app, address, port, now_ms),
            Request::Send { socket, data } => self.send(ctx, app, socket, &data, now_ms),
            Request::Recv { socket, length } => self.recv(ctx, app, socket, length, now_ms),
            Request::Close { socket } => self.close(ctx, app, socket, now_ms),
        }
    }

    fn listen(&mut self, ctx: &mut impl HostContext, app: AppId, port: u16) {
        let Some(app_state) = self.apps.get_mut(&app) else {
            return;
        };

        let ok = if self.ports.contains_key(&port) {
            debug!(%app, port, "listen: port already bound");
            false
        } else {
            info!(%app, port, "listening");
            self.ports.insert(port, app);
            app_state.listening.insert(port, VecDeque::new());
            true
        };

        ctx.respond(app, service::bool_response(ok));
    }

    fn accept(&mut self, ctx: &mut impl HostContext, app: AppId, port: u16) {
        let Some(app_state) = self.apps.get_mut(&app) else {
            return;
        };

        let Some(backlog) = app_state.listening.get_mut(&port) else {
            debug!(%app, port, "accept: not listening");
            ctx.respond(app, service::accept_response(None));
            return;
        };

        match backlog.pop_front() {
            Some(socket) => {
                let accepted = app_state
                    .connections
                    .get(&socket)
                    .map(|conn| (socket, conn.remote, conn.remote_port));

                ctx.respond(app, service::accept_response(accepted));
            }
            None => {
                trace!(%app, port, "accept: waiting");
                app_state.pending = Some(Pending::Accept(port));
            }
        }
    }

    fn connect(
        &mut self,
        ctx: &mut impl HostContext,
        app: AppId,
        address: Ipv4Addr,
        remote_port: u16,
        now_ms: u64,
    ) {
        let Some(local_port) = self.allocate_port() else {
            debug!(%app, "connect: no free port");
            ctx.respond(app, service::int_response(-1));
            return;
        };

        let Some(app_state) = self.apps.get_mut(&app) else {
            return;
        };

        let Some(socket) = app_state.allocate_socket() else {
            debug!(%app, "connect: no free socket");
            ctx.respond(app, service::int_response(-1));
            return;
        };

        self.ports.insert(local_port, app);

        info!(%app, socket, local_port, %address, remote_port, "connecting");

        let endpoint = (local_port, address, remote_port);
        let mut conn = Connection::new(State::SynSent, endpoint, now_ms as u32);
        conn.owns_port = true;

        app_state.endpoints.insert(endpoint, socket);
        app_state.pending = Some(Pending::Connect(socket));

        transmit(&self.config, &mut self.timers, ctx, app, socket, &mut conn, now_ms);

        app_state.connections.insert(socket, conn);
    }

    fn send(
        &mut self,
        ctx: &mut impl HostContext,
        app: AppId,
        socket: i32,
        data: &[u8],
        now_ms: u64,
    ) {
        let Some(app_state) = self.apps.get_mut(&app) else {
            return;
        };

        let Some(conn) = app_state.connections.get_mut(&socket) else {
            debug!(%app, socket, "send: unknown socket");
            ctx.respond(app, service::int_response(-1));
            return;
        };

        if conn.closing {
            debug!(%app, socket, "send: socket closed");
            ctx.respond(app, service::int_response(-1));
            return;
        }

        let was_empty = conn.send_queue.is_empty();
        let free = self.config.send_buffer - conn.send_queue.len();
        let accepted = data.len().min(free);

        conn.send_queue.extend(&data[..accepted]);

        if accepted < data.len() {
            trace!(%app, socket, accepted, "send: queue full, waiting");
            app_state.pending = Some(Pending::Send {
                socket,
                accepted: accepted as u32,
            });
        } else {
            ctx.respond(app, service::int_response(accepted as i32));
        }

        if was_empty && conn.wants_transmit() {
            transmit(&self.config, &mut self.timers, ctx, app, socket, conn, now_ms);
        }
    }

    fn recv(
        &mut self,
        ctx: &mut impl HostContext,
        app: AppId,
        socket: i32,
        length: u16,
        now_ms: u64,
    ) {
        let Some(app_state) = self.apps.get_mut(&app) else {
            return;
        };

        let Some(conn) = app_state.connections.get_mut(&socket) else {
            debug!(%app, socket, "recv: unknown socket");
            ctx.respond(app, service::int_response(-1));
            return;
        };

        if conn.receive_queue.is_empty() && !conn.remote_closed && length > 0 {
            trace!(%app, socket, "recv: waiting");
            app_state.pending = Some(Pending::Recv { socket, length });
            return;
        }

        ctx.respond(app, take_received(conn, length));

        // The peer stops sending at a closed window, and must hear that it opened again
        if conn.state == State::Established && window_reopened(&self.config, conn) {
            trace!(%app, socket, "receive window reopened");
            conn.ack_due = true;
            schedule_ack(&self.config, &mut self.timers, ctx, app, socket, conn, now_ms);
        }
    }

    fn close(&mut self, ctx: &mut impl HostContext, app: AppId, socket: i32, now_ms: u64) {
        let Some(app_state) = self.apps.get_mut(&app) else {
            return;
        };

        let Some(conn) = app_state.connections.get_mut(&socket) else {
            debug!(%app, socket, "close: unknown socket");
            ctx.respond(app, service::bool_response(false));
            return;
        };

        conn.closing = true;

        if conn.remote_closed {
            info!(%app, socket, "closed");

            // Last word to the peer; nothing will be retransmitted
            if conn.state == State::Established {
                transmit(&self.config, &mut self.timers, ctx, app, socket, conn, now_ms);
            }

            self.destroy(app, socket);
        } else {
            info!(%app, socket, "closing");

            if conn.wants_transmit() && !conn.has_unacked() {
                transmit(&self.config, &mut self.timers, ctx, app, socket, conn, now_ms);
            }
        }

        ctx.respond(app, service::bool_response(true));
    }

    /// Handles a segment delivered by the network layer.
    pub fn handle_segment(
        &mut self,
        ctx: &mut impl HostContext,
        source: Ipv4Addr,
        segment_bytes: &[u8],
        now_ms: u64,
    ) {
        let (header, payload) = match SegmentHeader::decode(segment_bytes) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(%source, %err, "dropping segment");
                return;
            }
        };

        trace!(
            %source,
            kind = ?header.kind,
            src_port = header.source_port,
            dst_port = header.destination_port,
            len = payload.len(),
            "segment received"
        );

        let app = match self.ports.get(&header.destination_port) {
            Some(&app) if self.apps.contains_key(&app) => app,
            _ => {
                if header.kind != SegmentKind::Reject {
                    debug!(%source, port = header.destination_port, "no owner for port, rejecting");
                    ctx.send_segment(source, &header.reject().encode(&[]));
                }
                return;
            }
        };

        match header.kind {
            SegmentKind::Syn => self.handle_syn(ctx, app, source, &header, now_ms),
            SegmentKind::SynAck => self.handle_syn_ack(ctx, app, source, &header, now_ms),
            SegmentKind::Reject => self.handle_reject(ctx, app, source, &header),
            SegmentKind::Data | SegmentKind::Fin => {
                self.handle_data(ctx, app, source, &header, payload, now_ms)
            }
        }

        self.drain_requests(ctx, app, now_ms);
    }

    fn handle_syn(
        &mut self,
        ctx: &mut impl HostContext,
        app: AppId,
        source: Ipv4Addr,
        header: &SegmentHeader,
        now_ms: u64,
    ) {
        let Some(app_state) = self.apps.get_mut(&app) else {
            return;
        };

        let port = header.destination_port;
        let endpoint = (port, source, header.source_port);

        if let Some(&socket) = app_state.endpoints.get(&endpoint) {
            if let Some(conn) = app_state.connections.get_mut(&socket) {
                if conn.state == State::SynReceived {
                    trace!(%app, socket, "duplicate SYN, repeating SYN-ACK");
                    transmit(&self.config, &mut self.timers, ctx, app, socket, conn, now_ms);
                }
            }
            return;
        }

        let waiting = match app_state.listening.get(&port) {
            Some(backlog) => backlog.len(),
            None => {
                debug!(%app, port, %source, "connection refused: not listening");
                ctx.send_segment(source, &header.reject().encode(&[]));
                return;
            }
        };

        if waiting >= self.config.listen_backlog {
            debug!(%app, port, %source, "connection refused: backlog full");
            ctx.send_segment(source, &header.reject().encode(&[]));
            return;
        }

        let Some(socket) = app_state.allocate_socket() else {
            debug!(%app, port, %source, "connection refused: no free socket");
            ctx.send_segment(source, &header.reject().encode(&[]));
            return;
        };

        info!(%app, socket, port, %source, remote_port = header.source_port, "connection request");

        let mut conn = Connection::new(State::SynReceived, endpoint, now_ms as u32);
        conn.receive_next = header.syn.wrapping_add(1);
        conn.peer_window = header.window;

        transmit(&self.config, &mut self.timers, ctx, app, socket, &mut conn, now_ms);

        app_state.connections.insert(socket, conn);
        app_state.endpoints.insert(endpoint, socket);

        if app_state.pending == Some(Pending::Accept(port)) {
            app_state.pending = None;
            ctx.respond(
                app,
                service::accept_response(Some((socket, source, header.source_port))),
            );
        } else if let Some(backlog) = app_state.listening.get_mut(&port) {
            backlog.push_back(socket);
        }
    }

    fn handle_syn_ack(
        &mut self,
        ctx: &mut impl HostContext,
        app: AppId,
        source: Ipv4Addr,
        header: &SegmentHeader,
        now_ms: u64,
    ) {
        let Some(app_state) = self.apps.get_mut(&app) else {
            return;
        };

        let endpoint = (header.destination_port, source, header.source_port);

        let Some(&socket) = app_state.endpoints.get(&endpoint) else {
            debug!(%app, %source, "SYN-ACK for unknown connection");
            return;
        };

        let Some(conn) = app_state.connections.get_mut(&socket) else {
            return;
        };

        match conn.state {
            State::SynSent if header.ack == conn.initial_seq.wrapping_add(1) => {
                info!(%app, socket, %source, "connected");

                conn.state = State::Established;
                conn.receive_next = header.syn.wrapping_add(1);
                conn.peer_window = header.window;
                conn.ack_due = true;
                conn.timer = None;

                if app_state.pending == Some(Pending::Connect(socket)) {
                    app_state.pending = None;
                    ctx.respond(app, service::int_response(socket));
                }
            }
            State::SynSent => {
                debug!(%app, socket, ack = header.ack, "SYN-ACK with unexpected ack");
                return;
            }
            State::Established if header.syn.wrapping_add(1) == conn.receive_next => {
                // Our confirmation was lost
                conn.ack_due = true;
            }
            _ => return,
        }

        schedule_ack(&self.config, &mut self.timers, ctx, app, socket, conn, now_ms);
    }

    fn handle_reject(
        &mut self,
        ctx: &mut impl HostContext,
        app: AppId,
        source: Ipv4Addr,
        header: &SegmentHeader,
    ) {
        let Some(app_state) = self.apps.get_mut(&app) else {
            return;
        };

        let endpoint = (header.destination_port, source, header.source_port);

        let Some(&socket) = app_state.endpoints.get(&endpoint) else {
            trace!(%app, %source, "REJECT for unknown connection");
            return;
        };

        let Some(conn) = app_state.connections.get(&socket) else {
            return;
        };

        // A peer which has already forgotten a closed connection rejects our segments for it
        if conn.awaiting_peer_fin() {
            if header.ack != conn.send_base.wrapping_add(1) {
                debug!(%app, socket, ack = header.ack, "ignoring REJECT");
                return;
            }

            info!(%app, socket, %source, "peer finished, connection closed");
            self.destroy(app, socket);
            return;
        }

        if conn.state != State::SynSent {
            trace!(%app, socket, "REJECT for established connection");
            return;
        }

        let expected = conn.initial_seq.wrapping_add(1);

        if header.ack != expected || app_state.pending != Some(Pending::Connect(socket)) {
            debug!(%app, socket, ack = header.ack, expected, "ignoring REJECT");
            return;
        }

        info!(%app, socket, %source, "connection rejected");

        app_state.pending = None;
        ctx.respond(app, service::int_response(-1));

        self.destroy(app, socket);
    }

    fn handle_data(
        &mut self,
        ctx: &mut impl HostContext,
        app: AppId,
        source: Ipv4Addr,
        header: &SegmentHeader,
        payload: &[u8],
        now_ms: u64,
    ) {
        let Some(app_state) = self.apps.get_mut(&app) else {
            return;
        };

        let endpoint = (header.destination_port, source, header.source_port);

        let Some(&socket) = app_state.endpoints.get(&endpoint) else {
            debug!(%app, %source, port = header.destination_port, "segment for unknown connection, rejecting");
            ctx.send_segment(source, &header.reject().encode(&[]));
            return;
        };

        let Some(conn) = app_state.connections.get_mut(&socket) else {
            return;
        };

        let mut progress = false;

        match conn.state {
            State::SynSent => return,
            State::SynReceived => {
                if header.ack != conn.send_base {
                    trace!(%app, socket, "segment before handshake completed");
                    return;
                }

                debug!(%app, socket, "connection established");

                conn.state = State::Established;
                conn.timer = None;
                progress = true;
            }
            State::Established => {}
        }

        if conn.peer_window == 0 && header.window > 0 {
            trace!(%app, socket, window = header.window, "peer window reopened");
            progress = true;
        }

        conn.peer_window = header.window;

        // Acknowledgement of our bytes, and of our FIN one past them
        let outstanding =
            conn.send_queue.len() as u32 + u32::from(conn.fin_sent && !conn.fin_acked);
        let advanced = header.ack.wrapping_sub(conn.send_base);

        let mut drained = 0;

        if advanced > 0 && advanced <= outstanding {
            drained = (advanced as usize).min(conn.send_queue.len());
            conn.send_queue.drain(..drained);
            conn.send_base = conn.send_base.wrapping_add(advanced);

            if advanced as usize > drained {
                conn.fin_acked = true;
            }

            progress = true;
        }

        // Data, and a FIN one past it
        let is_fin = header.kind == SegmentKind::Fin;
        let mut delivered = false;

        if !payload.is_empty() || is_fin {
            if header.syn == conn.receive_next && !conn.remote_closed {
                let free = self.config.receive_buffer - conn.receive_queue.len();
                let taken = payload.len().min(free);

                conn.receive_queue.extend(&payload[..taken]);
                conn.receive_next = conn.receive_next.wrapping_add(taken as u32);
                delivered = taken > 0;

                if is_fin && taken == payload.len() {
                    info!(%app, socket, "peer closed");
                    conn.remote_closed = true;
                    conn.receive_next = conn.receive_next.wrapping_add(1);
                    delivered = true;
                }
            } else {
                trace!(%app, socket, syn = header.syn, expected = conn.receive_next, "out of order");
            }

            conn.ack_due = true;
        }

        // A sender stalled on a closed window learns that it opened
        if window_reopened(&self.config, conn) {
            conn.ack_due = true;
        }

        if delivered {
            if let Some(Pending::Recv { socket: s, length }) = app_state.pending {
                if s == socket {
                    app_state.pending = None;
                    ctx.respond(app, take_received(conn, length));
                }
            }
        }

        if drained > 0 {
            if let Some(Pending::Send { socket: s, accepted }) = app_state.pending {
                if s == socket {
                    app_state.pending = None;
                    ctx.respond(app, service::int_response(accepted as i32));
                }
            }
        }

        if conn.closing && conn.fin_acked && conn.remote_closed {
            if conn.ack_due {
                transmit(&self.config, &mut self.timers, ctx, app, socket, conn, now_ms);
            }

            info!(%app, socket, "connection finished");
            self.destroy(app, socket);
            return;
        }

        if progress && !conn.needs_timer() {
            conn.timer = None;
        }

        if progress && conn.wants_transmit() {
            transmit(&self.config, &mut self.timers, ctx, app, socket, conn, now_ms);
        } else if conn.ack_due {
            schedule_ack(&self.config, &mut self.timers, ctx, app, socket, conn, now_ms);
        }
    }

    /// Handles a timer previously requested through [`HostContext::set_timer`].
    pub fn handle_timer(&mut self, ctx: &mut impl HostContext, timer_id: u64, now_ms: u64) {
        let Some((app, socket)) = self.timers.targets.remove(&timer_id) else {
            return;
        };

        let Some(conn) = self
            .apps
            .get_mut(&app)
            .and_then(|app_state| app_state.connections.get_mut(&socket))
        else {
            return;
        };

        match conn.timer {
            Some((current, _)) if current == timer_id => {}
            _ => return,
        }

        conn.timer = None;

        transmit(&self.config, &mut self.timers, ctx, app, socket, conn, now_ms);
    }

    fn destroy(&mut self, app: AppId, socket: i32) {
        let Some(app_state) = self.apps.get_mut(&app) else {
            return;
        };

        let Some(conn) = app_state.connections.remove(&socket) else {
            return;
        };

        app_state.endpoints.remove(&conn.endpoint());

        for backlog in app_state.listening.values_mut() {
            backlog.retain(|&s| s != socket);
        }

        if conn.owns_port {
            self.ports.remove(&conn.local_port);
        }
    }

    fn allocate_port(&mut self) -> Option<u16> {
        let start = self.last_port;

        loop {
            self.last_port = self.last_port.wrapping_add(1);

            if self.last_port == 0 {
                continue;
            }

            if !self.ports.contains_key(&self.last_port) {
                return Some(self.last_port);
            }

            if self.last_port == start {
                return None;
            }
        }
    }

    /// Number of open connections belonging to `app`.
    pub fn connection_count(&self, app: AppId) -> usize {
        self.apps
            .get(&app)
            .map_or(0, |app_state| app_state.connections.len())
    }

    /// Returns true if `app` has a request waiting on some event.
    pub fn is_blocked(&self, app: AppId) -> bool {
        self.apps
            .get(&app)
            .is_some_and(|app_state| app_state.pending.is_some())
    }
}

// True if the window last advertised was less than a full segment and the receive queue has
// since drained below it
fn window_reopened(config: &Config, conn: &Connection) -> bool {
    let advertised = conn.advertised_window as usize;
    let free = config.receive_buffer - conn.receive_queue.len();

    advertised < config.congestion_window.min(config.receive_buffer) && free > advertised
}

// Removes up to `length` received bytes and encodes them as a recv response
fn take_received(conn: &mut Connection, length: u16) -> Box<[u8]> {
    let count = (length as usize).min(conn.receive_queue.len());
    let data: Vec<u8> = conn.receive_queue.drain(..count).collect();
    service::recv_response(&data)
}

/// Sends the segment the connection's state calls for, carrying the current acknowledgement, and
/// arms the retransmission timer while anything remains unacknowledged.
fn transmit(
    config: &Config,
    timers: &mut Timers,
    ctx: &mut impl HostContext,
    app: AppId,
    socket: i32,
    conn: &mut Connection,
    now_ms: u64,
) {
    let free = config.receive_buffer - conn.receive_queue.len();

    let mut header = SegmentHeader {
        source_port: conn.local_port,
        destination_port: conn.remote_port,
        syn: conn.initial_seq,
        ack: 0,
        window: free.min(u16::MAX as usize) as u16,
        kind: SegmentKind::Syn,
    };

    let mut length = 0;

    match conn.state {
        State::SynSent => {}
        State::SynReceived => {
            header.kind = SegmentKind::SynAck;
            header.ack = conn.receive_next;
        }
        State::Established => {
            length = config
                .congestion_window
                .min(conn.peer_window as usize)
                .min(conn.send_queue.len());

            let fin = conn.closing && !conn.fin_acked && length == conn.send_queue.len();

            header.kind = if fin {
                SegmentKind::Fin
            } else {
                SegmentKind::Data
            };
            header.syn = conn.send_base;
            header.ack = conn.receive_next;

            if fin {
                conn.fin_sent = true;
            }
        }
    }

    conn.advertised_window = header.window;

    let payload: Vec<u8> = conn.send_queue.iter().take(length).copied().collect();
    let bytes = header.encode(&payload);

    conn.ack_due = false;

    trace!(
        %app,
        socket,
        kind = ?header.kind,
        syn = header.syn,
        ack = header.ack,
        len = length,
        "sending segment"
    );

    if !ctx.send_segment(conn.remote, &bytes) {
        debug!(%app, socket, remote = %conn.remote, "segment not sent, no route");
    }

    // A closed connection keeps prodding the peer until its FIN arrives
    if conn.needs_timer() {
        arm_timer(timers, ctx, app, socket, conn, now_ms + config.rto_ms);
    } else {
        conn.timer = None;
    }
}

/// Arranges for an acknowledgement to go out within the ack delay, unless a transmission is
/// already due sooner.
fn schedule_ack(
    config: &Config,
    timers: &mut Timers,
    ctx: &mut impl HostContext,
    app: AppId,
    socket: i32,
    conn: &mut Connection,
    now_ms: u64,
) {
    let deadline_ms = now_ms + config.ack_delay_ms;

    match conn.timer {
        Some((_, current_ms)) if current_ms <= deadline_ms => {}
        _ => arm_timer(timers, ctx, app, socket, conn, deadline_ms),
    }
}

fn arm_timer(
    timers: &mut Timers,
    ctx: &mut impl HostContext,
    app: AppId,
    socket: i32,
    conn: &mut Connection,
    time_ms: u64,
) {
    let timer_id = timers.allocate(app, socket);
    conn.timer = Some((timer_id, time_ms));
    ctx.set_timer(timer_id, time_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const ADDR: [Ipv4Addr; 2] = [Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)];
    const APP: AppId = AppId(1);

    #[derive(Default)]
    struct Mock {
        segments: Vec<(Ipv4Addr, Box<[u8]>)>,
        timers: Vec<(u64, u64)>,
        responses: Vec<(AppId, Box<[u8]>)>,
    }

    impl HostContext for Mock {
        fn send_segment(&mut self, destination: Ipv4Addr, segment_bytes: &[u8]) -> bool {
            self.segments.push((destination, segment_bytes.into()));
            true
        }

        fn set_timer(&mut self, timer_id: u64, time_ms: u64) {
            self.timers.push((timer_id, time_ms));
        }

        fn respond(&mut self, app: AppId, response: Box<[u8]>) {
            self.responses.push((app, response));
        }
    }

    fn int(response: &[u8]) -> i32 {
        i32::from_be_bytes(response[..4].try_into().unwrap())
    }

    fn received(response: &[u8]) -> Vec<u8> {
        let length = u32::from_be_bytes(response[..4].try_into().unwrap()) as usize;
        assert_eq!(response.len(), 4 + length);
        response[4..].to_vec()
    }

    // Two transport layers joined by a virtual network
    struct Pair {
        layers: [TransportLayer; 2],
        mocks: [Mock; 2],
        timers: [Vec<(u64, u64)>; 2],
        now_ms: u64,
        sent: usize,
        drop: Box<dyn FnMut(usize) -> bool>,
    }

    impl Pair {
        fn new() -> Self {
            Self::with_config(Config::default())
        }

        fn with_config(config: Config) -> Self {
            let mut layers = [
                TransportLayer::new(config.clone()),
                TransportLayer::new(config),
            ];

            for layer in layers.iter_mut() {
                layer.add_app(APP);
            }

            Self {
                layers,
                mocks: Default::default(),
                timers: Default::default(),
                now_ms: 1000,
                sent: 0,
                drop: Box::new(|_| false),
            }
        }

        fn request(&mut self, side: usize, request: Request) {
            self.request_as(side, APP, request);
        }

        fn request_as(&mut self, side: usize, app: AppId, request: Request) {
            self.layers[side].handle_request(&mut self.mocks[side], app, request, self.now_ms);
        }

        fn responses(&mut self, side: usize) -> Vec<Box<[u8]>> {
            self.responses_of(side, APP)
        }

        fn responses_of(&mut self, side: usize, app: AppId) -> Vec<Box<[u8]>> {
            let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.mocks[side].responses)
                .into_iter()
                .partition(|(id, _)| *id == app);
            self.mocks[side].responses = rest;
            matching.into_iter().map(|(_, response)| response).collect()
        }

        fn run(&mut self, duration_ms: u64) {
            let end_ms = self.now_ms + duration_ms;

            loop {
                let mut delivered = false;

                for side in 0..2 {
                    let segments = std::mem::take(&mut self.mocks[side].segments);

                    for (destination, bytes) in segments {
                        delivered = true;

                        let index = self.sent;
                        self.sent += 1;

                        if (self.drop)(index) {
                            continue;
                        }

                        let target = ADDR.iter().position(|a| *a == destination).unwrap();
                        self.layers[target].handle_segment(
                            &mut self.mocks[target],
                            ADDR[side],
                            &bytes,
                            self.now_ms,
                        );
                    }

                    let timers = std::mem::take(&mut self.mocks[side].timers);
                    self.timers[side].extend(timers);
                }

                if delivered {
                    continue;
                }

                let mut next: Option<(u64, usize, usize)> = None;

                for side in 0..2 {
                    for (index, &(_, time_ms)) in self.timers[side].iter().enumerate() {
                        if next.map_or(true, |(t, _, _)| time_ms < t) {
                            next = Some((time_ms, side, index));
                        }
                    }
                }

                match next {
                    Some((time_ms, side, index)) if time_ms <= end_ms => {
                        let (timer_id, _) = self.timers[side].remove(index);
                        self.now_ms = self.now_ms.max(time_ms);
                        self.layers[side].handle_timer(&mut self.mocks[side], timer_id, self.now_ms);
                    }
                    _ => {
                        self.now_ms = end_ms;
                        return;
                    }
                }
            }
        }

        // Connects side 0 to a listener on side 1, returning both sockets
        fn establish(&mut self) -> (i32, i32) {
            self.request(1, Request::Listen { port: 80 });
            assert_eq!(self.responses(1), vec![service::bool_response(true)]);

            self.request(1, Request::Accept { port: 80 });
            self.request(
                0,
                Request::Connect {
                    address: ADDR[1],
                    port: 80,
                },
            );

            self.run(1000);

            let client = self.responses(0);
            assert_eq!(client.len(), 1);
            let client_socket = int(&client[0]);
            assert!(client_socket > 0);

            let server = self.responses(1);
            assert_eq!(server.len(), 1);
            assert_eq!(server[0].len(), service::ACCEPT_RESPONSE_SIZE);
            let server_socket = int(&server[0]);
            assert!(server_socket > 0);
            assert_eq!(&server[0][4..8], &ADDR[0].octets());

            (client_socket, server_socket)
        }
    }

    #[test]
    fn syn_is_answered_with_next_sequence_number() {
        let mut layer = TransportLayer::new(Config::default());
        let mut mock = Mock::default();

        layer.add_app(APP);
        layer.handle_request(&mut mock, APP, Request::Listen { port: 80 }, 0);

        let syn = SegmentHeader {
            source_port: 5000,
            destination_port: 80,
            syn: 1234,
            ack: 0,
            window: 4096,
            kind: SegmentKind::Syn,
        };

        layer.handle_segment(&mut mock, ADDR[0], &syn.encode(&[]), 10);

        assert_eq!(mock.segments.len(), 1);
        let (destination, bytes) = &mock.segments[0];
        assert_eq!(*destination, ADDR[0]);

        let (reply, payload) = SegmentHeader::decode(bytes).unwrap();
        assert_eq!(reply.kind, SegmentKind::SynAck);
        assert_eq!(reply.source_port, 80);
        assert_eq!(reply.destination_port, 5000);
        assert_eq!(reply.syn, 10);
        assert_eq!(reply.ack, 1235);
        assert!(payload.is_empty());

        // A repeated SYN gets the same answer without opening a second connection
        layer.handle_segment(&mut mock, ADDR[0], &syn.encode(&[]), 20);

        assert_eq!(mock.segments.len(), 2);
        let (reply, _) = SegmentHeader::decode(&mock.segments[1].1).unwrap();
        assert_eq!(reply.kind, SegmentKind::SynAck);
        assert_eq!(reply.ack, 1235);
        assert_eq!(layer.connection_count(APP), 1);
    }

    #[test]
    fn reject_is_never_answered() {
        let mut layer = TransportLayer::new(Config::default());
        let mut mock = Mock::default();

        layer.add_app(APP);

        let reject = SegmentHeader {
            source_port: 5000,
            destination_port: 80,
            syn: 0,
            ack: 1,
            window: 0,
            kind: SegmentKind::Reject,
        };

        layer.handle_segment(&mut mock, ADDR[0], &reject.encode(&[]), 0);

        assert!(mock.segments.is_empty());
    }

    #[test]
    fn connection_is_established_and_accepted() {
        let mut pair = Pair::new();

        let (client, server) = pair.establish();

        assert_eq!(client, 1);
        assert_eq!(server, 1);
        assert_eq!(pair.layers[0].connection_count(APP), 1);
        assert_eq!(pair.layers[1].connection_count(APP), 1);
        assert!(!pair.layers[0].is_blocked(APP));
        assert!(!pair.layers[1].is_blocked(APP));
    }

    #[test]
    fn connect_to_closed_port_is_rejected() {
        let mut pair = Pair::new();

        pair.request(
            0,
            Request::Connect {
                address: ADDR[1],
                port: 81,
            },
        );

        assert!(pair.layers[0].is_blocked(APP));

        pair.run(100);

        assert_eq!(pair.responses(0), vec![service::int_response(-1)]);
        assert_eq!(pair.layers[0].connection_count(APP), 0);
        assert!(!pair.layers[0].is_blocked(APP));
    }

    #[test]
    fn listen_and_accept_failures() {
        let mut pair = Pair::new();

        pair.request(1, Request::Listen { port: 80 });
        pair.request(1, Request::Listen { port: 80 });
        pair.request(1, Request::Accept { port: 81 });

        assert_eq!(
            pair.responses(1),
            vec![
                service::bool_response(true),
                service::bool_response(false),
                service::accept_response(None),
            ]
        );
    }

    #[test]
    fn listen_backlog_limits_waiting_connections() {
        let mut pair = Pair::with_config(Config {
            listen_backlog: 1,
            ..Default::default()
        });

        let other = AppId(2);
        pair.layers[0].add_app(other);

        pair.request(1, Request::Listen { port: 80 });
        pair.responses(1);

        let connect = Request::Connect {
            address: ADDR[1],
            port: 80,
        };

        pair.request(0, connect.clone());
        pair.run(500);
        pair.request_as(0, other, connect);
        pair.run(500);

        assert_eq!(pair.responses(0), vec![service::int_response(1)]);
        assert_eq!(pair.responses_of(0, other), vec![service::int_response(-1)]);

        pair.request(1, Request::Accept { port: 80 });

        let accepted = pair.responses(1);
        assert_eq!(accepted.len(), 1);
        assert_eq!(int(&accepted[0]), 1);
    }

    #[test]
    fn data_flows_both_ways() {
        let mut pair = Pair::new();
        let (client, server) = pair.establish();

        pair.request(
            0,
            Request::Send {
                socket: client,
                data: b"hello".as_slice().into(),
            },
        );
        assert_eq!(pair.responses(0), vec![service::int_response(5)]);

        pair.request(
            1,
            Request::Send {
                socket: server,
                data: b"world".as_slice().into(),
            },
        );
        assert_eq!(pair.responses(1), vec![service::int_response(5)]);

        pair.run(1000);

        pair.request(
            1,
            Request::Recv {
                socket: server,
                length: 100,
            },
        );
        pair.request(
            0,
            Request::Recv {
                socket: client,
                length: 3,
            },
        );
        pair.request(
            0,
            Request::Recv {
                socket: client,
                length: 3,
            },
        );

        let server_responses = pair.responses(1);
        assert_eq!(received(&server_responses[0]), b"hello");

        let client_responses = pair.responses(0);
        assert_eq!(client_responses.len(), 2);
        assert_eq!(received(&client_responses[0]), b"wor");
        assert_eq!(received(&client_responses[1]), b"ld");
    }

    #[test]
    fn recv_blocks_until_data_arrives() {
        let mut pair = Pair::new();
        let (client, server) = pair.establish();

        pair.request(
            1,
            Request::Recv {
                socket: server,
                length: 100,
            },
        );
        pair.request(1, Request::Close { socket: 99 });

        // The close request waits behind the blocked recv
        assert!(pair.responses(1).is_empty());
        assert!(pair.layers[1].is_blocked(APP));

        pair.request(
            0,
            Request::Send {
                socket: client,
                data: b"hi".as_slice().into(),
            },
        );
        pair.run(1000);

        let responses = pair.responses(1);
        assert_eq!(responses.len(), 2);
        assert_eq!(received(&responses[0]), b"hi");
        assert_eq!(responses[1], service::bool_response(false));
    }

    #[test]
    fn full_send_queue_blocks_until_acked() {
        let mut pair = Pair::with_config(Config {
            send_buffer: 10,
            ..Default::default()
        });
        let (client, server) = pair.establish();

        pair.request(
            0,
            Request::Send {
                socket: client,
                data: vec![7; 25].into_boxed_slice(),
            },
        );

        assert!(pair.responses(0).is_empty());
        assert!(pair.layers[0].is_blocked(APP));

        pair.run(1000);

        assert_eq!(pair.responses(0), vec![service::int_response(10)]);

        pair.request(
            1,
            Request::Recv {
                socket: server,
                length: 100,
            },
        );

        let responses = pair.responses(1);
        assert_eq!(received(&responses[0]), vec![7; 10]);
    }

    #[test]
    fn lossy_network_delivers_everything_in_order() {
        let mut pair = Pair::new();

        let mut rng = StdRng::seed_from_u64(7);
        pair.drop = Box::new(move |_| rng.gen_bool(0.2));

        let (client, server) = pair.establish_lossy();

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        pair.request(
            0,
            Request::Send {
                socket: client,
                data: data.clone().into_boxed_slice(),
            },
        );
        assert_eq!(pair.responses(0), vec![service::int_response(5000)]);

        pair.run(120_000);

        pair.request(
            1,
            Request::Recv {
                socket: server,
                length: u16::MAX,
            },
        );

        let responses = pair.responses(1);
        assert_eq!(received(&responses[0]), data);
    }

    impl Pair {
        // Like establish, but allows for lost handshake segments
        fn establish_lossy(&mut self) -> (i32, i32) {
            self.request(1, Request::Listen { port: 80 });
            self.request(1, Request::Accept { port: 80 });
            self.request(
                0,
                Request::Connect {
                    address: ADDR[1],
                    port: 80,
                },
            );

            self.run(60_000);

            let client = self.responses(0);
            let server = self.responses(1);
            assert_eq!(server.len(), 2);

            (int(&client[0]), int(&server[1]))
        }
    }

    #[test]
    fn orderly_close_from_both_ends() {
        let mut pair = Pair::new();
        let (client, server) = pair.establish();

        pair.request(
            0,
            Request::Send {
                socket: client,
                data: b"bye".as_slice().into(),
            },
        );
        pair.request(0, Request::Close { socket: client });
        pair.request(
            0,
            Request::Send {
                socket: client,
                data: b"late".as_slice().into(),
            },
        );

        assert_eq!(
            pair.responses(0),
            vec![
                service::int_response(3),
                service::bool_response(true),
                service::int_response(-1),
            ]
        );

        pair.run(1000);

        pair.request(
            1,
            Request::Recv {
                socket: server,
                length: 100,
            },
        );
        pair.request(
            1,
            Request::Recv {
                socket: server,
                length: 100,
            },
        );

        let responses = pair.responses(1);
        assert_eq!(received(&responses[0]), b"bye");
        assert!(received(&responses[1]).is_empty());

        // Half closed until the other end closes too
        assert_eq!(pair.layers[0].connection_count(APP), 1);

        pair.request(1, Request::Close { socket: server });
        assert_eq!(pair.responses(1), vec![service::bool_response(true)]);

        pair.run(1000);

        assert_eq!(pair.layers[0].connection_count(APP), 0);
        assert_eq!(pair.layers[1].connection_count(APP), 0);
    }

    #[test]
    fn removed_application_leaves_no_connections() {
        let mut pair = Pair::new();
        pair.establish();

        pair.layers[0].remove_app(APP);
        assert_eq!(pair.layers[0].connection_count(APP), 0);

        // Leftover timers are ignored
        pair.run(10_000);

        // The freed port can be bound again
        pair.layers[0].add_app(APP);
        pair.request(0, Request::Listen { port: 49152 });
        assert_eq!(pair.responses(0), vec![service::bool_response(true)]);
    }

    #[test]
    fn closed_window_reopens_after_recv() {
        let mut pair = Pair::with_config(Config {
            receive_buffer: 100,
            congestion_window: 64,
            ..Default::default()
        });
        let (client, server) = pair.establish();

        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();

        pair.request(
            0,
            Request::Send {
                socket: client,
                data: data.clone().into_boxed_slice(),
            },
        );
        assert_eq!(pair.responses(0), vec![service::int_response(300)]);

        pair.run(5000);

        let mut collected = Vec::new();

        for _ in 0..10 {
            pair.request(
                1,
                Request::Recv {
                    socket: server,
                    length: 1000,
                },
            );
            pair.run(20_000);

            for response in pair.responses(1) {
                collected.extend(received(&response));
            }

            if collected.len() == data.len() {
                break;
            }
        }

        assert_eq!(collected, data);
    }

    #[test]
    fn lost_final_fin_does_not_strand_the_connection() {
        let mut pair = Pair::new();
        let (client, server) = pair.establish();

        pair.request(0, Request::Close { socket: client });
        assert_eq!(pair.responses(0), vec![service::bool_response(true)]);
        pair.run(1000);

        pair.request(
            1,
            Request::Recv {
                socket: server,
                length: 100,
            },
        );
        let responses = pair.responses(1);
        assert_eq!(responses.len(), 1);
        assert!(received(&responses[0]).is_empty());

        // The next segment out is the server's FIN
        let fin_index = pair.sent;
        pair.drop = Box::new(move |index| index == fin_index);

        pair.request(1, Request::Close { socket: server });
        assert_eq!(pair.layers[1].connection_count(APP), 0);

        pair.run(60_000);

        assert_eq!(pair.layers[0].connection_count(APP), 0);

        // The connecting side's port was released
        pair.request(0, Request::Listen { port: 49152 });
        assert_eq!(pair.responses(0), vec![service::bool_response(true)]);
    }
}
