//! Per-neighbor reliable frame delivery over one physical link.
//!
//! Each neighbor MAC address gets a stop-and-wait connection: exactly one frame may await
//! acknowledgement at a time, and acknowledgements ride on outgoing data frames whenever possible.
//! Connections are opened lazily by a one-byte handshake, the first time either side has
//! something to say. A handshake request arriving on an already established connection means the
//! peer restarted, and the connection is reset accordingly.
//!
//! Broadcast frames bypass connections entirely. They are neither sequenced nor acknowledged.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::addr::MacAddress;
use crate::frame;

mod control;

pub use control::{Control, FrameKind};
use control::{next_seq, HANDSHAKE_REPLY_NEW, HANDSHAKE_REPLY_REPEAT, HANDSHAKE_REQUEST};

/// Largest payload accepted by [`LinkLayer::send`]; one byte of every frame is spent on control.
pub const MAX_PAYLOAD_SIZE: usize = frame::MAX_DATA_LENGTH - 1;

/// Identifies one physical link (wire) attached to a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link{}", self.0)
    }
}

const QUEUE_CAPACITY_DEFAULT: usize = 64;
const MAX_RETRIES_DEFAULT: u32 = 8;
const RTO_INITIAL_DEFAULT_MS: u64 = 200;
const RTO_DECREMENT_DEFAULT_MS: u64 = 25;
const RTO_MIN_DEFAULT_MS: u64 = 50;
const RTO_MAX_DEFAULT_MS: u64 = 4000;
const ACK_DELAY_DEFAULT_MS: u64 = 20;
const BROADCAST_RETRY_DEFAULT_MS: u64 = 10;

/// Configuration for a [`LinkLayer`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of frames queued per neighbor, including the one in flight.
    ///
    /// Default value: 64
    pub queue_capacity: usize,

    /// Number of retransmissions attempted before a neighbor is considered gone.
    ///
    /// Default value: 8
    pub max_retries: u32,

    /// Retransmission timeout assumed before any frame has been sent.
    ///
    /// Default value: 200
    pub rto_initial_ms: u64,

    /// Amount by which the timeout shrinks for each fresh frame.
    ///
    /// Default value: 25
    pub rto_decrement_ms: u64,

    /// Default value: 50
    pub rto_min_ms: u64,

    /// Default value: 4000
    pub rto_max_ms: u64,

    /// Longest time an acknowledgement is held back hoping to piggyback on data.
    ///
    /// Default value: 20
    pub ack_delay_ms: u64,

    /// Delay before a broadcast refused by a busy medium is offered again.
    ///
    /// Default value: 10
    pub broadcast_retry_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: QUEUE_CAPACITY_DEFAULT,
            max_retries: MAX_RETRIES_DEFAULT,
            rto_initial_ms: RTO_INITIAL_DEFAULT_MS,
            rto_decrement_ms: RTO_DECREMENT_DEFAULT_MS,
            rto_min_ms: RTO_MIN_DEFAULT_MS,
            rto_max_ms: RTO_MAX_DEFAULT_MS,
            ack_delay_ms: ACK_DELAY_DEFAULT_MS,
            broadcast_retry_ms: BROADCAST_RETRY_DEFAULT_MS,
        }
    }
}

impl Config {
    pub fn validate(&self) {
        assert!(
            self.queue_capacity > 0,
            "invalid link configuration: queue_capacity == 0"
        );
        assert!(
            self.rto_min_ms > 0,
            "invalid link configuration: rto_min_ms == 0"
        );
        assert!(
            self.rto_min_ms <= self.rto_max_ms,
            "invalid link configuration: rto_min_ms > rto_max_ms"
        );
        assert!(
            self.rto_initial_ms >= self.rto_min_ms && self.rto_initial_ms <= self.rto_max_ms,
            "invalid link configuration: rto_initial_ms outside [rto_min_ms, rto_max_ms]"
        );
        assert!(
            self.broadcast_retry_ms > 0,
            "invalid link configuration: broadcast_retry_ms == 0"
        );
    }
}

pub trait HostContext {
    // Called to hand a frame to the MAC sublayer. Returns false if the medium refused it.
    fn send_frame(&mut self, destination: MacAddress, frame_bytes: &[u8]) -> bool;

    // Called to request a call to handle_timer with the given id at the given time
    fn set_timer(&mut self, timer_id: u64, time_ms: u64);

    // Called when a payload has been received from a neighbor, in order and exactly once
    fn on_receive(&mut self, source: MacAddress, payload: Box<[u8]>);

    // Called when a neighbor stopped acknowledging frames and its connection was dropped
    fn on_disconnect(&mut self, neighbor: MacAddress);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerKind {
    Retransmit,
    AckDelay,
    Broadcast,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Handshaking,
    Established,
}

struct Connection {
    state: State,
    // Sequence number of the frame at the front of the queue
    send_seq: u8,
    // Sequence number expected next from the peer, sent as our ack
    expected_seq: u8,
    queue: VecDeque<Box<[u8]>>,
    // Front of queue (or handshake request) has been transmitted and awaits acknowledgement
    in_flight: bool,
    ack_due: bool,
    rto_timer: Option<u64>,
    ack_timer: Option<u64>,
    retry_count: u32,
    last_rto_ms: u64,
    current_rto_ms: u64,
}

impl Connection {
    fn new(state: State, rto_initial_ms: u64) -> Self {
        Self {
            state,
            send_seq: 0,
            expected_seq: 0,
            queue: VecDeque::new(),
            in_flight: false,
            ack_due: false,
            rto_timer: None,
            ack_timer: None,
            retry_count: 0,
            last_rto_ms: rto_initial_ms,
            current_rto_ms: rto_initial_ms,
        }
    }

    fn reset(&mut self) {
        self.state = State::Established;
        self.send_seq = 0;
        self.expected_seq = 0;
        self.queue.clear();
        self.in_flight = false;
        self.ack_due = false;
        self.rto_timer = None;
        self.ack_timer = None;
        self.retry_count = 0;
    }
}

/// Reliable frame delivery to every neighbor reachable over a single link.
pub struct LinkLayer {
    config: Config,
    connections: HashMap<MacAddress, Connection>,
    // Pending broadcast frame, replaced if a newer one arrives first
    broadcast: Option<Box<[u8]>>,
    broadcast_timer: Option<u64>,
    // Outstanding timers and who they belong to; entries are removed as timers fire
    timers: HashMap<u64, (MacAddress, TimerKind)>,
    next_timer_id: u64,
    rng: StdRng,
}

impl LinkLayer {
    pub fn new(config: Config, rng_seed: u64) -> Self {
        config.validate();

        Self {
            config,
            connections: HashMap::new(),
            broadcast: None,
            broadcast_timer: None,
            timers: HashMap::new(),
            next_timer_id: 0,
            rng: StdRng::seed_from_u64(rng_seed),
        }
    }

    /// Queues a payload for `destination`, returning false if the payload is too large or the
    /// neighbor's queue is full. Broadcast payloads are always accepted.
    pub fn send(
        &mut self,
        ctx: &mut impl HostContext,
        destination: MacAddress,
        payload: &[u8],
        now_ms: u64,
    ) -> bool {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return false;
        }

        if destination.is_broadcast() {
            if self.broadcast.is_some() {
                trace!("discarding unsent broadcast frame");
            }

            self.broadcast = Some(frame_bytes(Control::broadcast(), payload));

            if self.broadcast_timer.is_none() {
                self.flush_broadcast(ctx, now_ms);
            }

            return true;
        }

        match self.connections.get(&destination) {
            Some(conn) if conn.queue.len() >= self.config.queue_capacity => {
                debug!(neighbor = %destination, "link queue full");
                return false;
            }
            Some(_) => {}
            None => {
                debug!(neighbor = %destination, "opening link connection");

                let conn = Connection::new(State::Handshaking, self.config.rto_initial_ms);
                self.connections.insert(destination, conn);

                self.transmit_handshake_request(ctx, destination, now_ms);
            }
        }

        let Some(conn) = self.connections.get_mut(&destination) else {
            return false;
        };

        conn.queue.push_back(payload.into());

        if conn.state == State::Established && !conn.in_flight {
            self.transmit_front(ctx, destination, now_ms);
        }

        true
    }

    /// Handles one frame payload received from `source` (control byte included).
    pub fn handle_frame(
        &mut self,
        ctx: &mut impl HostContext,
        source: MacAddress,
        frame_bytes: &[u8],
        now_ms: u64,
    ) {
        let Some((&control_byte, payload)) = frame_bytes.split_first() else {
            trace!(neighbor = %source, "empty link frame");
            return;
        };

        let Some(control) = Control::from_byte(control_byte) else {
            trace!(neighbor = %source, control_byte, "invalid link control byte");
            return;
        };

        match control.kind {
            FrameKind::Broadcast => {
                ctx.on_receive(source, payload.into());
            }
            FrameKind::Handshake => {
                self.handle_handshake(ctx, source, control.seq, now_ms);
            }
            FrameKind::Data => {
                self.handle_data(ctx, source, control, payload, now_ms);
            }
        }
    }

    fn handle_handshake(
        &mut self,
        ctx: &mut impl HostContext,
        source: MacAddress,
        phase: u8,
        now_ms: u64,
    ) {
        match phase {
            HANDSHAKE_REQUEST => {
                let reply = match self.connections.get_mut(&source) {
                    None => {
                        debug!(neighbor = %source, "accepted link connection");

                        let conn = Connection::new(State::Established, self.config.rto_initial_ms);
                        self.connections.insert(source, conn);

                        HANDSHAKE_REPLY_NEW
                    }
                    Some(conn) if conn.state == State::Handshaking => {
                        // Both sides opened at once; each side's request serves as the other's reply
                        conn.state = State::Established;
                        conn.in_flight = false;
                        conn.retry_count = 0;
                        conn.rto_timer = None;

                        HANDSHAKE_REPLY_NEW
                    }
                    Some(conn) => {
                        debug!(
                            neighbor = %source,
                            dropped = conn.queue.len(),
                            "neighbor restarted, resetting link connection"
                        );

                        conn.reset();

                        HANDSHAKE_REPLY_REPEAT
                    }
                };

                let bytes = frame_bytes(Control::handshake(reply), &[]);
                ctx.send_frame(source, &bytes);

                self.transmit_front(ctx, source, now_ms);
            }
            HANDSHAKE_REPLY_NEW | HANDSHAKE_REPLY_REPEAT => {
                let Some(conn) = self.connections.get_mut(&source) else {
                    trace!(neighbor = %source, "handshake reply without connection");
                    return;
                };

                if conn.state != State::Handshaking {
                    trace!(neighbor = %source, "duplicate handshake reply");
                    return;
                }

                debug!(neighbor = %source, "link connection established");

                conn.state = State::Established;
                conn.in_flight = false;
                conn.retry_count = 0;
                conn.rto_timer = None;

                self.transmit_front(ctx, source, now_ms);
            }
            _ => {
                trace!(neighbor = %source, phase, "unknown handshake phase");
            }
        }
    }

    fn handle_data(
        &mut self,
        ctx: &mut impl HostContext,
        source: MacAddress,
        control: Control,
        payload: &[u8],
        now_ms: u64,
    ) {
        let Some(conn) = self.connections.get_mut(&source) else {
            // The peer believes a connection exists which we have no record of
            debug!(neighbor = %source, "data from unknown neighbor, handshaking");

            let conn = Connection::new(State::Handshaking, self.config.rto_initial_ms);
            self.connections.insert(source, conn);

            self.transmit_handshake_request(ctx, source, now_ms);
            return;
        };

        if conn.state != State::Established {
            trace!(neighbor = %source, "data before handshake completed");
            return;
        }

        let acked = conn.in_flight && control.ack == next_seq(conn.send_seq);
        let is_new = !payload.is_empty() && control.seq == conn.expected_seq;

        if acked {
            conn.queue.pop_front();
            conn.send_seq = next_seq(conn.send_seq);
            conn.in_flight = false;
            conn.rto_timer = None;
            conn.retry_count = 0;
        }

        if is_new {
            conn.expected_seq = next_seq(conn.expected_seq);
            ctx.on_receive(source, payload.into());
        } else if !payload.is_empty() {
            trace!(neighbor = %source, seq = control.seq, "duplicate link frame");
        }

        // Any data frame, new or repeated, is owed an acknowledgement
        if !payload.is_empty() {
            conn.ack_due = true;
        }

        match (acked, is_new) {
            // Duplicate data, or a stale ack
            (false, false) => {}
            // New data, nothing of ours acknowledged
            (false, true) => {}
            // Acknowledged, with or without new data
            (true, _) => self.transmit_front(ctx, source, now_ms),
        }

        self.schedule_ack(ctx, source, now_ms);
    }

    /// Handles a timer previously requested through [`HostContext::set_timer`].
    pub fn handle_timer(&mut self, ctx: &mut impl HostContext, timer_id: u64, now_ms: u64) {
        let Some((neighbor, kind)) = self.timers.remove(&timer_id) else {
            return;
        };

        match kind {
            TimerKind::Broadcast => {
                if self.broadcast_timer == Some(timer_id) {
                    self.broadcast_timer = None;
                    self.flush_broadcast(ctx, now_ms);
                }
            }
            TimerKind::AckDelay => {
                let Some(conn) = self.connections.get_mut(&neighbor) else {
                    return;
                };

                if conn.ack_timer != Some(timer_id) {
                    return;
                }

                conn.ack_timer = None;

                if conn.ack_due && conn.state == State::Established {
                    conn.ack_due = false;

                    let bytes = frame_bytes(Control::data(conn.send_seq, conn.expected_seq), &[]);
                    ctx.send_frame(neighbor, &bytes);
                }
            }
            TimerKind::Retransmit => {
                let Some(conn) = self.connections.get_mut(&neighbor) else {
                    return;
                };

                if conn.rto_timer != Some(timer_id) {
                    return;
                }

                conn.rto_timer = None;

                if conn.retry_count >= self.config.max_retries {
                    warn!(
                        %neighbor,
                        dropped = conn.queue.len(),
                        "neighbor unresponsive, dropping link connection"
                    );

                    self.connections.remove(&neighbor);
                    ctx.on_disconnect(neighbor);
                    return;
                }

                conn.retry_count += 1;

                let grown = self
                    .rng
                    .gen_range(conn.current_rto_ms..conn.current_rto_ms * 2);
                conn.current_rto_ms = grown.min(self.config.rto_max_ms);

                trace!(
                    %neighbor,
                    retry = conn.retry_count,
                    rto_ms = conn.current_rto_ms,
                    "link retransmission"
                );

                match conn.state {
                    State::Handshaking => self.send_handshake_request(ctx, neighbor, now_ms),
                    State::Established => {
                        conn.in_flight = false;
                        self.send_front(ctx, neighbor, now_ms);
                    }
                }
            }
        }
    }

    /// Opens a fresh handshake with `neighbor`, used on first contact.
    fn transmit_handshake_request(
        &mut self,
        ctx: &mut impl HostContext,
        neighbor: MacAddress,
        now_ms: u64,
    ) {
        if let Some(conn) = self.connections.get_mut(&neighbor) {
            conn.current_rto_ms = fresh_rto(&self.config, conn.last_rto_ms);
            conn.last_rto_ms = conn.current_rto_ms;
        }

        self.send_handshake_request(ctx, neighbor, now_ms);
    }

    fn send_handshake_request(
        &mut self,
        ctx: &mut impl HostContext,
        neighbor: MacAddress,
        now_ms: u64,
    ) {
        let bytes = frame_bytes(Control::handshake(HANDSHAKE_REQUEST), &[]);
        ctx.send_frame(neighbor, &bytes);

        self.arm_retransmit(ctx, neighbor, now_ms);
    }

    /// Sends the frame at the front of the queue for the first time, if one is waiting.
    fn transmit_front(&mut self, ctx: &mut impl HostContext, neighbor: MacAddress, now_ms: u64) {
        let rto_ms = match self.connections.get(&neighbor) {
            Some(conn)
                if conn.state == State::Established && !conn.in_flight && !conn.queue.is_empty() =>
            {
                fresh_rto(&self.config, conn.last_rto_ms)
            }
            _ => return,
        };

        if let Some(conn) = self.connections.get_mut(&neighbor) {
            conn.current_rto_ms = rto_ms;
            conn.last_rto_ms = rto_ms;
        }

        self.send_front(ctx, neighbor, now_ms);
    }

    fn send_front(&mut self, ctx: &mut impl HostContext, neighbor: MacAddress, now_ms: u64) {
        let Some(conn) = self.connections.get_mut(&neighbor) else {
            return;
        };

        let Some(payload) = conn.queue.front() else {
            return;
        };

        let bytes = frame_bytes(Control::data(conn.send_seq, conn.expected_seq), payload);

        conn.in_flight = true;
        conn.ack_due = false;
        conn.ack_timer = None;

        if !ctx.send_frame(neighbor, &bytes) {
            trace!(%neighbor, "medium busy, waiting for retransmission");
        }

        self.arm_retransmit(ctx, neighbor, now_ms);
    }

    fn arm_retransmit(&mut self, ctx: &mut impl HostContext, neighbor: MacAddress, now_ms: u64) {
        let timer_id = self.allocate_timer(neighbor, TimerKind::Retransmit);

        if let Some(conn) = self.connections.get_mut(&neighbor) {
            conn.rto_timer = Some(timer_id);
            ctx.set_timer(timer_id, now_ms + conn.current_rto_ms);
        }
    }

    fn schedule_ack(&mut self, ctx: &mut impl HostContext, neighbor: MacAddress, now_ms: u64) {
        let needs_timer = match self.connections.get(&neighbor) {
            Some(conn) => conn.ack_due && conn.ack_timer.is_none(),
            None => false,
        };

        if !needs_timer {
            return;
        }

        let timer_id = self.allocate_timer(neighbor, TimerKind::AckDelay);

        if let Some(conn) = self.connections.get_mut(&neighbor) {
            conn.ack_timer = Some(timer_id);
        }

        ctx.set_timer(timer_id, now_ms + self.config.ack_delay_ms);
    }

    fn flush_broadcast(&mut self, ctx: &mut impl HostContext, now_ms: u64) {
        let Some(bytes) = self.broadcast.take() else {
            return;
        };

        if !ctx.send_frame(MacAddress::BROADCAST, &bytes) {
            trace!("medium busy, deferring broadcast");

            self.broadcast = Some(bytes);

            let timer_id = self.allocate_timer(MacAddress::BROADCAST, TimerKind::Broadcast);
            self.broadcast_timer = Some(timer_id);
            ctx.set_timer(timer_id, now_ms + self.config.broadcast_retry_ms);
        }
    }

    fn allocate_timer(&mut self, neighbor: MacAddress, kind: TimerKind) -> u64 {
        let timer_id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.insert(timer_id, (neighbor, kind));
        timer_id
    }

    /// Returns true if a connection (in any state) exists for `neighbor`.
    pub fn is_connected(&self, neighbor: MacAddress) -> bool {
        self.connections.contains_key(&neighbor)
    }

    /// Number of frames queued for `neighbor`, including one in flight.
    pub fn queue_len(&self, neighbor: MacAddress) -> usize {
        self.connections
            .get(&neighbor)
            .map_or(0, |conn| conn.queue.len())
    }
}

// Timeout for a frame's first transmission, shrinking from the previous one
fn fresh_rto(config: &Config, last_rto_ms: u64) -> u64 {
    last_rto_ms
        .saturating_sub(config.rto_decrement_ms)
        .max(config.rto_min_ms)
}

fn frame_bytes(control: Control, payload: &[u8]) -> Box<[u8]> {
    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(control.to_byte());
    bytes.extend_from_slice(payload);
    bytes.into_boxed_slice()
}
