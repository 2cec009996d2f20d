//! A complete host: one link layer per attached wire, a network layer, and a transport layer
//! serving local applications.
//!
//! The node performs no I/O itself. Callers feed it wire bytes, application bytes and the current
//! time, and drain [`Output`]s to write back out. Packets travelling up the stack are queued and
//! handled after the current engine call returns, so no engine is ever re-entered.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use tracing::{debug, info, trace, warn};

use crate::addr::MacAddress;
use crate::frame::{self, FrameDecoder};
use crate::link::{self, LinkId, LinkLayer};
use crate::network::{self, NetworkLayer};
use crate::timer_queue::TimerQueue;
use crate::transport::service::RequestReader;
use crate::transport::{self, AppId, TransportLayer};
use crate::Result;

const WIRE_QUEUE_CAPACITY_DEFAULT: usize = 64;

/// Configuration for every layer of a [`Node`].
#[derive(Clone, Debug)]
pub struct Config {
    pub link: link::Config,
    pub network: network::Config,
    pub transport: transport::Config,

    /// Frames which may wait in the output queue for one link before the link is considered busy
    /// and further frames are refused.
    ///
    /// Default value: 64
    pub wire_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            link: link::Config::default(),
            network: network::Config::default(),
            transport: transport::Config::default(),
            wire_queue_capacity: WIRE_QUEUE_CAPACITY_DEFAULT,
        }
    }
}

impl Config {
    pub fn validate(&self) {
        assert!(
            self.wire_queue_capacity > 0,
            "invalid node configuration: wire_queue_capacity == 0"
        );
        self.link.validate();
        self.network.validate();
        self.transport.validate();
    }
}

/// Bytes the node wants written somewhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
    /// Encoded frame for a wire.
    Wire { link: LinkId, bytes: Box<[u8]> },
    /// Response for an application.
    App { app: AppId, bytes: Box<[u8]> },
}

#[derive(Clone, Copy, Debug)]
enum TimerTarget {
    // Link timers carry the generation of the link they were set for, so that a link removed and
    // attached again under the same id ignores them
    Link {
        link: LinkId,
        generation: u64,
        timer_id: u64,
    },
    Network(u64),
    Transport(u64),
}

enum Event {
    Packet {
        link: LinkId,
        source: MacAddress,
        bytes: Box<[u8]>,
    },
    Disconnect {
        link: LinkId,
        neighbor: MacAddress,
    },
    Segment {
        source: Ipv4Addr,
        bytes: Box<[u8]>,
    },
}

struct LinkSlot {
    generation: u64,
    arq: LinkLayer,
    decoder: FrameDecoder,
    // Frames of this link still in the output queue
    queued: usize,
}

struct LinkContext<'a> {
    link: LinkId,
    generation: u64,
    local_mac: MacAddress,
    queued: &'a mut usize,
    capacity: usize,
    timers: &'a mut TimerQueue<TimerTarget>,
    events: &'a mut VecDeque<Event>,
    outputs: &'a mut VecDeque<Output>,
}

impl link::HostContext for LinkContext<'_> {
    fn send_frame(&mut self, destination: MacAddress, frame_bytes: &[u8]) -> bool {
        if *self.queued >= self.capacity {
            return false;
        }

        let bytes = frame::encode(destination, self.local_mac, frame_bytes);

        self.outputs.push_back(Output::Wire {
            link: self.link,
            bytes,
        });
        *self.queued += 1;

        true
    }

    fn set_timer(&mut self, timer_id: u64, time_ms: u64) {
        self.timers.add_timer(
            time_ms,
            TimerTarget::Link {
                link: self.link,
                generation: self.generation,
                timer_id,
            },
        );
    }

    fn on_receive(&mut self, source: MacAddress, payload: Box<[u8]>) {
        self.events.push_back(Event::Packet {
            link: self.link,
            source,
            bytes: payload,
        });
    }

    fn on_disconnect(&mut self, neighbor: MacAddress) {
        self.events.push_back(Event::Disconnect {
            link: self.link,
            neighbor,
        });
    }
}

struct NetworkContext<'a> {
    now_ms: u64,
    local_mac: MacAddress,
    wire_queue_capacity: usize,
    links: &'a mut HashMap<LinkId, LinkSlot>,
    timers: &'a mut TimerQueue<TimerTarget>,
    events: &'a mut VecDeque<Event>,
    outputs: &'a mut VecDeque<Output>,
}

impl network::HostContext for NetworkContext<'_> {
    fn send_frame(&mut self, link: LinkId, destination: MacAddress, packet_bytes: &[u8]) -> bool {
        let Some(slot) = self.links.get_mut(&link) else {
            return false;
        };

        let mut ctx = LinkContext {
            link,
            generation: slot.generation,
            local_mac: self.local_mac,
            queued: &mut slot.queued,
            capacity: self.wire_queue_capacity,
            timers: &mut *self.timers,
            events: &mut *self.events,
            outputs: &mut *self.outputs,
        };

        slot.arq.send(&mut ctx, destination, packet_bytes, self.now_ms)
    }

    fn set_timer(&mut self, timer_id: u64, time_ms: u64) {
        self.timers.add_timer(time_ms, TimerTarget::Network(timer_id));
    }

    fn on_receive(&mut self, source: Ipv4Addr, payload: Box<[u8]>) {
        self.events.push_back(Event::Segment {
            source,
            bytes: payload,
        });
    }
}

struct TransportContext<'a> {
    network: &'a mut NetworkLayer,
    lower: NetworkContext<'a>,
}

impl transport::HostContext for TransportContext<'_> {
    fn send_segment(&mut self, destination: Ipv4Addr, segment_bytes: &[u8]) -> bool {
        let now_ms = self.lower.now_ms;
        self.network
            .send(&mut self.lower, destination, segment_bytes, now_ms)
    }

    fn set_timer(&mut self, timer_id: u64, time_ms: u64) {
        self.lower
            .timers
            .add_timer(time_ms, TimerTarget::Transport(timer_id));
    }

    fn respond(&mut self, app: AppId, response: Box<[u8]>) {
        self.lower.outputs.push_back(Output::App {
            app,
            bytes: response,
        });
    }
}

pub struct Node {
    config: Config,
    mac: MacAddress,
    rng_seed: u64,
    links: HashMap<LinkId, LinkSlot>,
    next_generation: u64,
    network: NetworkLayer,
    transport: TransportLayer,
    readers: HashMap<AppId, RequestReader>,
    timers: TimerQueue<TimerTarget>,
    events: VecDeque<Event>,
    outputs: VecDeque<Output>,
    expired: Vec<TimerTarget>,
}

// Borrows everything the network layer's context needs, leaving self.network free
macro_rules! network_context {
    ($self:ident, $now_ms:expr) => {
        NetworkContext {
            now_ms: $now_ms,
            local_mac: $self.mac,
            wire_queue_capacity: $self.config.wire_queue_capacity,
            links: &mut $self.links,
            timers: &mut $self.timers,
            events: &mut $self.events,
            outputs: &mut $self.outputs,
        }
    };
}

macro_rules! transport_context {
    ($self:ident, $now_ms:expr) => {
        TransportContext {
            network: &mut $self.network,
            lower: network_context!($self, $now_ms),
        }
    };
}

impl Node {
    pub fn new(config: Config, mac: MacAddress, address: Ipv4Addr, rng_seed: u64) -> Self {
        config.validate();

        let network = NetworkLayer::new(config.network.clone(), address, rng_seed);
        let transport = TransportLayer::new(config.transport.clone());

        info!(%mac, %address, "node started");

        Self {
            config,
            mac,
            rng_seed,
            links: HashMap::new(),
            next_generation: 0,
            network,
            transport,
            readers: HashMap::new(),
            timers: TimerQueue::new(),
            events: VecDeque::new(),
            outputs: VecDeque::new(),
            expired: Vec::new(),
        }
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn address(&self) -> Ipv4Addr {
        self.network.local_address()
    }

    pub fn network(&self) -> &NetworkLayer {
        &self.network
    }

    pub fn transport(&self) -> &TransportLayer {
        &self.transport
    }

    /// Returns true if unicasts to `destination` currently have a next hop.
    pub fn has_route(&mut self, destination: Ipv4Addr) -> bool {
        self.network.has_route(destination)
    }

    /// Attaches a wire. Discovery on it starts right away.
    pub fn add_link(&mut self, link: LinkId, now_ms: u64) {
        if self.links.contains_key(&link) {
            return;
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let seed = self.rng_seed ^ (u64::from(link.0) << 32) ^ generation;

        self.links.insert(
            link,
            LinkSlot {
                generation,
                arq: LinkLayer::new(self.config.link.clone(), seed),
                decoder: FrameDecoder::new(),
                queued: 0,
            },
        );

        let mut ctx = network_context!(self, now_ms);
        self.network.add_link(&mut ctx, link, now_ms);

        self.process_events(now_ms);
    }

    /// Detaches a wire. Frames not yet written to it are discarded, and timers still pending for
    /// it are ignored when they fire.
    pub fn remove_link(&mut self, link: LinkId) {
        if self.links.remove(&link).is_none() {
            return;
        }

        self.outputs
            .retain(|output| !matches!(output, Output::Wire { link: l, .. } if *l == link));

        self.network.remove_link(link);
    }

    /// Feeds bytes read from a wire. They need not be aligned to frame boundaries.
    pub fn handle_wire_bytes(&mut self, link: LinkId, bytes: &[u8], now_ms: u64) {
        let Some(slot) = self.links.get_mut(&link) else {
            debug!(%link, "bytes for unknown link");
            return;
        };

        slot.decoder.push(bytes);

        let mut ctx = LinkContext {
            link,
            generation: slot.generation,
            local_mac: self.mac,
            queued: &mut slot.queued,
            capacity: self.config.wire_queue_capacity,
            timers: &mut self.timers,
            events: &mut self.events,
            outputs: &mut self.outputs,
        };

        while let Some(mac_frame) = slot.decoder.next_frame() {
            if mac_frame.destination != self.mac && !mac_frame.destination.is_broadcast() {
                trace!(%link, destination = %mac_frame.destination, "frame for another host");
                continue;
            }

            slot.arq
                .handle_frame(&mut ctx, mac_frame.source, &mac_frame.payload, now_ms);
        }

        self.process_events(now_ms);
    }

    pub fn add_app(&mut self, app: AppId) {
        debug!(%app, "application attached");

        self.transport.add_app(app);
        self.readers.insert(app, RequestReader::new());
    }

    pub fn remove_app(&mut self, app: AppId) {
        if self.readers.remove(&app).is_some() {
            debug!(%app, "application detached");
        }

        self.transport.remove_app(app);
    }

    /// Feeds bytes read from an application's request stream. A malformed request detaches the
    /// application and returns the error.
    pub fn handle_app_bytes(&mut self, app: AppId, bytes: &[u8], now_ms: u64) -> Result<()> {
        let Some(reader) = self.readers.get_mut(&app) else {
            debug!(%app, "bytes for unknown application");
            return Ok(());
        };

        reader.push(bytes);

        while let Some(reader) = self.readers.get_mut(&app) {
            let request = match reader.next_request() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(err) => {
                    warn!(%app, %err, "malformed application request");
                    self.remove_app(app);
                    return Err(err);
                }
            };

            trace!(%app, ?request, "application request");

            let mut ctx = transport_context!(self, now_ms);
            self.transport.handle_request(&mut ctx, app, request, now_ms);

            self.process_events(now_ms);
        }

        Ok(())
    }

    pub fn next_timer_time_ms(&self) -> Option<u64> {
        self.timers.next_expiration_time_ms()
    }

    /// Fires every timer due at or before `now_ms`.
    pub fn handle_timers(&mut self, now_ms: u64) {
        let mut expired = std::mem::take(&mut self.expired);

        self.timers.pop_expired(now_ms, &mut expired);

        for target in expired.drain(..) {
            match target {
                TimerTarget::Link {
                    link,
                    generation,
                    timer_id,
                } => {
                    let Some(slot) = self.links.get_mut(&link) else {
                        continue;
                    };

                    if slot.generation != generation {
                        continue;
                    }

                    let mut ctx = LinkContext {
                        link,
                        generation,
                        local_mac: self.mac,
                        queued: &mut slot.queued,
                        capacity: self.config.wire_queue_capacity,
                        timers: &mut self.timers,
                        events: &mut self.events,
                        outputs: &mut self.outputs,
                    };

                    slot.arq.handle_timer(&mut ctx, timer_id, now_ms);
                }
                TimerTarget::Network(timer_id) => {
                    let mut ctx = network_context!(self, now_ms);
                    self.network.handle_timer(&mut ctx, timer_id, now_ms);
                }
                TimerTarget::Transport(timer_id) => {
                    let mut ctx = transport_context!(self, now_ms);
                    self.transport.handle_timer(&mut ctx, timer_id, now_ms);
                }
            }

            self.process_events(now_ms);
        }

        self.expired = expired;
    }

    pub fn poll_output(&mut self) -> Option<Output> {
        let output = self.outputs.pop_front()?;

        if let Output::Wire { link, .. } = &output {
            if let Some(slot) = self.links.get_mut(link) {
                slot.queued = slot.queued.saturating_sub(1);
            }
        }

        Some(output)
    }

    fn process_events(&mut self, now_ms: u64) {
        while let Some(event) = self.events.pop_front() {
            match event {
                Event::Packet {
                    link,
                    source,
                    bytes,
                } => {
                    let mut ctx = network_context!(self, now_ms);
                    self.network
                        .handle_packet(&mut ctx, link, source, &bytes, now_ms);
                }
                Event::Disconnect { link, neighbor } => {
                    self.network.neighbor_disconnected(link, neighbor);
                }
                Event::Segment { source, bytes } => {
                    let mut ctx = transport_context!(self, now_ms);
                    self.transport
                        .handle_segment(&mut ctx, source, &bytes, now_ms);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::service::{self, Request};

    fn node() -> Node {
        Node::new(
            Config::default(),
            MacAddress::new(0x02_00_00_00_00_01),
            Ipv4Addr::new(10, 0, 0, 1),
            1,
        )
    }

    fn app_responses(node: &mut Node) -> Vec<Box<[u8]>> {
        let mut responses = Vec::new();

        while let Some(output) = node.poll_output() {
            if let Output::App { bytes, .. } = output {
                responses.push(bytes);
            }
        }

        responses
    }

    #[test]
    fn discovery_starts_on_new_link() {
        let mut node = node();

        node.add_link(LinkId(0), 0);
        assert!(node.next_timer_time_ms().is_some());

        node.handle_timers(node.config.network.discovery_interval_ms);

        let mut frames = Vec::new();
        while let Some(output) = node.poll_output() {
            if let Output::Wire { link, bytes } = output {
                assert_eq!(link, LinkId(0));
                frames.push(bytes);
            }
        }

        assert!(!frames.is_empty());

        let (mac_frame, _) = frame::decode(&frames[0]).unwrap();
        assert!(mac_frame.destination.is_broadcast());
        assert_eq!(mac_frame.source, node.mac());
    }

    #[test]
    fn loopback_connection() {
        let mut node = node();
        let server = AppId(1);
        let client = AppId(2);
        let address = node.address();

        node.add_app(server);
        node.add_app(client);

        let mut now_ms = 0;

        node.handle_app_bytes(server, &Request::Listen { port: 7 }.encode(), now_ms)
            .unwrap();
        node.handle_app_bytes(server, &Request::Accept { port: 7 }.encode(), now_ms)
            .unwrap();
        node.handle_app_bytes(
            client,
            &Request::Connect { address, port: 7 }.encode(),
            now_ms,
        )
        .unwrap();

        while let Some(time_ms) = node.next_timer_time_ms() {
            if time_ms > 5000 {
                break;
            }
            now_ms = time_ms;
            node.handle_timers(now_ms);
        }

        let responses = app_responses(&mut node);

        assert_eq!(responses[0], service::bool_response(true));
        assert!(responses.contains(&service::int_response(1)));
        assert!(responses
            .iter()
            .any(|r| r.len() == service::ACCEPT_RESPONSE_SIZE && r[..4] == [0, 0, 0, 1]));
        assert_eq!(node.transport().connection_count(server), 1);
        assert_eq!(node.transport().connection_count(client), 1);
    }

    #[test]
    fn malformed_request_detaches_application() {
        let mut node = node();
        let app = AppId(1);

        node.add_app(app);

        assert!(node.handle_app_bytes(app, &[0x7f], 0).is_err());

        // Further bytes are ignored
        assert!(node
            .handle_app_bytes(app, &Request::Listen { port: 7 }.encode(), 0)
            .is_ok());
        assert!(app_responses(&mut node).is_empty());
    }

    #[test]
    fn frames_for_other_hosts_are_ignored() {
        let mut node = node();
        node.add_link(LinkId(0), 0);
        while node.poll_output().is_some() {}

        let stranger = MacAddress::new(0x02_00_00_00_00_09);
        let other = MacAddress::new(0x02_00_00_00_00_0a);

        // A handshake request would be answered if it were addressed to us
        let bytes = frame::encode(other, stranger, &[link::Control::handshake(0).to_byte()]);
        node.handle_wire_bytes(LinkId(0), &bytes, 10);
        assert!(node.poll_output().is_none());

        let bytes = frame::encode(node.mac(), stranger, &[link::Control::handshake(0).to_byte()]);
        node.handle_wire_bytes(LinkId(0), &bytes, 10);
        assert!(matches!(node.poll_output(), Some(Output::Wire { .. })));
    }

    fn wire_outputs(node: &mut Node) -> Vec<(LinkId, frame::MacFrame)> {
        let mut frames = Vec::new();

        while let Some(output) = node.poll_output() {
            if let Output::Wire { link, bytes } = output {
                frames.push((link, frame::decode(&bytes).unwrap().0));
            }
        }

        frames
    }

    #[test]
    fn reattached_link_ignores_timers_of_its_predecessor() {
        let mut config = Config::default();
        config.link.rto_initial_ms = 200;
        config.link.rto_min_ms = 200;

        let mut node = Node::new(
            config,
            MacAddress::new(0x02_00_00_00_00_01),
            Ipv4Addr::new(10, 0, 0, 1),
            1,
        );
        let neighbor = MacAddress::new(0x02_00_00_00_00_02);

        // Data from a neighbor we have no connection with starts a handshake, whose
        // retransmission timer is due at 200
        let data = frame::encode(
            node.mac(),
            neighbor,
            &[link::Control::data(0, 0).to_byte(), b'x'],
        );

        node.add_link(LinkId(0), 0);
        node.handle_wire_bytes(LinkId(0), &data, 0);
        assert!(wire_outputs(&mut node)
            .iter()
            .any(|(_, f)| f.destination == neighbor));

        // The replacement link allocates the same timer id, due at 300
        node.remove_link(LinkId(0));
        node.add_link(LinkId(0), 100);
        node.handle_wire_bytes(LinkId(0), &data, 100);
        assert!(wire_outputs(&mut node)
            .iter()
            .any(|(_, f)| f.destination == neighbor));

        node.handle_timers(250);
        assert!(!wire_outputs(&mut node)
            .iter()
            .any(|(_, f)| f.destination == neighbor));

        node.handle_timers(300);
        let retransmitted: Vec<_> = wire_outputs(&mut node)
            .into_iter()
            .filter(|(_, f)| f.destination == neighbor)
            .collect();
        assert_eq!(retransmitted.len(), 1);
        assert_eq!(
            retransmitted[0].1.payload[..],
            [link::Control::handshake(0).to_byte()]
        );
    }

    #[test]
    fn full_wire_queue_defers_broadcasts() {
        let config = Config {
            wire_queue_capacity: 1,
            ..Default::default()
        };

        let mut node = Node::new(
            config,
            MacAddress::new(0x02_00_00_00_00_01),
            Ipv4Addr::new(10, 0, 0, 1),
            1,
        );

        node.add_link(LinkId(0), 0);

        // Several discovery rounds pass while nothing is written to the wire
        while let Some(time_ms) = node.next_timer_time_ms() {
            if time_ms > 3000 {
                break;
            }
            node.handle_timers(time_ms);
        }

        assert_eq!(wire_outputs(&mut node).len(), 1);

        // Once the queue drains, the held broadcast goes out on its next retry
        node.handle_timers(3000 + node.config.link.broadcast_retry_ms);

        let frames = wire_outputs(&mut node);
        assert!(!frames.is_empty());
        assert!(frames[0].1.destination.is_broadcast());
    }
}
