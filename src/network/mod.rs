//! Routing over a mesh of links.
//!
//! Three control protocols run beneath transport traffic:
//!
//! * Discovery. Each attached link periodically broadcasts a timestamped request, and every node
//!   that hears it replies directly. The round trip measured from the echoed timestamp becomes
//!   that neighbor's link delay.
//! * Link-state advertisement. Periodically, the node advertises its current neighbor delays to
//!   the whole network. Advertisements are flooded along a minimum spanning tree computed from
//!   every advertisement held, so the flood never loops (given consistent views).
//! * Routing. For each neighbor, shortest paths are computed as if that neighbor were the only
//!   way out. Unicast packets pick a next hop at random, weighted toward the neighbors with the
//!   shortest paths to the destination.
//!
//! Payloads too large for one frame are fragmented. Each fragment carries the length of the full
//! payload and its offset, and is reassembled at the destination.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::addr::{MacAddress, BROADCAST_IP};
use crate::link::{self, LinkId};

pub mod fragment;
pub mod header;
pub mod neighbors;
pub mod topology;

use fragment::Fragment;
use header::{PacketHeader, Protocol, HEADER_SIZE, TTL_OFFSET};
use neighbors::NeighborTable;
use topology::{Advertisement, Topology};

/// Largest fragment payload that still fits into a single link frame.
pub const MAX_FRAGMENT_SIZE: usize = link::MAX_PAYLOAD_SIZE - HEADER_SIZE;

/// Largest payload [`NetworkLayer::send`] accepts.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

const DISCOVERY_INTERVAL_DEFAULT_MS: u64 = 1000;
const NEIGHBOR_TIMEOUT_DEFAULT_MS: u64 = 3500;
const ADVERTISEMENT_INTERVAL_DEFAULT_MS: u64 = 1500;
const TOPOLOGY_TIMEOUT_DEFAULT_MS: u64 = 6000;
const REASSEMBLY_TIMEOUT_DEFAULT_MS: u64 = 5000;
const FRAGMENT_SIZE_DEFAULT: usize = 256;
const BROADCAST_TTL_DEFAULT: u8 = 16;

/// Configuration for a [`NetworkLayer`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Period of the per-link discovery cycle.
    ///
    /// Default value: 1000
    pub discovery_interval_ms: u64,

    /// Lifetime of a neighbor entry after its last discovery reply.
    ///
    /// Default value: 3500
    pub neighbor_timeout_ms: u64,

    /// Period of link-state advertisements.
    ///
    /// Default value: 1500
    pub advertisement_interval_ms: u64,

    /// Lifetime of a topology record after its last advertisement.
    ///
    /// Default value: 6000
    pub topology_timeout_ms: u64,

    /// Time after the latest fragment before an incomplete packet is abandoned.
    ///
    /// Default value: 5000
    pub reassembly_timeout_ms: u64,

    /// Payload bytes carried per fragment.
    ///
    /// Minimum value: 1 \
    /// Maximum value: 1483 \
    /// Default value: 256
    pub fragment_size: usize,

    /// Hop limit given to broadcast data packets.
    ///
    /// Default value: 16
    pub broadcast_ttl: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_interval_ms: DISCOVERY_INTERVAL_DEFAULT_MS,
            neighbor_timeout_ms: NEIGHBOR_TIMEOUT_DEFAULT_MS,
            advertisement_interval_ms: ADVERTISEMENT_INTERVAL_DEFAULT_MS,
            topology_timeout_ms: TOPOLOGY_TIMEOUT_DEFAULT_MS,
            reassembly_timeout_ms: REASSEMBLY_TIMEOUT_DEFAULT_MS,
            fragment_size: FRAGMENT_SIZE_DEFAULT,
            broadcast_ttl: BROADCAST_TTL_DEFAULT,
        }
    }
}

impl Config {
    pub fn validate(&self) {
        assert!(
            self.discovery_interval_ms > 0,
            "invalid network configuration: discovery_interval_ms == 0"
        );
        assert!(
            self.neighbor_timeout_ms > self.discovery_interval_ms,
            "invalid network configuration: neighbor_timeout_ms <= discovery_interval_ms"
        );
        assert!(
            self.advertisement_interval_ms > 0,
            "invalid network configuration: advertisement_interval_ms == 0"
        );
        assert!(
            self.topology_timeout_ms > self.advertisement_interval_ms,
            "invalid network configuration: topology_timeout_ms <= advertisement_interval_ms"
        );
        assert!(
            self.fragment_size > 0 && self.fragment_size <= MAX_FRAGMENT_SIZE,
            "invalid network configuration: fragment_size outside [1, {}]",
            MAX_FRAGMENT_SIZE
        );
    }
}

pub trait HostContext {
    // Called to hand a packet to the link layer of the given link. Returns false if refused.
    fn send_frame(&mut self, link: LinkId, destination: MacAddress, packet_bytes: &[u8]) -> bool;

    // Called to request a call to handle_timer with the given id at the given time
    fn set_timer(&mut self, timer_id: u64, time_ms: u64);

    // Called when a complete transport payload addressed to this node has arrived
    fn on_receive(&mut self, source: Ipv4Addr, payload: Box<[u8]>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerKind {
    Discovery(LinkId),
    Advertisement,
    Reassembly(Ipv4Addr, u16),
}

struct Reassembly {
    fragment: Fragment,
    timer_id: u64,
}

/// Chosen first hop toward some destination.
struct Route {
    link: LinkId,
    mac: MacAddress,
    ttl: u8,
}

/// Network layer of a single node.
pub struct NetworkLayer {
    config: Config,
    local: Ipv4Addr,
    links: BTreeSet<LinkId>,
    neighbors: NeighborTable,
    topology: Topology,
    // Whether per-neighbor shortest paths are out of date
    paths_dirty: bool,
    advertisement_sequence: u32,
    next_packet_id: u16,
    reassembly: HashMap<(Ipv4Addr, u16), Reassembly>,
    // Current discovery timer of each link
    discovery_timers: HashMap<LinkId, u64>,
    advertisement_timer: Option<u64>,
    timers: HashMap<u64, TimerKind>,
    next_timer_id: u64,
    rng: StdRng,
}

impl NetworkLayer {
    pub fn new(config: Config, local: Ipv4Addr, rng_seed: u64) -> Self {
        config.validate();

        Self {
            config,
            local,
            links: BTreeSet::new(),
            neighbors: NeighborTable::new(),
            topology: Topology::new(local),
            paths_dirty: false,
            advertisement_sequence: 0,
            next_packet_id: 0,
            reassembly: HashMap::new(),
            discovery_timers: HashMap::new(),
            advertisement_timer: None,
            timers: HashMap::new(),
            next_timer_id: 0,
            rng: StdRng::seed_from_u64(rng_seed),
        }
    }

    pub fn local_address(&self) -> Ipv4Addr {
        self.local
    }

    /// Starts discovery on a newly attached link.
    pub fn add_link(&mut self, ctx: &mut impl HostContext, link: LinkId, now_ms: u64) {
        if !self.links.insert(link) {
            return;
        }

        info!(%link, "link attached");

        let delay_ms = self.rng.gen_range(0..self.config.discovery_interval_ms);
        let timer_id = self.allocate_timer(TimerKind::Discovery(link));
        self.discovery_timers.insert(link, timer_id);
        ctx.set_timer(timer_id, now_ms + delay_ms);

        if self.advertisement_timer.is_none() {
            let delay_ms = self.rng.gen_range(0..self.config.advertisement_interval_ms);
            let timer_id = self.allocate_timer(TimerKind::Advertisement);
            self.advertisement_timer = Some(timer_id);
            ctx.set_timer(timer_id, now_ms + delay_ms);
        }
    }

    /// Forgets a link and every neighbor reached through it. Its discovery timer is left to
    /// expire harmlessly.
    pub fn remove_link(&mut self, link: LinkId) {
        if !self.links.remove(&link) {
            return;
        }

        info!(%link, "link detached");

        self.discovery_timers.remove(&link);

        let removed = self.neighbors.remove_link(link);
        if !removed.is_empty() {
            debug!(%link, ?removed, "neighbors lost with link");
            self.paths_dirty = true;
        }
    }

    /// Drops a neighbor whose link-layer connection failed.
    pub fn neighbor_disconnected(&mut self, link: LinkId, mac: MacAddress) {
        let removed = self.neighbors.remove_mac(link, mac);
        if !removed.is_empty() {
            debug!(%link, neighbor = %mac, ?removed, "neighbor unreachable");
            self.paths_dirty = true;
        }
    }

    /// Sends a transport payload to `destination`, which may be this node or the broadcast
    /// address. Returns false if there is no route, or the payload is too large.
    pub fn send(
        &mut self,
        ctx: &mut impl HostContext,
        destination: Ipv4Addr,
        payload: &[u8],
        now_ms: u64,
    ) -> bool {
        if payload.len() > MAX_PAYLOAD_SIZE {
            warn!(len = payload.len(), "payload too large for network layer");
            return false;
        }

        if destination == self.local {
            ctx.on_receive(self.local, payload.into());
            return true;
        }

        self.purge(now_ms);

        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);

        let mut header = PacketHeader {
            protocol: Protocol::Transport,
            ttl: 0,
            id,
            total_length: payload.len() as u16,
            offset: 0,
            source: self.local,
            destination,
        };

        if destination == BROADCAST_IP {
            header.ttl = self.config.broadcast_ttl;

            let targets = self.tree_targets(None);

            for (offset, chunk) in fragments(payload, self.config.fragment_size) {
                header.offset = offset;
                let packet = header.encode(chunk);

                for &(link, mac) in targets.iter() {
                    ctx.send_frame(link, mac, &packet);
                }
            }

            return true;
        }

        let Some(route) = self.route(destination, None) else {
            debug!(%destination, "no route");
            return false;
        };

        header.ttl = route.ttl;

        let mut accepted = true;

        for (offset, chunk) in fragments(payload, self.config.fragment_size) {
            header.offset = offset;
            let packet = header.encode(chunk);

            accepted &= ctx.send_frame(route.link, route.mac, &packet);
        }

        accepted
    }

    /// Handles a packet received from `source` over `link`.
    pub fn handle_packet(
        &mut self,
        ctx: &mut impl HostContext,
        link: LinkId,
        source: MacAddress,
        packet: &[u8],
        now_ms: u64,
    ) {
        if !self.links.contains(&link) {
            return;
        }

        let (header, payload) = match PacketHeader::decode(packet) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(%link, %source, %err, "dropping malformed packet");
                return;
            }
        };

        match header.protocol {
            Protocol::DiscoveryRequest => {
                let reply = PacketHeader {
                    protocol: Protocol::DiscoveryReply,
                    ttl: 0,
                    id: header.id,
                    total_length: payload.len() as u16,
                    offset: 0,
                    source: self.local,
                    destination: header.source,
                };

                ctx.send_frame(link, source, &reply.encode(payload));
            }
            Protocol::DiscoveryReply => {
                self.handle_discovery_reply(link, source, &header, payload, now_ms);
            }
            Protocol::Advertisement => {
                self.handle_advertisement(ctx, link, source, &header, packet, payload, now_ms);
            }
            Protocol::Transport => {
                self.handle_transport(ctx, link, source, header, packet, payload, now_ms);
            }
        }
    }

    fn handle_discovery_reply(
        &mut self,
        link: LinkId,
        source: MacAddress,
        header: &PacketHeader,
        payload: &[u8],
        now_ms: u64,
    ) {
        if header.destination != self.local {
            return;
        }

        let Ok(stamp) = <[u8; 8]>::try_from(payload) else {
            trace!(%link, %source, "malformed discovery reply");
            return;
        };

        let sent_ms = u64::from_be_bytes(stamp);
        let delay_ms = now_ms.saturating_sub(sent_ms).max(1);
        let expiry_ms = now_ms + self.config.neighbor_timeout_ms;

        if self
            .neighbors
            .update(header.source, source, link, delay_ms, expiry_ms)
        {
            info!(%link, neighbor = %header.source, mac = %source, delay_ms, "neighbor discovered");
        }

        self.paths_dirty = true;
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_advertisement(
        &mut self,
        ctx: &mut impl HostContext,
        link: LinkId,
        source: MacAddress,
        header: &PacketHeader,
        packet: &[u8],
        payload: &[u8],
        now_ms: u64,
    ) {
        if header.source == self.local {
            return;
        }

        let advertisement = match Advertisement::decode(payload) {
            Ok(advertisement) => advertisement,
            Err(err) => {
                debug!(%link, %source, %err, "dropping malformed advertisement");
                return;
            }
        };

        let sequence = advertisement.sequence;
        let expiry_ms = now_ms + self.config.topology_timeout_ms;

        if !self.topology.apply(header.source, advertisement, expiry_ms) {
            trace!(origin = %header.source, sequence, "stale advertisement");
            return;
        }

        trace!(origin = %header.source, sequence, "advertisement applied");

        self.topology.purge(now_ms);
        self.topology.rebuild_tree();
        self.paths_dirty = true;

        for (out_link, mac) in self.tree_targets(Some((link, source))) {
            ctx.send_frame(out_link, mac, packet);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_transport(
        &mut self,
        ctx: &mut impl HostContext,
        link: LinkId,
        source: MacAddress,
        header: PacketHeader,
        packet: &[u8],
        payload: &[u8],
        now_ms: u64,
    ) {
        if header.destination == BROADCAST_IP {
            if header.source == self.local {
                return;
            }

            if header.ttl > 0 {
                let mut relayed = packet.to_vec();
                relayed[TTL_OFFSET] = header.ttl - 1;

                for (out_link, mac) in self.tree_targets(Some((link, source))) {
                    ctx.send_frame(out_link, mac, &relayed);
                }
            }

            self.reassemble(ctx, &header, payload, now_ms);
            return;
        }

        if header.destination == self.local {
            self.reassemble(ctx, &header, payload, now_ms);
            return;
        }

        if header.ttl == 0 {
            trace!(destination = %header.destination, "ttl expired");
            return;
        }

        self.purge(now_ms);

        let Some(route) = self.route(header.destination, Some((link, source))) else {
            debug!(destination = %header.destination, "no route for relayed packet");
            return;
        };

        let mut relayed = packet.to_vec();
        relayed[TTL_OFFSET] = header.ttl - 1;

        trace!(
            destination = %header.destination,
            next_hop = %route.mac,
            "relaying packet"
        );

        ctx.send_frame(route.link, route.mac, &relayed);
    }

    fn reassemble(
        &mut self,
        ctx: &mut impl HostContext,
        header: &PacketHeader,
        payload: &[u8],
        now_ms: u64,
    ) {
        let total_length = header.total_length as usize;
        let offset = header.offset as usize;

        if offset == 0 && payload.len() == total_length {
            ctx.on_receive(header.source, payload.into());
            return;
        }

        let key = (header.source, header.id);
        let timer_id = self.allocate_timer(TimerKind::Reassembly(header.source, header.id));

        let complete = match self.reassembly.get_mut(&key) {
            Some(entry) => {
                entry.fragment.add(total_length, offset, payload);
                entry.timer_id = timer_id;
                entry.fragment.is_complete()
            }
            None => {
                let fragment = Fragment::new(total_length, offset, payload);
                let complete = fragment.is_complete();
                self.reassembly
                    .insert(key, Reassembly { fragment, timer_id });
                complete
            }
        };

        if complete {
            if let Some(entry) = self.reassembly.remove(&key) {
                ctx.on_receive(header.source, entry.fragment.into_data());
            }
            self.timers.remove(&timer_id);
        } else {
            ctx.set_timer(timer_id, now_ms + self.config.reassembly_timeout_ms);
        }
    }

    /// Handles a timer previously requested through [`HostContext::set_timer`].
    pub fn handle_timer(&mut self, ctx: &mut impl HostContext, timer_id: u64, now_ms: u64) {
        let Some(kind) = self.timers.remove(&timer_id) else {
            return;
        };

        match kind {
            TimerKind::Discovery(link) => {
                if self.discovery_timers.get(&link) != Some(&timer_id) {
                    return;
                }

                let request = PacketHeader {
                    protocol: Protocol::DiscoveryRequest,
                    ttl: 0,
                    id: 0,
                    total_length: 8,
                    offset: 0,
                    source: self.local,
                    destination: BROADCAST_IP,
                };

                ctx.send_frame(
                    link,
                    MacAddress::BROADCAST,
                    &request.encode(&now_ms.to_be_bytes()),
                );

                let timer_id = self.allocate_timer(TimerKind::Discovery(link));
                self.discovery_timers.insert(link, timer_id);
                ctx.set_timer(timer_id, now_ms + self.config.discovery_interval_ms);
            }
            TimerKind::Advertisement => {
                if self.advertisement_timer != Some(timer_id) {
                    return;
                }

                self.advertise(ctx, now_ms);

                let timer_id = self.allocate_timer(TimerKind::Advertisement);
                self.advertisement_timer = Some(timer_id);
                ctx.set_timer(timer_id, now_ms + self.config.advertisement_interval_ms);
            }
            TimerKind::Reassembly(source, id) => {
                let key = (source, id);

                if self.reassembly.get(&key).map(|entry| entry.timer_id) == Some(timer_id) {
                    debug!(%source, id, "abandoning incomplete packet");
                    self.reassembly.remove(&key);
                }
            }
        }
    }

    fn advertise(&mut self, ctx: &mut impl HostContext, now_ms: u64) {
        self.purge(now_ms);

        self.advertisement_sequence += 1;

        let mut neighbors: Vec<(Ipv4Addr, u32)> = self
            .neighbors
            .iter()
            .map(|(address, entry)| (address, entry.delay_ms.min(u32::MAX as u64) as u32))
            .collect();
        neighbors.sort();

        let advertisement = Advertisement {
            sequence: self.advertisement_sequence,
            neighbors,
        };

        let payload = advertisement.encode();

        self.topology.apply(
            self.local,
            advertisement,
            now_ms + self.config.topology_timeout_ms,
        );
        self.topology.rebuild_tree();
        self.paths_dirty = true;

        let header = PacketHeader {
            protocol: Protocol::Advertisement,
            ttl: 0,
            id: 0,
            total_length: payload.len() as u16,
            offset: 0,
            source: self.local,
            destination: BROADCAST_IP,
        };

        let packet = header.encode(&payload);

        for (link, mac) in self.tree_targets(None) {
            ctx.send_frame(link, mac, &packet);
        }
    }

    // Evicts expired neighbors and topology records
    fn purge(&mut self, now_ms: u64) {
        let expired = self.neighbors.purge(now_ms);

        if !expired.is_empty() {
            debug!(?expired, "neighbors expired");
            self.paths_dirty = true;
        }

        if self.topology.purge(now_ms) {
            self.topology.rebuild_tree();
            self.paths_dirty = true;
        }
    }

    fn refresh_paths(&mut self) {
        if !self.paths_dirty {
            return;
        }

        self.paths_dirty = false;

        let direct: HashSet<Ipv4Addr> = self.neighbors.addresses().into_iter().collect();
        let topology = &self.topology;

        for (address, entry) in self.neighbors.iter_mut() {
            let mut sinks = direct.clone();
            sinks.remove(&address);

            entry.paths = topology.shortest_paths(address, entry.delay_ms, &sinks);
        }
    }

    /// Link and link address of every spanning tree neighbor, except `exclude`.
    fn tree_targets(&self, exclude: Option<(LinkId, MacAddress)>) -> Vec<(LinkId, MacAddress)> {
        self.topology
            .tree_neighbors()
            .iter()
            .filter_map(|&address| self.neighbors.get(address))
            .map(|entry| (entry.link, entry.mac))
            .filter(|&target| Some(target) != exclude)
            .collect()
    }

    /// Picks the next hop toward `destination`, avoiding `arrival` unless it is the only choice.
    fn route(
        &mut self,
        destination: Ipv4Addr,
        arrival: Option<(LinkId, MacAddress)>,
    ) -> Option<Route> {
        if let Some(entry) = self.neighbors.get(destination) {
            return Some(Route {
                link: entry.link,
                mac: entry.mac,
                ttl: 0,
            });
        }

        self.refresh_paths();

        let mut candidates: Vec<(LinkId, MacAddress, u64, u32)> = self
            .neighbors
            .iter()
            .filter_map(|(_, entry)| {
                entry
                    .paths
                    .get(&destination)
                    .map(|path| (entry.link, entry.mac, path.delay_ms.max(1), path.hops))
            })
            .collect();

        if candidates.len() > 1 {
            if let Some(arrival) = arrival {
                candidates.retain(|&(link, mac, _, _)| (link, mac) != arrival);
            }
        }

        if candidates.is_empty() {
            return None;
        }

        // Stable order keeps seeded runs reproducible
        candidates.sort_by_key(|&(link, mac, _, _)| (link, mac));

        let max_delay = candidates.iter().map(|c| c.2).max().unwrap_or(1) as f64;
        let weights: Vec<f64> = candidates
            .iter()
            .map(|&(_, _, delay, _)| max_delay / delay as f64)
            .collect();

        let index = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => 0,
        };

        let (link, mac, _, hops) = candidates[index];
        let ttl = ((3 * hops + 1) / 2).min(u8::MAX as u32) as u8;

        Some(Route { link, mac, ttl })
    }

    fn allocate_timer(&mut self, kind: TimerKind) -> u64 {
        let timer_id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.insert(timer_id, kind);
        timer_id
    }

    /// Addresses of current neighbors.
    pub fn neighbors(&self) -> Vec<Ipv4Addr> {
        let mut addresses = self.neighbors.addresses();
        addresses.sort();
        addresses
    }

    /// Number of nodes with a live topology record, this one included.
    pub fn known_nodes(&self) -> usize {
        self.topology.node_count()
    }

    /// Spanning tree neighbors of this node.
    pub fn tree_neighbors(&self) -> Vec<Ipv4Addr> {
        self.topology.tree_neighbors().iter().copied().collect()
    }

    /// Edges of this node's current broadcast spanning tree.
    pub fn tree_edges(&self) -> &[topology::Edge] {
        self.topology.tree()
    }

    /// Returns true if a unicast to `destination` currently has somewhere to go.
    pub fn has_route(&mut self, destination: Ipv4Addr) -> bool {
        if destination == self.local || self.neighbors.contains(destination) {
            return true;
        }

        self.refresh_paths();

        self.neighbors
            .iter()
            .any(|(_, entry)| entry.paths.contains_key(&destination))
    }
}

// Splits a payload into fragments tagged with their offsets. An empty payload still yields one
// empty fragment.
fn fragments(payload: &[u8], fragment_size: usize) -> Vec<(u16, &[u8])> {
    if payload.is_empty() {
        return vec![(0, payload)];
    }

    payload
        .chunks(fragment_size)
        .enumerate()
        .map(|(i, chunk)| ((i * fragment_size) as u16, chunk))
        .collect()
}
