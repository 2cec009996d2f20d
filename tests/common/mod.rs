//! Several nodes joined by in-memory wires, driven in virtual time.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use wirestack::link::LinkId;
use wirestack::node::{self, Output};
use wirestack::transport::service::Request;
use wirestack::transport::AppId;
use wirestack::{MacAddress, Node};

pub struct Accepted {
    pub socket: i32,
    pub address: Ipv4Addr,
    pub port: u16,
}

pub struct Network {
    pub nodes: Vec<Node>,
    // Attachments of each wire
    wires: Vec<Vec<(usize, LinkId)>>,
    // Wire behind each (node, link)
    attachments: HashMap<(usize, LinkId), usize>,
    next_link: Vec<u32>,
    responses: HashMap<(usize, AppId), VecDeque<u8>>,
    pub now_ms: u64,
    rng: StdRng,
    // Probability of losing a frame, and of flipping one bit of it
    pub loss: f64,
    pub corruption: f64,
    pub frames_sent: usize,
}

impl Network {
    pub fn new(count: usize, seed: u64) -> Self {
        Self::with_config(count, node::Config::default(), seed)
    }

    pub fn with_config(count: usize, config: node::Config, seed: u64) -> Self {
        let nodes = (0..count)
            .map(|i| {
                Node::new(
                    config.clone(),
                    MacAddress::new(0x02_00_00_00_00_01 + i as u64),
                    Self::address_of(i),
                    seed.wrapping_add(i as u64),
                )
            })
            .collect();

        Self {
            nodes,
            wires: Vec::new(),
            attachments: HashMap::new(),
            next_link: vec![0; count],
            responses: HashMap::new(),
            now_ms: 0,
            rng: StdRng::seed_from_u64(seed),
            loss: 0.0,
            corruption: 0.0,
            frames_sent: 0,
        }
    }

    pub fn address_of(index: usize) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, index as u8 + 1)
    }

    /// Joins the given nodes with a new wire, returning its index.
    pub fn add_wire(&mut self, members: &[usize]) -> usize {
        let wire = self.wires.len();
        let mut attached = Vec::new();

        for &index in members {
            let link = LinkId(self.next_link[index]);
            self.next_link[index] += 1;

            self.attachments.insert((index, link), wire);
            attached.push((index, link));

            self.nodes[index].add_link(link, self.now_ms);
        }

        self.wires.push(attached);
        self.flush();

        wire
    }

    /// Unplugs every node from a wire.
    pub fn cut_wire(&mut self, wire: usize) {
        for (index, link) in std::mem::take(&mut self.wires[wire]) {
            self.attachments.remove(&(index, link));
            self.nodes[index].remove_link(link);
        }
    }

    pub fn add_app(&mut self, index: usize, app: AppId) {
        self.nodes[index].add_app(app);
    }

    pub fn request(&mut self, index: usize, app: AppId, request: Request) {
        self.nodes[index]
            .handle_app_bytes(app, &request.encode(), self.now_ms)
            .unwrap();
        self.flush();
    }

    // Delivers every pending output, repeating until the nodes fall quiet
    fn flush(&mut self) {
        loop {
            let mut delivered = false;

            for index in 0..self.nodes.len() {
                while let Some(output) = self.nodes[index].poll_output() {
                    delivered = true;

                    match output {
                        Output::Wire { link, bytes } => self.transmit(index, link, bytes),
                        Output::App { app, bytes } => self
                            .responses
                            .entry((index, app))
                            .or_default()
                            .extend(bytes.iter()),
                    }
                }
            }

            if !delivered {
                return;
            }
        }
    }

    fn transmit(&mut self, index: usize, link: LinkId, mut bytes: Box<[u8]>) {
        let Some(&wire) = self.attachments.get(&(index, link)) else {
            return;
        };

        self.frames_sent += 1;

        if self.rng.gen_bool(self.loss) {
            return;
        }

        if self.rng.gen_bool(self.corruption) {
            let at = self.rng.gen_range(0..bytes.len());
            bytes[at] ^= 1 << self.rng.gen_range(0..8);
        }

        let now_ms = self.now_ms;

        for &(other, other_link) in self.wires[wire].iter() {
            if other != index {
                self.nodes[other].handle_wire_bytes(other_link, &bytes, now_ms);
            }
        }
    }

    pub fn run_for(&mut self, duration_ms: u64) {
        let end_ms = self.now_ms + duration_ms;
        self.run_until(end_ms, |_| false);
        self.now_ms = end_ms;
    }

    /// Runs until `done` holds or `deadline_ms` passes. Returns true if `done` held.
    pub fn run_until<F>(&mut self, deadline_ms: u64, mut done: F) -> bool
    where
        F: FnMut(&mut Self) -> bool,
    {
        loop {
            self.flush();

            if done(self) {
                return true;
            }

            let next_ms = self
                .nodes
                .iter()
                .filter_map(|node| node.next_timer_time_ms())
                .min();

            match next_ms {
                Some(time_ms) if time_ms <= deadline_ms => {
                    self.now_ms = self.now_ms.max(time_ms);

                    for node in self.nodes.iter_mut() {
                        node.handle_timers(self.now_ms);
                    }
                }
                _ => return false,
            }
        }
    }

    /// Runs until every node knows a route to every other node.
    pub fn converge(&mut self, deadline_ms: u64) {
        let converged = self.run_until(deadline_ms, |network| {
            let count = network.nodes.len();

            (0..count).all(|i| {
                (0..count).all(|j| i == j || network.nodes[i].has_route(Self::address_of(j)))
            })
        });

        assert!(converged, "routes did not converge by {}ms", deadline_ms);
    }

    fn take(&mut self, index: usize, app: AppId, count: usize) -> Option<Vec<u8>> {
        let queue = self.responses.get_mut(&(index, app))?;

        if queue.len() < count {
            return None;
        }

        Some(queue.drain(..count).collect())
    }

    pub fn pending_response_bytes(&self, index: usize, app: AppId) -> usize {
        self.responses
            .get(&(index, app))
            .map_or(0, |queue| queue.len())
    }

    pub fn take_bool(&mut self, index: usize, app: AppId) -> Option<bool> {
        self.take(index, app, 1).map(|bytes| bytes[0] != 0)
    }

    pub fn take_int(&mut self, index: usize, app: AppId) -> Option<i32> {
        self.take(index, app, 4)
            .map(|bytes| i32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn take_accept(&mut self, index: usize, app: AppId) -> Option<Accepted> {
        self.take(index, app, 10).map(|bytes| Accepted {
            socket: i32::from_be_bytes(bytes[..4].try_into().unwrap()),
            address: Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]),
            port: u16::from_be_bytes([bytes[8], bytes[9]]),
        })
    }

    /// Takes one recv response; `None` in the result stands for the -1 failure reply.
    pub fn take_recv(&mut self, index: usize, app: AppId) -> Option<Option<Vec<u8>>> {
        let queue = self.responses.get(&(index, app))?;

        if queue.len() < 4 {
            return None;
        }

        let header: Vec<u8> = queue.iter().take(4).copied().collect();
        let length = u32::from_be_bytes(header.try_into().unwrap());

        if length == u32::MAX {
            self.take(index, app, 4);
            return Some(None);
        }

        if queue.len() < 4 + length as usize {
            return None;
        }

        let bytes = self.take(index, app, 4 + length as usize)?;

        Some(Some(bytes[4..].to_vec()))
    }

    /// Accepts on a listening port of one node while another connects to it, returning the
    /// client's socket and the accepted connection.
    pub fn open(
        &mut self,
        (server, server_app): (usize, AppId),
        (client, client_app): (usize, AppId),
        port: u16,
        deadline_ms: u64,
    ) -> (i32, Accepted) {
        self.request(server, server_app, Request::Listen { port });
        assert_eq!(self.take_bool(server, server_app), Some(true));

        self.request(server, server_app, Request::Accept { port });
        self.request(
            client,
            client_app,
            Request::Connect {
                address: Self::address_of(server),
                port,
            },
        );

        let connected = self.run_until(deadline_ms, |network| {
            network.pending_response_bytes(client, client_app) >= 4
                && network.pending_response_bytes(server, server_app) >= 10
        });
        assert!(connected, "connection not established by {}ms", deadline_ms);

        let socket = self.take_int(client, client_app).unwrap();
        assert!(socket > 0);

        let accepted = self.take_accept(server, server_app).unwrap();
        assert!(accepted.socket > 0);
        assert_eq!(accepted.address, Self::address_of(client));

        (socket, accepted)
    }

    /// Issues recv requests until `length` bytes have arrived or the peer closes.
    pub fn recv_exact(
        &mut self,
        index: usize,
        app: AppId,
        socket: i32,
        length: usize,
        deadline_ms: u64,
    ) -> Vec<u8> {
        let mut data = Vec::new();

        while data.len() < length {
            self.request(
                index,
                app,
                Request::Recv {
                    socket,
                    length: u16::MAX,
                },
            );

            let mut chunk = None;

            let arrived = self.run_until(deadline_ms, |network| {
                chunk = network.take_recv(index, app);
                chunk.is_some()
            });
            assert!(arrived, "recv not answered by {}ms, {} bytes in", deadline_ms, data.len());

            match chunk.flatten() {
                Some(bytes) if bytes.is_empty() => break,
                Some(bytes) => data.extend_from_slice(&bytes),
                None => panic!("recv failed"),
            }
        }

        data
    }
}
