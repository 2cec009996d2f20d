use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::net::Ipv4Addr;

use super::neighbors::Path;
use crate::serial;
use crate::{Error, Result};

/// Link-state advertisement: the delays a node measured to each of its neighbors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    pub sequence: u32,
    pub neighbors: Vec<(Ipv4Addr, u32)>,
}

impl Advertisement {
    pub fn encode(&self) -> Box<[u8]> {
        let mut writer = serial::Writer::with_capacity(6 + self.neighbors.len() * 8);

        writer.write_u32(self.sequence);
        writer.write_u16(self.neighbors.len() as u16);

        for &(address, delay) in self.neighbors.iter() {
            writer.write_u32(address.into());
            writer.write_u32(delay);
        }

        writer.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = serial::Reader::new(bytes);

        let sequence = reader
            .read_u32()
            .ok_or(Error::Truncated("advertisement"))?;
        let count = reader
            .read_u16()
            .ok_or(Error::Truncated("advertisement"))?;

        let mut neighbors = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let address = reader
                .read_u32()
                .ok_or(Error::Truncated("advertisement entry"))?;
            let delay = reader
                .read_u32()
                .ok_or(Error::Truncated("advertisement entry"))?;

            neighbors.push((address.into(), delay));
        }

        Ok(Self {
            sequence,
            neighbors,
        })
    }
}

/// An undirected edge. Ordering is by delay, then by endpoint addresses, which is the order
/// Kruskal's algorithm considers edges in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub delay: u32,
    pub low: Ipv4Addr,
    pub high: Ipv4Addr,
}

impl Edge {
    pub fn new(a: Ipv4Addr, b: Ipv4Addr, delay: u32) -> Self {
        Self {
            delay,
            low: a.min(b),
            high: a.max(b),
        }
    }

    fn other(&self, end: Ipv4Addr) -> Option<Ipv4Addr> {
        if self.low == end {
            Some(self.high)
        } else if self.high == end {
            Some(self.low)
        } else {
            None
        }
    }
}

struct NodeRecord {
    sequence: u32,
    expiry_ms: u64,
    neighbors: Vec<(Ipv4Addr, u32)>,
}

struct UnionFind {
    parent: HashMap<Ipv4Addr, Ipv4Addr>,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: HashMap::new(),
        }
    }

    fn find(&mut self, node: Ipv4Addr) -> Ipv4Addr {
        let mut root = node;
        while let Some(&parent) = self.parent.get(&root) {
            if parent == root {
                break;
            }
            root = parent;
        }

        // Compress
        let mut cursor = node;
        while cursor != root {
            let next = self.parent.get(&cursor).copied().unwrap_or(root);
            self.parent.insert(cursor, root);
            cursor = next;
        }

        root
    }

    /// Joins the sets of `a` and `b`, returning false if they were already joined.
    fn union(&mut self, a: Ipv4Addr, b: Ipv4Addr) -> bool {
        let root_a = self.find(a);
        let root_b = self.find(b);

        if root_a == root_b {
            return false;
        }

        self.parent.insert(root_a, root_b);
        true
    }
}

/// Network-wide view assembled from link-state advertisements.
pub struct Topology {
    local: Ipv4Addr,
    records: HashMap<Ipv4Addr, NodeRecord>,
    // Spanning tree edges
    tree: Vec<Edge>,
    // Spanning tree neighbors of the local node
    tree_neighbors: BTreeSet<Ipv4Addr>,
}

impl Topology {
    pub fn new(local: Ipv4Addr) -> Self {
        Self {
            local,
            records: HashMap::new(),
            tree: Vec::new(),
            tree_neighbors: BTreeSet::new(),
        }
    }

    /// Applies an advertisement from `origin`, returning false if it is not newer than the one
    /// already held.
    pub fn apply(&mut self, origin: Ipv4Addr, advertisement: Advertisement, expiry_ms: u64) -> bool {
        if let Some(record) = self.records.get(&origin) {
            if advertisement.sequence <= record.sequence {
                return false;
            }
        }

        self.records.insert(
            origin,
            NodeRecord {
                sequence: advertisement.sequence,
                expiry_ms,
                neighbors: advertisement.neighbors,
            },
        );

        true
    }

    /// Evicts expired records, returning true if any were removed.
    pub fn purge(&mut self, now_ms: u64) -> bool {
        let before = self.records.len();
        self.records.retain(|_, record| record.expiry_ms > now_ms);
        self.records.len() != before
    }

    pub fn sequence(&self, origin: Ipv4Addr) -> Option<u32> {
        self.records.get(&origin).map(|record| record.sequence)
    }

    pub fn node_count(&self) -> usize {
        self.records.len()
    }

    /// Every advertised edge, sorted. An edge advertised by both of its ends takes the smaller
    /// delay.
    pub fn edges(&self) -> Vec<Edge> {
        let mut delays: HashMap<(Ipv4Addr, Ipv4Addr), u32> = HashMap::new();

        for (&origin, record) in self.records.iter() {
            for &(neighbor, delay) in record.neighbors.iter() {
                if neighbor == origin {
                    continue;
                }

                let edge = Edge::new(origin, neighbor, delay);

                delays
                    .entry((edge.low, edge.high))
                    .and_modify(|d| *d = (*d).min(delay))
                    .or_insert(delay);
            }
        }

        let mut edges: Vec<Edge> = delays
            .into_iter()
            .map(|((low, high), delay)| Edge { delay, low, high })
            .collect();

        edges.sort();
        edges
    }

    /// Recomputes the minimum spanning forest with Kruskal's algorithm.
    pub fn rebuild_tree(&mut self) {
        let mut sets = UnionFind::new();

        self.tree.clear();

        for edge in self.edges() {
            if sets.union(edge.low, edge.high) {
                self.tree.push(edge);
            }
        }

        let local = self.local;

        self.tree_neighbors = self
            .tree
            .iter()
            .filter_map(|edge| edge.other(local))
            .collect();
    }

    pub fn tree(&self) -> &[Edge] {
        &self.tree
    }

    pub fn tree_neighbors(&self) -> &BTreeSet<Ipv4Addr> {
        &self.tree_neighbors
    }

    /// Dijkstra from `first_hop`, a direct neighbor reached with `first_delay`. The local node is
    /// never entered, and nodes in `sinks` (the other direct neighbors) are reached but never
    /// relayed through.
    pub fn shortest_paths(
        &self,
        first_hop: Ipv4Addr,
        first_delay: u64,
        sinks: &HashSet<Ipv4Addr>,
    ) -> HashMap<Ipv4Addr, Path> {
        let mut adjacency: HashMap<Ipv4Addr, Vec<(Ipv4Addr, u32)>> = HashMap::new();

        for edge in self.edges() {
            adjacency
                .entry(edge.low)
                .or_default()
                .push((edge.high, edge.delay));
            adjacency
                .entry(edge.high)
                .or_default()
                .push((edge.low, edge.delay));
        }

        let mut paths: HashMap<Ipv4Addr, Path> = HashMap::new();
        let mut done: HashSet<Ipv4Addr> = HashSet::new();
        let mut heap = BinaryHeap::new();

        paths.insert(
            first_hop,
            Path {
                delay_ms: first_delay,
                hops: 1,
            },
        );
        heap.push(Reverse((first_delay, 1u32, first_hop)));

        while let Some(Reverse((delay_ms, hops, node))) = heap.pop() {
            if !done.insert(node) {
                continue;
            }

            if node != first_hop && sinks.contains(&node) {
                continue;
            }

            let Some(edges) = adjacency.get(&node) else {
                continue;
            };

            for &(next, edge_delay) in edges.iter() {
                if next == self.local || done.contains(&next) {
                    continue;
                }

                let candidate = Path {
                    delay_ms: delay_ms + edge_delay as u64,
                    hops: hops + 1,
                };

                let better = match paths.get(&next) {
                    Some(path) => {
                        (candidate.delay_ms, candidate.hops) < (path.delay_ms, path.hops)
                    }
                    None => true,
                };

                if better {
                    paths.insert(next, candidate);
                    heap.push(Reverse((candidate.delay_ms, candidate.hops, next)));
                }
            }
        }

        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::{Rng, SeedableRng};

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn advert(sequence: u32, neighbors: &[(u8, u32)]) -> Advertisement {
        Advertisement {
            sequence,
            neighbors: neighbors.iter().map(|&(n, d)| (ip(n), d)).collect(),
        }
    }

    // Applies one advertisement per node so that every edge is known from both ends
    fn topology_from_edges(local: u8, edges: &[(u8, u8, u32)]) -> Topology {
        let mut per_node: HashMap<u8, Vec<(u8, u32)>> = HashMap::new();
        for &(a, b, d) in edges {
            per_node.entry(a).or_default().push((b, d));
            per_node.entry(b).or_default().push((a, d));
        }

        let mut topology = Topology::new(ip(local));
        for (node, neighbors) in per_node {
            assert!(topology.apply(ip(node), advert(1, &neighbors), 1000));
        }
        topology
    }

    #[test]
    fn advertisement_codec() {
        let original = advert(77, &[(2, 10), (3, 4)]);
        let bytes = original.encode();
        assert_eq!(bytes.len(), 6 + 16);
        assert_eq!(Advertisement::decode(&bytes).unwrap(), original);
        assert!(Advertisement::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn stale_advertisements_are_ignored() {
        let mut topology = Topology::new(ip(1));

        assert!(topology.apply(ip(2), advert(5, &[(1, 3)]), 100));
        assert!(!topology.apply(ip(2), advert(5, &[(1, 9)]), 100));
        assert!(!topology.apply(ip(2), advert(4, &[(1, 9)]), 100));
        assert_eq!(topology.edges(), vec![Edge::new(ip(1), ip(2), 3)]);

        assert!(topology.apply(ip(2), advert(6, &[(1, 9)]), 100));
        assert_eq!(topology.sequence(ip(2)), Some(6));

        assert!(!topology.purge(99));
        assert!(topology.purge(100));
        assert_eq!(topology.node_count(), 0);
    }

    #[test]
    fn edges_take_smaller_delay() {
        let mut topology = Topology::new(ip(1));
        topology.apply(ip(1), advert(1, &[(2, 8)]), 100);
        topology.apply(ip(2), advert(1, &[(1, 5)]), 100);

        assert_eq!(topology.edges(), vec![Edge::new(ip(2), ip(1), 5)]);
    }

    #[test]
    fn kruskal_square_with_diagonal() {
        //  1 --1-- 2
        //  |     / |
        //  4   2   3
        //  | /     |
        //  3 --5-- 4
        let mut topology = topology_from_edges(
            1,
            &[(1, 2, 1), (2, 3, 2), (2, 4, 3), (1, 3, 4), (3, 4, 5)],
        );
        topology.rebuild_tree();

        let tree: BTreeSet<Edge> = topology.tree().iter().copied().collect();
        let expected: BTreeSet<Edge> = [
            Edge::new(ip(1), ip(2), 1),
            Edge::new(ip(2), ip(3), 2),
            Edge::new(ip(2), ip(4), 3),
        ]
        .into_iter()
        .collect();
        assert_eq!(tree, expected);
        assert_eq!(
            topology.tree_neighbors().iter().copied().collect::<Vec<_>>(),
            vec![ip(2)]
        );

        // A cheaper direct edge to 3 replaces 2-3
        topology.apply(ip(1), advert(2, &[(2, 1), (3, 1)]), 1000);
        topology.apply(ip(3), advert(2, &[(2, 2), (1, 1), (4, 5)]), 1000);
        topology.rebuild_tree();

        assert!(topology.tree().contains(&Edge::new(ip(1), ip(3), 1)));
        assert!(!topology.tree().contains(&Edge::new(ip(2), ip(3), 2)));
        assert_eq!(
            topology.tree_neighbors().iter().copied().collect::<Vec<_>>(),
            vec![ip(2), ip(3)]
        );
    }

    #[test]
    fn kruskal_ties_break_by_address() {
        let mut topology = topology_from_edges(1, &[(1, 2, 1), (2, 3, 1), (1, 3, 1)]);
        topology.rebuild_tree();

        assert_eq!(
            topology.tree(),
            &[Edge::new(ip(1), ip(2), 1), Edge::new(ip(1), ip(3), 1)]
        );
    }

    // Total weight of a minimum spanning forest, by Prim's algorithm from every component
    fn prim_weight(nodes: &[u8], edges: &[(u8, u8, u32)]) -> u64 {
        let mut visited: HashSet<u8> = HashSet::new();
        let mut total = 0;

        for &start in nodes {
            if !visited.insert(start) {
                continue;
            }
            loop {
                let best = edges
                    .iter()
                    .filter(|&&(a, b, _)| visited.contains(&a) != visited.contains(&b))
                    .min_by_key(|&&(_, _, d)| d);
                match best {
                    Some(&(a, b, d)) => {
                        visited.insert(a);
                        visited.insert(b);
                        total += d as u64;
                    }
                    None => break,
                }
            }
        }

        total
    }

    fn random_graph(rng: &mut impl Rng, nodes: u8) -> Vec<(u8, u8, u32)> {
        let mut edges = Vec::new();
        for a in 1..=nodes {
            for b in (a + 1)..=nodes {
                if rng.gen_bool(0.4) {
                    edges.push((a, b, rng.gen_range(1..20)));
                }
            }
        }
        edges
    }

    #[test]
    fn kruskal_matches_prim() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);

        for _ in 0..100 {
            let n = rng.gen_range(2..=10);
            let edges = random_graph(&mut rng, n);
            let nodes: Vec<u8> = edges.iter().flat_map(|&(a, b, _)| [a, b]).collect();

            let mut topology = topology_from_edges(1, &edges);
            topology.rebuild_tree();

            let weight: u64 = topology.tree().iter().map(|e| e.delay as u64).sum();
            assert_eq!(weight, prim_weight(&nodes, &edges));
        }
    }

    // Smallest delay of any simple path from `from` to `to` avoiding `local`, and never passing
    // through a sink
    fn brute_force(
        edges: &[(u8, u8, u32)],
        from: u8,
        to: u8,
        local: u8,
        sinks: &HashSet<u8>,
    ) -> Option<u64> {
        fn walk(
            edges: &[(u8, u8, u32)],
            at: u8,
            to: u8,
            local: u8,
            sinks: &HashSet<u8>,
            visited: &mut Vec<u8>,
            delay: u64,
            best: &mut Option<u64>,
        ) {
            if at == to {
                *best = Some(best.map_or(delay, |b| b.min(delay)));
                return;
            }
            if visited.len() > 1 && sinks.contains(&at) {
                return;
            }
            for &(a, b, d) in edges {
                let next = if a == at {
                    b
                } else if b == at {
                    a
                } else {
                    continue;
                };
                if next == local || visited.contains(&next) {
                    continue;
                }
                visited.push(next);
                walk(edges, next, to, local, sinks, visited, delay + d as u64, best);
                visited.pop();
            }
        }

        let mut best = None;
        walk(edges, from, to, local, sinks, &mut vec![from], 0, &mut best);
        best
    }

    #[test]
    fn dijkstra_matches_brute_force() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(23);

        for _ in 0..100 {
            let n = rng.gen_range(3..=9);
            let mut edges = random_graph(&mut rng, n);

            // Node 1 is local with at least one neighbor
            if !edges.iter().any(|&(a, _, _)| a == 1) {
                edges.push((1, 2, rng.gen_range(1..20)));
            }

            let topology = topology_from_edges(1, &edges);

            let direct: Vec<(u8, u32)> = edges
                .iter()
                .filter(|&&(a, _, _)| a == 1)
                .map(|&(_, b, d)| (b, d))
                .collect();

            for &(first, first_delay) in direct.iter() {
                let sinks: HashSet<u8> = direct
                    .iter()
                    .map(|&(b, _)| b)
                    .filter(|&b| b != first)
                    .collect();
                let sink_ips: HashSet<Ipv4Addr> = sinks.iter().map(|&b| ip(b)).collect();

                let paths = topology.shortest_paths(ip(first), first_delay as u64, &sink_ips);

                assert!(!paths.contains_key(&ip(1)));

                for target in 2..=n {
                    let expected = brute_force(&edges, first, target, 1, &sinks)
                        .map(|d| d + first_delay as u64);
                    let actual = paths.get(&ip(target)).map(|p| p.delay_ms);
                    assert_eq!(actual, expected, "first hop {} target {}", first, target);
                }
            }
        }
    }

    #[test]
    fn hop_counts() {
        // 1 - 2 - 3 - 4, with 1 local
        let topology = topology_from_edges(1, &[(1, 2, 1), (2, 3, 1), (3, 4, 1)]);
        let paths = topology.shortest_paths(ip(2), 1, &HashSet::new());

        assert_eq!(paths[&ip(2)], Path { delay_ms: 1, hops: 1 });
        assert_eq!(paths[&ip(4)], Path { delay_ms: 3, hops: 3 });
    }
}
