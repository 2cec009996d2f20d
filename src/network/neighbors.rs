use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::addr::MacAddress;
use crate::link::LinkId;

/// Distance to some node when routing through a particular neighbor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Path {
    pub delay_ms: u64,
    pub hops: u32,
}

#[derive(Debug)]
pub struct Neighbor {
    pub mac: MacAddress,
    pub link: LinkId,
    pub delay_ms: u64,
    pub expiry_ms: u64,
    // Shortest paths to every reachable node, first hop fixed to this neighbor
    pub paths: HashMap<Ipv4Addr, Path>,
}

/// Directly reachable nodes, as measured by discovery.
#[derive(Default)]
pub struct NeighborTable {
    entries: HashMap<Ipv4Addr, Neighbor>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Records a discovery measurement, returning true if the neighbor was not known before.
    pub fn update(
        &mut self,
        address: Ipv4Addr,
        mac: MacAddress,
        link: LinkId,
        delay_ms: u64,
        expiry_ms: u64,
    ) -> bool {
        match self.entries.get_mut(&address) {
            Some(entry) => {
                entry.mac = mac;
                entry.link = link;
                entry.delay_ms = delay_ms;
                entry.expiry_ms = expiry_ms;
                false
            }
            None => {
                self.entries.insert(
                    address,
                    Neighbor {
                        mac,
                        link,
                        delay_ms,
                        expiry_ms,
                        paths: HashMap::new(),
                    },
                );
                true
            }
        }
    }

    /// Removes entries which have expired, returning their addresses.
    pub fn purge(&mut self, now_ms: u64) -> Vec<Ipv4Addr> {
        self.remove_where(|entry| entry.expiry_ms <= now_ms)
    }

    /// Removes every entry reached through `link`.
    pub fn remove_link(&mut self, link: LinkId) -> Vec<Ipv4Addr> {
        self.remove_where(|entry| entry.link == link)
    }

    /// Removes the entry with the given link address on `link`, if any.
    pub fn remove_mac(&mut self, link: LinkId, mac: MacAddress) -> Vec<Ipv4Addr> {
        self.remove_where(|entry| entry.link == link && entry.mac == mac)
    }

    fn remove_where(&mut self, pred: impl Fn(&Neighbor) -> bool) -> Vec<Ipv4Addr> {
        let removed: Vec<Ipv4Addr> = self
            .entries
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(&address, _)| address)
            .collect();

        for address in removed.iter() {
            self.entries.remove(address);
        }

        removed
    }

    pub fn get(&self, address: Ipv4Addr) -> Option<&Neighbor> {
        self.entries.get(&address)
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.entries.contains_key(&address)
    }

    pub fn find(&self, link: LinkId, mac: MacAddress) -> Option<Ipv4Addr> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.link == link && entry.mac == mac)
            .map(|(&address, _)| address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Ipv4Addr, &Neighbor)> {
        self.entries.iter().map(|(&address, entry)| (address, entry))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Ipv4Addr, &mut Neighbor)> {
        self.entries
            .iter_mut()
            .map(|(&address, entry)| (address, entry))
    }

    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
