use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use super::Error;

/// Network-layer broadcast destination.
pub const BROADCAST_IP: Ipv4Addr = Ipv4Addr::BROADCAST;

/// A 48-bit link-layer address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(u64);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress(0xFFFF_FFFF_FFFF);

    const MASK: u64 = 0xFFFF_FFFF_FFFF;

    pub fn new(value: u64) -> Self {
        Self(value & Self::MASK)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    pub fn to_bytes(self) -> [u8; 6] {
        let b = self.0.to_be_bytes();
        [b[2], b[3], b[4], b[5], b[6], b[7]]
    }

    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        let mut b = [0u8; 8];
        b[2..].copy_from_slice(&bytes);
        Self(u64::from_be_bytes(b))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Parses twelve hex digits, optionally separated by `-` or `:`.
impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|&c| c != ':' && c != '-').collect();

        if digits.len() != 12 {
            return Err(Error::InvalidAddress(s.to_string()));
        }

        u64::from_str_radix(&digits, 16)
            .map(Self)
            .map_err(|_| Error::InvalidAddress(s.to_string()))
    }
}
