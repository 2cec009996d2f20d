use std::net::Ipv4Addr;

use crate::serial;
use crate::{Error, Result};

pub const HEADER_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Transport,
    DiscoveryRequest,
    DiscoveryReply,
    Advertisement,
}

impl Protocol {
    fn to_u8(self) -> u8 {
        match self {
            Protocol::Transport => 0,
            Protocol::DiscoveryRequest => 1,
            Protocol::DiscoveryReply => 2,
            Protocol::Advertisement => 3,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Protocol::Transport),
            1 => Some(Protocol::DiscoveryRequest),
            2 => Some(Protocol::DiscoveryReply),
            3 => Some(Protocol::Advertisement),
            _ => None,
        }
    }
}

/// Network packet header. `total_length` is the length of the whole unfragmented payload;
/// `offset` is where this packet's payload sits within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub protocol: Protocol,
    pub ttl: u8,
    pub id: u16,
    pub total_length: u16,
    pub offset: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

/// Offset of the TTL field, rewritten in place by relays.
pub const TTL_OFFSET: usize = 1;

impl PacketHeader {
    pub fn encode(&self, payload: &[u8]) -> Box<[u8]> {
        let mut writer = serial::Writer::with_capacity(HEADER_SIZE + payload.len());

        writer.write_u8(self.protocol.to_u8());
        writer.write_u8(self.ttl);
        writer.write_u16(self.id);
        writer.write_u16(self.total_length);
        writer.write_u16(self.offset);
        writer.write_u32(self.source.into());
        writer.write_u32(self.destination.into());
        writer.write_bytes(payload);

        writer.finish()
    }

    /// Splits a packet into its header and payload.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8])> {
        let mut reader = serial::Reader::new(bytes);

        let protocol_id = reader.read_u8().ok_or(Error::Truncated("packet header"))?;
        let ttl = reader.read_u8().ok_or(Error::Truncated("packet header"))?;
        let id = reader.read_u16().ok_or(Error::Truncated("packet header"))?;
        let total_length = reader.read_u16().ok_or(Error::Truncated("packet header"))?;
        let offset = reader.read_u16().ok_or(Error::Truncated("packet header"))?;
        let source = reader.read_u32().ok_or(Error::Truncated("packet header"))?;
        let destination = reader.read_u32().ok_or(Error::Truncated("packet header"))?;

        let protocol = Protocol::from_u8(protocol_id).ok_or(Error::UnknownProtocol(protocol_id))?;

        let header = Self {
            protocol,
            ttl,
            id,
            total_length,
            offset,
            source: source.into(),
            destination: destination.into(),
        };

        Ok((header, reader.remaining_bytes()))
    }
}
