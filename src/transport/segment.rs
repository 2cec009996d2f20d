use crate::serial;
use crate::{Error, Result};

pub const HEADER_SIZE: usize = 16;

const CHECKSUM_OFFSET: usize = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Data,
    Syn,
    SynAck,
    Reject,
    Fin,
}

impl SegmentKind {
    fn to_u8(self) -> u8 {
        match self {
            SegmentKind::Data => 0,
            SegmentKind::Syn => 1,
            SegmentKind::SynAck => 2,
            SegmentKind::Reject => 3,
            SegmentKind::Fin => 4,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SegmentKind::Data),
            1 => Some(SegmentKind::Syn),
            2 => Some(SegmentKind::SynAck),
            3 => Some(SegmentKind::Reject),
            4 => Some(SegmentKind::Fin),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub syn: u32,
    pub ack: u32,
    pub window: u16,
    pub kind: SegmentKind,
}

/// One's complement sum of every byte, folded to 8 bits and inverted. A segment carrying a
/// correct checksum sums to zero.
pub fn checksum(bytes: &[u8]) -> u8 {
    let mut sum: u64 = bytes.iter().map(|&b| b as u64).sum();

    while sum > 0xff {
        sum = (sum & 0xff) + (sum >> 8);
    }

    !(sum as u8)
}

impl SegmentHeader {
    /// Serializes the header followed by `payload`, filling in the checksum.
    pub fn encode(&self, payload: &[u8]) -> Box<[u8]> {
        let mut writer = serial::Writer::with_capacity(HEADER_SIZE + payload.len());

        writer.write_u16(self.source_port);
        writer.write_u16(self.destination_port);
        writer.write_u32(self.syn);
        writer.write_u32(self.ack);
        writer.write_u16(self.window);
        writer.write_u8(self.kind.to_u8());
        writer.write_u8(0);
        writer.write_bytes(payload);

        let sum = checksum(writer.as_slice());
        writer.as_mut_slice()[CHECKSUM_OFFSET] = sum;

        writer.finish()
    }

    /// Splits a segment into its header and payload, verifying the checksum.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8])> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Truncated("segment header"));
        }

        if checksum(bytes) != 0 {
            return Err(Error::SegmentChecksum);
        }

        let mut reader = serial::Reader::new(bytes);

        let source_port = reader.read_u16().ok_or(Error::Truncated("segment header"))?;
        let destination_port = reader.read_u16().ok_or(Error::Truncated("segment header"))?;
        let syn = reader.read_u32().ok_or(Error::Truncated("segment header"))?;
        let ack = reader.read_u32().ok_or(Error::Truncated("segment header"))?;
        let window = reader.read_u16().ok_or(Error::Truncated("segment header"))?;
        let kind_id = reader.read_u8().ok_or(Error::Truncated("segment header"))?;
        let _checksum = reader.read_u8().ok_or(Error::Truncated("segment header"))?;

        let kind = SegmentKind::from_u8(kind_id).ok_or(Error::UnknownSegmentType(kind_id))?;

        let header = Self {
            source_port,
            destination_port,
            syn,
            ack,
            window,
            kind,
        };

        Ok((header, reader.remaining_bytes()))
    }

    /// Builds the REJECT answering `self`: ports swapped, acknowledging its `syn`.
    pub fn reject(&self) -> Self {
        Self {
            source_port: self.destination_port,
            destination_port: self.source_port,
            syn: 0,
            ack: self.syn.wrapping_add(1),
            window: 0,
            kind: SegmentKind::Reject,
        }
    }
}
