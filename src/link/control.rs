// Link frame control byte: kind (2 bits) | seq (3 bits) | ack (3 bits)

pub const SEQ_MODULUS: u8 = 8;

pub const HANDSHAKE_REQUEST: u8 = 0;
pub const HANDSHAKE_REPLY_NEW: u8 = 1;
pub const HANDSHAKE_REPLY_REPEAT: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Handshake,
    Data,
    Broadcast,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Control {
    pub kind: FrameKind,
    pub seq: u8,
    pub ack: u8,
}

pub fn next_seq(seq: u8) -> u8 {
    (seq + 1) % SEQ_MODULUS
}

impl Control {
    pub fn handshake(phase: u8) -> Self {
        Self {
            kind: FrameKind::Handshake,
            seq: phase,
            ack: 0,
        }
    }

    pub fn data(seq: u8, ack: u8) -> Self {
        Self {
            kind: FrameKind::Data,
            seq,
            ack,
        }
    }

    pub fn broadcast() -> Self {
        Self {
            kind: FrameKind::Broadcast,
            seq: 0,
            ack: 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        debug_assert!(self.seq < SEQ_MODULUS && self.ack < SEQ_MODULUS);

        let kind = match self.kind {
            FrameKind::Handshake => 0,
            FrameKind::Data => 1,
            FrameKind::Broadcast => 2,
        };

        (kind << 6) | (self.seq << 3) | self.ack
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        let kind = match byte >> 6 {
            0 => FrameKind::Handshake,
            1 => FrameKind::Data,
            2 => FrameKind::Broadcast,
            _ => return None,
        };

        Some(Self {
            kind,
            seq: (byte >> 3) & 0x07,
            ack: byte & 0x07,
        })
    }
}
