//! MAC sublayer framing.
//!
//! A frame on the wire is laid out as
//!
//! ```text
//! destination (6) | source (6) | length (2) | payload, zero padded to 46 | CRC-32 (4)
//! ```
//!
//! with every field big-endian. The CRC uses the IEEE polynomial 0x04C11DB7 and covers every
//! preceding byte of the frame. Wires are plain byte streams, so [`FrameDecoder`] is responsible
//! for finding frame boundaries again after a collision garbles part of the stream.

use tracing::trace;

use crate::addr::MacAddress;
use crate::serial;
use crate::{Error, Result};

/// Largest payload a single frame may carry.
pub const MAX_DATA_LENGTH: usize = 1500;
/// Payloads shorter than this are padded with zeros on the wire.
pub const MIN_DATA_LENGTH: usize = 46;

const HEADER_SIZE: usize = 6 + 6 + 2;
const CRC_SIZE: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacFrame {
    pub destination: MacAddress,
    pub source: MacAddress,
    pub payload: Box<[u8]>,
}

fn wire_size(data_length: usize) -> usize {
    HEADER_SIZE + data_length.max(MIN_DATA_LENGTH) + CRC_SIZE
}

/// Serializes a frame. Panics if the payload exceeds [`MAX_DATA_LENGTH`]; the link layer refuses
/// such payloads before they get here.
pub fn encode(destination: MacAddress, source: MacAddress, payload: &[u8]) -> Box<[u8]> {
    assert!(payload.len() <= MAX_DATA_LENGTH, "frame payload too large");

    let size = wire_size(payload.len());
    let mut writer = serial::Writer::with_capacity(size);

    writer.write_bytes(&destination.to_bytes());
    writer.write_bytes(&source.to_bytes());
    writer.write_u16(payload.len() as u16);
    writer.write_bytes(payload);

    for _ in payload.len()..MIN_DATA_LENGTH {
        writer.write_u8(0);
    }

    let crc = crc32fast::hash(writer.as_slice());
    writer.write_u32(crc);

    debug_assert_eq!(writer.bytes_written(), size);

    writer.finish()
}

/// Parses exactly one frame from the start of `bytes`, returning it with the number of bytes it
/// occupied.
pub fn decode(bytes: &[u8]) -> Result<(MacFrame, usize)> {
    let mut reader = serial::Reader::new(bytes);

    let destination = reader
        .read_array::<6>()
        .ok_or(Error::Truncated("frame header"))?;
    let source = reader
        .read_array::<6>()
        .ok_or(Error::Truncated("frame header"))?;
    let data_length = reader
        .read_u16()
        .ok_or(Error::Truncated("frame header"))? as usize;

    if data_length > MAX_DATA_LENGTH {
        return Err(Error::FrameLength(data_length));
    }

    let size = wire_size(data_length);

    if bytes.len() < size {
        return Err(Error::Truncated("frame body"));
    }

    let (covered, crc_bytes) = bytes[..size].split_at(size - CRC_SIZE);
    let crc = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

    if crc32fast::hash(covered) != crc {
        return Err(Error::FrameChecksum);
    }

    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + data_length];

    let frame = MacFrame {
        destination: MacAddress::from_bytes(destination),
        source: MacAddress::from_bytes(source),
        payload: payload.into(),
    };

    Ok((frame, size))
}

/// Reassembles frames from an unframed byte stream.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next intact frame in the stream, if one has been received in full. When the
    /// front of the stream does not decode, the first intact frame further along is taken instead,
    /// and everything ahead of it discarded.
    pub fn next_frame(&mut self) -> Option<MacFrame> {
        loop {
            let err = match decode(&self.buffer) {
                Ok((frame, size)) => {
                    self.buffer.drain(..size);
                    return Some(frame);
                }
                Err(err) => err,
            };

            // A damaged length field can make garbage look like the start of a long frame, so
            // even a truncated front does not stop the search
            let next = (1..self.buffer.len()).find(|&start| decode(&self.buffer[start..]).is_ok());

            match next {
                Some(start) => {
                    trace!(%err, skipped = start, "resynchronized frame stream");
                    self.buffer.drain(..start);
                }
                None => {
                    if !matches!(err, Error::Truncated(_)) {
                        self.buffer.drain(..1);
                    }
                    return None;
                }
            }
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
