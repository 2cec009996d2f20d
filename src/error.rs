use thiserror::Error;

/// Errors produced by the wire codecs and the application client.
#[derive(Error, Debug)]
pub enum Error {
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("frame checksum mismatch")]
    FrameChecksum,
    #[error("invalid frame length: {0}")]
    FrameLength(usize),
    #[error("unknown packet protocol: {0}")]
    UnknownProtocol(u8),
    #[error("segment checksum mismatch")]
    SegmentChecksum,
    #[error("unknown segment type: {0}")]
    UnknownSegmentType(u8),
    #[error("unknown request opcode: {0}")]
    UnknownOpcode(u8),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("request rejected by node")]
    Rejected,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
