//! Application request/response encoding.
//!
//! Requests are a one byte opcode followed by fixed fields, all big-endian:
//!
//! ```text
//! 1 listen   port (2)
//! 2 accept   port (2)
//! 3 connect  address (4) | port (2)
//! 4 send     socket (4) | length (2) | data (length)
//! 5 recv     socket (4) | length (2)
//! 6 close    socket (4)
//! ```
//!
//! Each request is answered exactly once, possibly after a delay.

use std::net::Ipv4Addr;

use crate::serial;
use crate::{Error, Result};

pub const OP_LISTEN: u8 = 1;
pub const OP_ACCEPT: u8 = 2;
pub const OP_CONNECT: u8 = 3;
pub const OP_SEND: u8 = 4;
pub const OP_RECV: u8 = 5;
pub const OP_CLOSE: u8 = 6;

/// Size of an accept response.
pub const ACCEPT_RESPONSE_SIZE: usize = 4 + 4 + 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Listen { port: u16 },
    Accept { port: u16 },
    Connect { address: Ipv4Addr, port: u16 },
    Send { socket: i32, data: Box<[u8]> },
    Recv { socket: i32, length: u16 },
    Close { socket: i32 },
}

impl Request {
    pub fn encode(&self) -> Box<[u8]> {
        let mut writer = serial::Writer::new();

        match self {
            Request::Listen { port } => {
                writer.write_u8(OP_LISTEN);
                writer.write_u16(*port);
            }
            Request::Accept { port } => {
                writer.write_u8(OP_ACCEPT);
                writer.write_u16(*port);
            }
            Request::Connect { address, port } => {
                writer.write_u8(OP_CONNECT);
                writer.write_u32((*address).into());
                writer.write_u16(*port);
            }
            Request::Send { socket, data } => {
                assert!(data.len() <= u16::MAX as usize, "send request too large");
                writer.write_u8(OP_SEND);
                writer.write_u32(*socket as u32);
                writer.write_u16(data.len() as u16);
                writer.write_bytes(data);
            }
            Request::Recv { socket, length } => {
                writer.write_u8(OP_RECV);
                writer.write_u32(*socket as u32);
                writer.write_u16(*length);
            }
            Request::Close { socket } => {
                writer.write_u8(OP_CLOSE);
                writer.write_u32(*socket as u32);
            }
        }

        writer.finish()
    }

    /// Parses one request from the front of `bytes`. Returns `Ok(None)` if more bytes are needed,
    /// or the request and the number of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut reader = serial::Reader::new(bytes);

        let Some(opcode) = reader.read_u8() else {
            return Ok(None);
        };

        let request = match opcode {
            OP_LISTEN | OP_ACCEPT => {
                let Some(port) = reader.read_u16() else {
                    return Ok(None);
                };
                if opcode == OP_LISTEN {
                    Request::Listen { port }
                } else {
                    Request::Accept { port }
                }
            }
            OP_CONNECT => {
                let (Some(address), Some(port)) = (reader.read_u32(), reader.read_u16()) else {
                    return Ok(None);
                };
                Request::Connect {
                    address: address.into(),
                    port,
                }
            }
            OP_SEND => {
                let (Some(socket), Some(length)) = (reader.read_u32(), reader.read_u16()) else {
                    return Ok(None);
                };
                let Some(data) = reader.read_bytes(length as usize) else {
                    return Ok(None);
                };
                Request::Send {
                    socket: socket as i32,
                    data: data.into(),
                }
            }
            OP_RECV => {
                let (Some(socket), Some(length)) = (reader.read_u32(), reader.read_u16()) else {
                    return Ok(None);
                };
                Request::Recv {
                    socket: socket as i32,
                    length,
                }
            }
            OP_CLOSE => {
                let Some(socket) = reader.read_u32() else {
                    return Ok(None);
                };
                Request::Close {
                    socket: socket as i32,
                }
            }
            _ => return Err(Error::UnknownOpcode(opcode)),
        };

        Ok(Some((request, reader.bytes_read())))
    }
}

/// Buffers a request stream and yields whole requests.
#[derive(Default)]
pub struct RequestReader {
    buffer: Vec<u8>,
}

impl RequestReader {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_request(&mut self) -> Result<Option<Request>> {
        match Request::decode(&self.buffer)? {
            Some((request, size)) => {
                self.buffer.drain(..size);
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }
}

pub fn bool_response(value: bool) -> Box<[u8]> {
    Box::new([value as u8])
}

pub fn int_response(value: i32) -> Box<[u8]> {
    Box::new(value.to_be_bytes())
}

/// Socket, peer address and peer port of an accepted connection, or all ones on failure.
pub fn accept_response(accepted: Option<(i32, Ipv4Addr, u16)>) -> Box<[u8]> {
    match accepted {
        Some((socket, address, port)) => {
            let mut writer = serial::Writer::with_capacity(ACCEPT_RESPONSE_SIZE);
            writer.write_u32(socket as u32);
            writer.write_u32(address.into());
            writer.write_u16(port);
            writer.finish()
        }
        None => vec![0xff; ACCEPT_RESPONSE_SIZE].into_boxed_slice(),
    }
}

/// Length prefix followed by the received bytes.
pub fn recv_response(data: &[u8]) -> Box<[u8]> {
    let mut writer = serial::Writer::with_capacity(4 + data.len());
    writer.write_u32(data.len() as u32);
    writer.write_bytes(data);
    writer.finish()
}
