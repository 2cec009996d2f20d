//! Blocking client for the application protocol spoken by a node.

use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::trace;

use crate::transport::service::{Request, ACCEPT_RESPONSE_SIZE};
use crate::{Error, Result};

/// Largest chunk of data carried by one send request.
pub const SEND_CHUNK_MAX: usize = u16::MAX as usize;

/// A connection accepted on a listening port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Accepted {
    pub socket: i32,
    pub address: Ipv4Addr,
    pub port: u16,
}

/// An application attached to a node. Every call blocks until the node answers.
pub struct TransportClient {
    stream: UnixStream,
}

impl TransportClient {
    /// Attaches to the node listening for applications at `path`.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let stream = UnixStream::connect(path)?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    fn request(&mut self, request: &Request) -> Result<()> {
        trace!(?request, "request");
        self.stream.write_all(&request.encode())?;
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut bytes = [0; N];
        self.stream.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn read_bool(&mut self) -> Result<()> {
        match self.read_array::<1>()? {
            [0] => Err(Error::Rejected),
            _ => Ok(()),
        }
    }

    fn read_int(&mut self) -> Result<i32> {
        match i32::from_be_bytes(self.read_array()?) {
            value if value < 0 => Err(Error::Rejected),
            value => Ok(value),
        }
    }

    pub fn listen(&mut self, port: u16) -> Result<()> {
        self.request(&Request::Listen { port })?;
        self.read_bool()
    }

    /// Waits for a connection on a port previously passed to [`listen`](Self::listen).
    pub fn accept(&mut self, port: u16) -> Result<Accepted> {
        self.request(&Request::Accept { port })?;

        let bytes = self.read_array::<ACCEPT_RESPONSE_SIZE>()?;

        if bytes.iter().all(|&b| b == 0xff) {
            return Err(Error::Rejected);
        }

        let [s0, s1, s2, s3, a0, a1, a2, a3, p0, p1] = bytes;

        Ok(Accepted {
            socket: i32::from_be_bytes([s0, s1, s2, s3]),
            address: Ipv4Addr::new(a0, a1, a2, a3),
            port: u16::from_be_bytes([p0, p1]),
        })
    }

    /// Opens a connection, returning its socket.
    pub fn connect_to(&mut self, address: Ipv4Addr, port: u16) -> Result<i32> {
        self.request(&Request::Connect { address, port })?;
        self.read_int()
    }

    /// Sends up to [`SEND_CHUNK_MAX`] bytes, returning how many the node accepted.
    pub fn send(&mut self, socket: i32, data: &[u8]) -> Result<usize> {
        let data = &data[..data.len().min(SEND_CHUNK_MAX)];

        self.request(&Request::Send {
            socket,
            data: data.into(),
        })?;

        Ok(self.read_int()? as usize)
    }

    pub fn send_all(&mut self, socket: i32, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let sent = self.send(socket, data)?;
            data = &data[sent..];
        }

        Ok(())
    }

    /// Receives up to `length` bytes. An empty result means the peer closed the connection.
    pub fn recv(&mut self, socket: i32, length: u16) -> Result<Box<[u8]>> {
        self.request(&Request::Recv { socket, length })?;

        let received = u32::from_be_bytes(self.read_array()?);

        // A failed recv is answered with -1 in place of the length
        if received == u32::MAX {
            return Err(Error::Rejected);
        }

        let mut data = vec![0; received as usize];
        self.stream.read_exact(&mut data)?;

        Ok(data.into_boxed_slice())
    }

    /// Receives until the peer closes the connection.
    pub fn recv_to_end(&mut self, socket: i32) -> Result<Vec<u8>> {
        let mut data = Vec::new();

        loop {
            let chunk = self.recv(socket, u16::MAX)?;

            if chunk.is_empty() {
                return Ok(data);
            }

            data.extend_from_slice(&chunk);
        }
    }

    pub fn close(&mut self, socket: i32) -> Result<()> {
        self.request(&Request::Close { socket })?;
        self.read_bool()
    }
}
