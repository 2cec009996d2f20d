//! Readiness polling over Unix-domain stream sockets, for the binaries' event loops.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time;

use tracing::debug;

const LISTENER_POLLING_KEY: usize = 0;

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Something that happened on a [`StreamSet`].
#[derive(Debug)]
pub enum StreamEvent {
    /// A new stream was accepted from the listener.
    Accepted(usize),
    /// Bytes were read from a stream.
    Data(usize, Box<[u8]>),
    /// A stream was closed by its peer, or failed, and has been removed.
    Closed(usize),
}

/// A set of connected streams, plus optionally a listener accepting more, all waited on together.
///
/// Streams are identified by keys which are never reused.
pub struct StreamSet {
    listener: Option<UnixListener>,
    streams: HashMap<usize, UnixStream>,
    next_key: usize,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
    // Always-allocated receive buffer
    recv_buffer: Box<[u8]>,
}

impl StreamSet {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            listener: None,
            streams: HashMap::new(),
            next_key: LISTENER_POLLING_KEY + 1,
            poller: polling::Poller::new()?,
            poller_events: polling::Events::new(),
            recv_buffer: vec![0; RECV_BUFFER_SIZE].into_boxed_slice(),
        })
    }

    /// Binds a listener at `path`, replacing any stale socket file left there.
    pub fn listen<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let path = path.as_ref();

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        unsafe {
            self.poller
                .add(&listener, polling::Event::readable(LISTENER_POLLING_KEY))?;
        }

        self.listener = Some(listener);

        Ok(())
    }

    /// Connects to a listening socket at `path`, returning the new stream's key.
    pub fn connect<P: AsRef<Path>>(&mut self, path: P) -> io::Result<usize> {
        let stream = UnixStream::connect(path)?;
        self.insert(stream)
    }

    fn insert(&mut self, stream: UnixStream) -> io::Result<usize> {
        let key = self.next_key;
        self.next_key += 1;

        unsafe {
            self.poller.add(&stream, polling::Event::readable(key))?;
        }

        self.streams.insert(key, stream);

        Ok(key)
    }

    /// Writes all of `bytes` to the stream identified by `key`. A stream which fails is removed,
    /// and the error returned.
    pub fn send(&mut self, key: usize, bytes: &[u8]) -> io::Result<()> {
        let Some(stream) = self.streams.get_mut(&key) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such stream"));
        };

        if let Err(err) = stream.write_all(bytes) {
            self.remove(key);
            return Err(err);
        }

        Ok(())
    }

    pub fn remove(&mut self, key: usize) {
        if let Some(stream) = self.streams.remove(&key) {
            let _ = self.poller.delete(&stream);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = usize> + '_ {
        self.streams.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Blocks for a duration of up to `timeout` until some stream is readable, and returns what
    /// happened. Returns an empty list if the timeout expired, or if polling awoke spuriously.
    pub fn wait(&mut self, timeout: Option<time::Duration>) -> io::Result<Vec<StreamEvent>> {
        // Readiness is one-shot; interest must be renewed prior to each wait() call
        if let Some(listener) = &self.listener {
            self.poller
                .modify(listener, polling::Event::readable(LISTENER_POLLING_KEY))?;
        }

        for (&key, stream) in self.streams.iter() {
            self.poller.modify(stream, polling::Event::readable(key))?;
        }

        self.poller_events.clear();
        self.poller.wait(&mut self.poller_events, timeout)?;

        let ready: Vec<usize> = self.poller_events.iter().map(|event| event.key).collect();

        let mut events = Vec::new();

        for key in ready {
            if key == LISTENER_POLLING_KEY {
                let Some(listener) = &self.listener else {
                    continue;
                };

                let (stream, _) = listener.accept()?;
                let key = self.insert(stream)?;

                events.push(StreamEvent::Accepted(key));
                continue;
            }

            let Some(stream) = self.streams.get_mut(&key) else {
                continue;
            };

            match stream.read(&mut self.recv_buffer) {
                Ok(0) => {
                    self.remove(key);
                    events.push(StreamEvent::Closed(key));
                }
                Ok(len) => {
                    events.push(StreamEvent::Data(key, self.recv_buffer[..len].into()));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(key, %err, "stream failed");
                    self.remove(key);
                    events.push(StreamEvent::Closed(key));
                }
            }
        }

        Ok(events)
    }
}
