/*

wirestack is a small layered network stack for hosts joined by simulated wires.

# Layers

  frame      Framing and CRC-32 over a raw byte stream per wire.
  link       Reliable stop-and-wait delivery between neighbors on one wire, opened lazily by a
             one-byte handshake. Broadcasts are sent unreliably.
  network    Neighbor discovery, link-state advertisements, a minimum spanning tree for
             broadcast, shortest paths toward every destination, fragmentation and reassembly.
  transport  Connection-oriented byte streams with a listen/accept/connect/send/recv/close
             interface for local applications.

Every engine is a state machine driven by three kinds of input: bytes from the layer below,
requests from the layer above, and timers. Engines never read the clock; the current time in
milliseconds is passed to every call. Side effects go through a per-engine HostContext trait, which
the Node implements by wiring the layers together.

# Timers

Engines identify timers by ids they allocate themselves. Nothing is ever cancelled: when a timer
fires, the engine looks the id up, and a miss, or an id which is no longer the one the target is
waiting on, is ignored. Connections can therefore be destroyed at any time.

# Next hop selection

A packet for a non-neighbor is forwarded to one of the neighbors with a path to the destination,
chosen at random with probability proportional to max_delay / delay over those paths, so that
traffic spreads across near-equal routes while preferring short ones. Paths are computed per
neighbor with Dijkstra's algorithm over the advertised topology, with the local node removed.

# Application protocol

Applications talk to their node over a stream. Requests are a one byte opcode followed by fixed
fields, big-endian:

  1 listen   port (2)                 -> ok (1)
  2 accept   port (2)                 -> socket (4), address (4), port (2), or all 0xff
  3 connect  address (4), port (2)    -> socket (4), or -1
  4 send     socket (4), length (2), data -> bytes accepted (4), or -1
  5 recv     socket (4), length (2)   -> length (4), data
  6 close    socket (4)               -> ok (1)

accept, connect, send and recv answer only once they can complete.

*/

mod addr;
pub mod client;
pub mod epoch;
mod error;
pub mod frame;
pub mod link;
pub mod network;
pub mod node;
mod serial;
pub mod socket;
mod timer_queue;
pub mod transport;

pub use addr::{MacAddress, BROADCAST_IP};
pub use error::{Error, Result};

pub type Node = node::Node;
