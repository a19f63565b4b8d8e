//! Packet sources and the raw-packet data model.
//!
//! The pipeline consumes `(timestamp, udp payload, endpoints)` tuples and is
//! agnostic about where they come from: the bundled pcap replay, or a live
//! capture owned by the host process.

mod pcap;
mod queue;

use std::fmt;
use std::net::Ipv4Addr;

use bytes::Bytes;
use thiserror::Error;

pub use pcap::PcapReplay;
pub use queue::{capture_queue, Pop, QueueReceiver, QueueSender};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a pcap file (magic {magic:#010x})")]
    BadMagic { magic: u32 },
    #[error("unsupported link type {0}")]
    UnsupportedLinkType(u32),
    #[error("truncated capture record")]
    TruncatedRecord,
}

/// One side of a UDP conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Direction-independent identity of a UDP conversation.
///
/// Reassembly state is keyed per flow; both directions of the same
/// conversation share one reassembler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKey {
    lo: Endpoint,
    hi: Endpoint,
}

impl FlowKey {
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        if a <= b {
            Self { lo: a, hi: b }
        } else {
            Self { lo: b, hi: a }
        }
    }
}

/// A captured UDP payload with its capture timestamp in seconds.
///
/// Replay sources use the capture file's clock; live sources use wall time.
/// The pipeline only ever compares timestamps from the same source.
#[derive(Clone, Debug)]
pub struct RawPacket {
    pub ts: f64,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub payload: Bytes,
}

impl RawPacket {
    pub fn flow(&self) -> FlowKey {
        FlowKey::new(self.src, self.dst)
    }
}

/// Which clock a source's packet timestamps come from.
///
/// Replay timestamps come from the capture file; live timestamps come from
/// the wall clock. Timeline-sensitive logic (idle timeouts, elapsed time)
/// must never mix the two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockDomain {
    /// Timestamps are read from a capture file; time only advances with
    /// packets.
    File,
    /// Timestamps are wall-clock; time advances on its own.
    Wall,
}

/// A stream of raw UDP packets.
///
/// `next_packet` returns `Ok(None)` at end of stream (replay exhaustion);
/// live sources block until a packet or shutdown.
pub trait PacketSource: Send {
    fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError>;

    /// Clock domain of the timestamps this source produces.
    fn clock(&self) -> ClockDomain {
        ClockDomain::Wall
    }
}
