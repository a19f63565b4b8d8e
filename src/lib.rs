#![forbid(unsafe_code)]

//! Passive damage/heal meter core for an MMO client.
//!
//! The pipeline ingests UDP payloads (replayed from a capture file or fed by
//! an external live-capture collaborator), reassembles the game's
//! reliable-UDP transport, decodes the tagged payload dictionaries, tracks
//! self/party identity, and aggregates per-actor combat statistics over
//! session windows. UI layers consume read-only snapshots; they never reach
//! into pipeline state.

pub mod capture;
pub mod config;
pub mod domain;
pub mod error;
pub mod meter;
pub mod photon;
pub mod pipeline;
pub mod runner;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::capture::{ClockDomain, Endpoint, FlowKey, PacketSource, RawPacket};
pub use crate::config::{Config, EventCodes, Limits};
pub use crate::meter::{Mode, Snapshot, SortKey};
pub use crate::pipeline::Pipeline;
pub use crate::runner::{spawn, MeterHandle};

/// Capture filter recommended for live collaborators. The pipeline itself
/// drops any non-UDP input, so the filter is an optimization, not a contract.
pub const RECOMMENDED_BPF: &str = "udp and (port 5055 or port 5056 or port 5058)";
