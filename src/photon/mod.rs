//! The game's wire protocol: transport framing, message classification, and
//! the tagged payload codec.

pub mod dump;
pub mod message;
pub mod protocol16;
pub mod transport;
pub mod wire;

pub use dump::UnknownSink;
pub use message::{classify, ClassifyError, LogicalMessage, MessageKind};
pub use protocol16::{ParamMap, Protocol16Error, Value};
pub use transport::{Reassembler, TransportCounters, TransportMessage};
