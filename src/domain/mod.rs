//! Domain semantics: events, identity, and item knowledge.

pub mod events;
pub mod items;
pub mod roster;

pub use events::{DomainEvent, EventBuilder, EventRegistry};
pub use items::ItemCatalog;
pub use roster::{ActorId, ActorRecord, Admission, Backfill, Deferred, Roster};
