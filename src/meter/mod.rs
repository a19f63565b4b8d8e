//! Session accounting: aggregation, lifecycle, and snapshots.

pub mod aggregate;
pub mod fame;
pub mod session;
pub mod snapshot;

pub use aggregate::{SortKey, Stats};
pub use fame::FameTracker;
pub use session::{ArchivedSession, CloseReason, LiveSession, Mode, SessionManager};
pub use snapshot::{project, ActorRow, Counters, HistorySummary, Snapshot};
