//! Replay position tracking.
//!
//! This module owns everything about "where does a channel resume from":
//! - Markers and replay options
//! - Marker stores and the mappings they are built on
//! - Resolution of the replay request for each subscribe attempt
//! - Commit points that advance a channel's marker
//!
//! # Example
//!
//! ```ignore
//! let store = DefaultOnMiss::new(
//!     MappingStore::new(JournalMapping::open("./markers.journal")?),
//!     ReplayOption::AllEvents,
//! );
//! let policy = ReplayPolicy::new(Arc::new(store), None);
//!
//! // No marker yet, so the whole retention window is requested
//! assert_eq!(policy.resolve_replay_value("/topic/x")?, ReplayOption::AllEvents);
//! ```

mod commit;
mod journal;
mod mapping;
mod marker;
mod policy;
mod store;

pub use commit::{CommitGuard, CommitOutcome, MarkerCommitter};
pub use journal::{JournalMapping, DEFAULT_COMPACT_AFTER};
pub use mapping::{LruMapping, MarkerMapping, MemoryMapping};
pub use marker::{ReplayMarker, ReplayOption, ALL_EVENTS_WIRE, NEW_EVENTS_WIRE};
pub use policy::ReplayPolicy;
pub use store::{ConstantReplay, DefaultOnMiss, MappingStore, MarkerStore};
