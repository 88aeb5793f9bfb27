//! Versioned itinerary documents: change-set application under optimistic
//! concurrency, diffs, revision history and undo.

pub mod apply;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod inverse;
pub mod store;

pub use config::{LockPolicy, RevisionConfig};
pub use engine::{ApplyOutcome, RevisionEngine};
pub use error::RevisionError;
pub use store::{CasResult, ItineraryStore, ItinerarySummary};
