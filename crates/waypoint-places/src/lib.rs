//! Canonical place registry: deduplicates place observations from many
//! sources into one authority-weighted record per real-world place.

pub mod error;
pub mod merge;
pub mod registry;
pub mod store;

pub use error::RegistryError;
pub use merge::{haversine_m, source_spread_m, stable_place_id};
pub use registry::{PendingReport, PlaceRegistry, RegistryConfig, ResolveOutcome};
pub use store::{PendingMerge, PlaceStore};
