use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use waypoint_bus::{EventBus, KeyedLocks};
use waypoint_schema::{BusMessage, CanonicalPlace, PlaceCandidate};

use crate::error::{RegistryError, Result};
use crate::merge::{self, haversine_m, names_match, new_place, validate_candidate};
use crate::store::{PendingMerge, PlaceStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Unknown sources whose name matches a place within this distance join that place.
    #[serde(default = "default_match_radius_m")]
    pub match_radius_m: f64,
    #[serde(default = "default_max_pending_attempts")]
    pub max_pending_attempts: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            match_radius_m: default_match_radius_m(),
            max_pending_attempts: default_max_pending_attempts(),
        }
    }
}

fn default_match_radius_m() -> f64 {
    150.0
}

fn default_max_pending_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveOutcome {
    pub place_id: String,
    pub source_key: String,
    pub created: bool,
    pub merged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingReport {
    pub merged: usize,
    pub still_pending: usize,
    pub dropped: usize,
}

/// Deduplicating registry of canonical places.
pub struct PlaceRegistry {
    store: PlaceStore,
    place_locks: KeyedLocks,
    /// Serializes creation so two resolves of a new source cannot both create.
    create_lock: Mutex<()>,
    bus: Arc<EventBus>,
    config: RegistryConfig,
}

impl PlaceRegistry {
    pub fn new(store: PlaceStore, config: RegistryConfig, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            place_locks: KeyedLocks::new(),
            create_lock: Mutex::new(()),
            bus,
            config,
        }
    }

    pub fn open(db_path: &Path, config: RegistryConfig, bus: Arc<EventBus>) -> Result<Self> {
        Ok(Self::new(PlaceStore::open(db_path)?, config, bus))
    }

    pub fn in_memory(config: RegistryConfig, bus: Arc<EventBus>) -> Result<Self> {
        Ok(Self::new(PlaceStore::open_in_memory()?, config, bus))
    }

    /// Map an observation to its canonical place, creating or merging as needed.
    ///
    /// A candidate that cannot be merged is queued for [`Self::retry_pending`]
    /// and reported as [`RegistryError::MergeFailure`].
    pub async fn resolve(&self, candidate: PlaceCandidate) -> Result<ResolveOutcome> {
        let source_key = candidate.source_key();
        let attempt = match validate_candidate(&candidate) {
            Ok(()) => self.resolve_valid(&candidate).await.map_err(|e| e.to_string()),
            Err(reason) => Err(reason),
        };

        match attempt {
            Ok(outcome) => {
                self.announce(&outcome).await;
                Ok(outcome)
            }
            Err(reason) => {
                tracing::warn!(source_key = %source_key, "queueing place candidate: {reason}");
                self.store.enqueue_pending(&candidate, &reason).await?;
                Err(RegistryError::MergeFailure { source_key, reason })
            }
        }
    }

    async fn resolve_valid(&self, candidate: &PlaceCandidate) -> Result<ResolveOutcome> {
        let source_key = candidate.source_key();

        if let Some(place_id) = self.store.place_id_for_source(&source_key).await? {
            self.merge_into(&place_id, candidate).await?;
            return Ok(ResolveOutcome {
                place_id,
                source_key,
                created: false,
                merged: true,
            });
        }

        let _creating = self.create_lock.lock().await;

        // Another resolve may have created it while we waited.
        if let Some(place_id) = self.store.place_id_for_source(&source_key).await? {
            self.merge_into(&place_id, candidate).await?;
            return Ok(ResolveOutcome {
                place_id,
                source_key,
                created: false,
                merged: true,
            });
        }

        if let Some(place_id) = self.find_match(candidate).await? {
            tracing::debug!(place_id = %place_id, source_key = %source_key, "attaching new source by name and proximity");
            self.merge_into(&place_id, candidate).await?;
            return Ok(ResolveOutcome {
                place_id,
                source_key,
                created: false,
                merged: true,
            });
        }

        let place = new_place(candidate, Utc::now());
        self.store.save(&place).await?;
        tracing::info!(place_id = %place.id, source_key = %source_key, "canonical place created");
        Ok(ResolveOutcome {
            place_id: place.id,
            source_key,
            created: true,
            merged: false,
        })
    }

    async fn merge_into(&self, place_id: &str, candidate: &PlaceCandidate) -> Result<CanonicalPlace> {
        let _guard = self.place_locks.acquire(place_id).await;
        let mut place = self.get(place_id).await?;
        merge::merge_candidate(&mut place, candidate, Utc::now());
        self.store.save(&place).await?;
        Ok(place)
    }

    async fn find_match(&self, candidate: &PlaceCandidate) -> Result<Option<String>> {
        let Some(at) = candidate.coordinates else {
            return Ok(None);
        };
        let radius = self.config.match_radius_m;
        let best = self
            .store
            .near(at, radius)
            .await?
            .into_iter()
            .filter(|p| names_match(p, &candidate.name))
            .filter_map(|p| {
                let distance = haversine_m(p.coordinates?, at);
                (distance <= radius).then_some((distance, p.id))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0));
        Ok(best.map(|(_, id)| id))
    }

    pub async fn get(&self, place_id: &str) -> Result<CanonicalPlace> {
        self.store
            .get(place_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(place_id.to_string()))
    }

    pub async fn find_by_source(&self, source_key: &str) -> Result<Option<CanonicalPlace>> {
        match self.store.place_id_for_source(source_key).await? {
            Some(place_id) => self.store.get(&place_id).await,
            None => Ok(None),
        }
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<CanonicalPlace>> {
        self.store.list(limit).await
    }

    /// Caller-driven confidence override; the registry applies no policy of its own.
    pub async fn adjust_confidence(&self, place_id: &str, confidence: f64) -> Result<CanonicalPlace> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(RegistryError::InvalidConfidence(confidence));
        }
        let _guard = self.place_locks.acquire(place_id).await;
        let mut place = self.get(place_id).await?;
        place.confidence = confidence;
        place.last_updated = Utc::now();
        self.store.save(&place).await?;
        tracing::info!(place_id, confidence, "place confidence adjusted");
        Ok(place)
    }

    pub async fn source_spread_m(&self, place_id: &str) -> Result<f64> {
        Ok(merge::source_spread_m(&self.get(place_id).await?))
    }

    pub async fn pending(&self) -> Result<Vec<PendingMerge>> {
        self.store.pending().await
    }

    /// Re-attempt queued candidates. Entries that keep failing are dropped after
    /// `max_pending_attempts` retries.
    pub async fn retry_pending(&self) -> Result<PendingReport> {
        let mut report = PendingReport::default();
        for entry in self.store.pending().await? {
            let attempt = match validate_candidate(&entry.candidate) {
                Ok(()) => self
                    .resolve_valid(&entry.candidate)
                    .await
                    .map_err(|e| e.to_string()),
                Err(reason) => Err(reason),
            };

            match attempt {
                Ok(outcome) => {
                    self.store.remove_pending(entry.id).await?;
                    self.announce(&outcome).await;
                    report.merged += 1;
                }
                Err(reason) if entry.attempts + 1 >= self.config.max_pending_attempts => {
                    tracing::warn!(
                        source_key = %entry.candidate.source_key(),
                        attempts = entry.attempts + 1,
                        "dropping place candidate: {reason}"
                    );
                    self.store.remove_pending(entry.id).await?;
                    report.dropped += 1;
                }
                Err(reason) => {
                    self.store.record_pending_failure(entry.id, &reason).await?;
                    report.still_pending += 1;
                }
            }
        }
        if report != PendingReport::default() {
            tracing::debug!(?report, "pending place merges retried");
        }
        Ok(report)
    }

    async fn announce(&self, outcome: &ResolveOutcome) {
        let msg = BusMessage::PlaceResolved {
            place_id: outcome.place_id.clone(),
            source_key: outcome.source_key.clone(),
            created: outcome.created,
        };
        if let Err(e) = self.bus.publish(msg).await {
            tracing::warn!("failed to publish place event: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_schema::SourceType;

    fn registry() -> PlaceRegistry {
        PlaceRegistry::in_memory(RegistryConfig::default(), Arc::new(EventBus::default())).unwrap()
    }

    #[tokio::test]
    async fn adjust_confidence_bounds() {
        let registry = registry();
        let outcome = registry
            .resolve(PlaceCandidate::new(SourceType::UserInput, "u1", "Miradouro").at(38.71, -9.13))
            .await
            .unwrap();
        let place = registry
            .adjust_confidence(&outcome.place_id, 0.4)
            .await
            .unwrap();
        assert_eq!(place.confidence, 0.4);
        assert!(matches!(
            registry.adjust_confidence(&outcome.place_id, 1.5).await,
            Err(RegistryError::InvalidConfidence(_))
        ));
        assert!(matches!(
            registry.adjust_confidence("place_missing", 0.5).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(registry.place_locks.is_empty());
    }

    #[tokio::test]
    async fn name_match_outside_radius_creates_new_place() {
        let registry = registry();
        let a = registry
            .resolve(PlaceCandidate::new(SourceType::MappingProvider, "m1", "Starbucks").at(38.7100, -9.1300))
            .await
            .unwrap();
        let b = registry
            .resolve(PlaceCandidate::new(SourceType::ReviewSite, "r1", "Starbucks").at(38.7200, -9.1300))
            .await
            .unwrap();
        assert!(b.created);
        assert_ne!(a.place_id, b.place_id);
    }
}
