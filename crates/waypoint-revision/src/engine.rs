use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use waypoint_bus::{EventBus, KeyedLocks};
use waypoint_schema::{
    Actor, BusMessage, ChangeScope, ChangeSet, ChatMessage, Itinerary, ItineraryDiff,
    ItineraryDraft, PatchEvent, RejectedOperation, RevisionRecord,
};

use crate::apply::{self, ApplyFailure};
use crate::config::RevisionConfig;
use crate::diff::{diff_days, summarize};
use crate::error::{Result, RevisionError};
use crate::inverse::inverse_operations;
use crate::store::{CasResult, ItineraryStore, ItinerarySummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub itinerary_id: String,
    pub revision_id: Uuid,
    pub from_version: u64,
    pub to_version: u64,
    pub diff: ItineraryDiff,
    pub rejected: Vec<RejectedOperation>,
    /// True when the idempotency key matched an earlier revision and nothing was applied.
    pub replayed: bool,
}

impl ApplyOutcome {
    fn from_record(itinerary_id: &str, record: &RevisionRecord, replayed: bool) -> Self {
        Self {
            itinerary_id: itinerary_id.to_string(),
            revision_id: record.revision_id,
            from_version: record.from_version,
            to_version: record.to_version,
            diff: record.diff.clone(),
            rejected: record.rejected.clone(),
            replayed,
        }
    }
}

/// Document-of-record controller for itineraries.
///
/// Writes to one itinerary are serialized by a keyed lock and persisted with a
/// compare-and-swap on the version; different itineraries never contend.
pub struct RevisionEngine {
    store: ItineraryStore,
    locks: KeyedLocks,
    bus: Arc<EventBus>,
    config: RevisionConfig,
}

impl RevisionEngine {
    pub fn new(store: ItineraryStore, config: RevisionConfig, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            bus,
            config,
        }
    }

    pub fn open(db_path: &Path, config: RevisionConfig, bus: Arc<EventBus>) -> Result<Self> {
        Ok(Self::new(ItineraryStore::open(db_path)?, config, bus))
    }

    pub fn in_memory(config: RevisionConfig, bus: Arc<EventBus>) -> Result<Self> {
        Ok(Self::new(ItineraryStore::open_in_memory()?, config, bus))
    }

    pub async fn create_itinerary(&self, draft: ItineraryDraft) -> Result<Itinerary> {
        apply::validate_days(&draft.days).map_err(|reason| RevisionError::InvalidOperation {
            index: None,
            reason,
            current_version: 0,
        })?;

        let now = Utc::now();
        let doc = Itinerary {
            id: draft
                .id
                .unwrap_or_else(|| format!("itn_{}", Uuid::new_v4().simple())),
            version: 1,
            title: draft.title,
            days: draft.days,
            settings: draft.settings,
            revisions: Vec::new(),
            chat: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&doc).await?;
        tracing::info!(itinerary_id = %doc.id, days = doc.days.len(), "itinerary created");
        Ok(doc)
    }

    pub async fn get(&self, itinerary_id: &str) -> Result<Itinerary> {
        self.store
            .load(itinerary_id)
            .await?
            .ok_or_else(|| RevisionError::NotFound(itinerary_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<ItinerarySummary>> {
        self.store.list().await
    }

    pub async fn history(&self, itinerary_id: &str) -> Result<Vec<RevisionRecord>> {
        Ok(self.get(itinerary_id).await?.revisions)
    }

    pub async fn apply_change_set(
        &self,
        itinerary_id: &str,
        change_set: ChangeSet,
    ) -> Result<ApplyOutcome> {
        let _guard = self.locks.acquire(itinerary_id).await;
        let doc = self.get(itinerary_id).await?;

        if let Some(key) = &change_set.idempotency_key {
            if let Some(record) = doc
                .revisions
                .iter()
                .find(|r| r.idempotency_key.as_deref() == Some(key.as_str()))
            {
                tracing::debug!(itinerary_id, key = %key, "change set already applied, replaying outcome");
                return Ok(ApplyOutcome::from_record(itinerary_id, record, true));
            }
        }

        if let Some(base) = change_set.base_version {
            if base != doc.version {
                tracing::info!(
                    itinerary_id,
                    expected = base,
                    current = doc.version,
                    "change set rejected on version conflict"
                );
                return Err(RevisionError::VersionConflict {
                    expected: base,
                    current: doc.version,
                });
            }
        }

        self.commit(doc, change_set, None).await
    }

    /// Apply the inverse of `revision_id` as a new revision.
    pub async fn undo(
        &self,
        itinerary_id: &str,
        revision_id: Uuid,
        actor: Actor,
    ) -> Result<ApplyOutcome> {
        let _guard = self.locks.acquire(itinerary_id).await;
        let doc = self.get(itinerary_id).await?;

        let record = doc
            .revisions
            .iter()
            .find(|r| r.revision_id == revision_id)
            .ok_or_else(|| RevisionError::RevisionNotFound {
                itinerary_id: itinerary_id.to_string(),
                revision_id,
            })?;
        let operations =
            inverse_operations(record).map_err(|reason| RevisionError::InvalidOperation {
                index: None,
                reason,
                current_version: doc.version,
            })?;

        let change_set = ChangeSet {
            scope: ChangeScope::Trip,
            operations,
            base_version: Some(doc.version),
            idempotency_key: None,
            reason: format!(
                "undo of revision {} (v{} -> v{})",
                record.revision_id, record.from_version, record.to_version
            ),
            actor,
        };
        self.commit(doc, change_set, Some(revision_id)).await
    }

    /// Record a chat message on the itinerary. The version is not bumped.
    pub async fn append_chat(
        &self,
        itinerary_id: &str,
        author: Actor,
        text: &str,
    ) -> Result<Itinerary> {
        let _guard = self.locks.acquire(itinerary_id).await;
        let mut doc = self.get(itinerary_id).await?;
        let now = Utc::now();
        doc.chat.push(ChatMessage {
            at: now,
            author,
            text: text.to_string(),
        });
        doc.updated_at = now;

        match self.store.compare_and_swap(&doc, doc.version).await? {
            CasResult::Success => Ok(doc),
            CasResult::NotFound => Err(RevisionError::NotFound(itinerary_id.to_string())),
            CasResult::VersionConflict { actual } => Err(RevisionError::VersionConflict {
                expected: doc.version,
                current: actual,
            }),
        }
    }

    async fn commit(
        &self,
        doc: Itinerary,
        change_set: ChangeSet,
        undo_of: Option<Uuid>,
    ) -> Result<ApplyOutcome> {
        let current_version = doc.version;
        let applied = apply::apply_change_set(&doc, &change_set, self.config.lock_policy)
            .map_err(|failure| match failure {
                ApplyFailure::Invalid { index, reason } => {
                    tracing::info!(itinerary_id = %doc.id, ?index, "change set rejected: {reason}");
                    RevisionError::InvalidOperation {
                        index,
                        reason,
                        current_version,
                    }
                }
                ApplyFailure::Locked(rejected) => {
                    tracing::info!(
                        itinerary_id = %doc.id,
                        rejected = rejected.len(),
                        "change set rejected on locked nodes"
                    );
                    RevisionError::LockedElementRejected {
                        rejected,
                        current_version,
                    }
                }
            })?;

        let diff = diff_days(&doc.days, &applied.days);
        let now = Utc::now();
        let record = RevisionRecord {
            revision_id: Uuid::new_v4(),
            from_version: current_version,
            to_version: current_version + 1,
            at: now,
            actor: change_set.actor.clone(),
            changes: applied.changes,
            reason: change_set.reason.clone(),
            idempotency_key: change_set.idempotency_key.clone(),
            undo_of,
            diff: diff.clone(),
            rejected: applied.rejected,
        };

        let mut next = doc;
        next.days = applied.days;
        next.version = record.to_version;
        next.updated_at = now;
        next.revisions.push(record.clone());

        match self.store.compare_and_swap(&next, current_version).await? {
            CasResult::Success => {}
            CasResult::NotFound => return Err(RevisionError::NotFound(next.id)),
            CasResult::VersionConflict { actual } => {
                return Err(RevisionError::VersionConflict {
                    expected: current_version,
                    current: actual,
                })
            }
        }

        let summary = if change_set.reason.is_empty() {
            summarize(&diff)
        } else {
            format!("{}: {}", change_set.reason, summarize(&diff))
        };
        tracing::info!(
            itinerary_id = %next.id,
            from_version = record.from_version,
            to_version = record.to_version,
            actor = %record.actor,
            "{summary}"
        );

        let event = PatchEvent {
            itinerary_id: next.id.clone(),
            from_version: record.from_version,
            to_version: record.to_version,
            diff,
            summary,
            updated_by: record.actor.clone(),
            at: now,
        };
        if let Err(e) = self.bus.publish(BusMessage::ItineraryPatched { event }).await {
            tracing::warn!("failed to publish patch event: {e}");
        }

        Ok(ApplyOutcome::from_record(&next.id, &record, false))
    }
}
