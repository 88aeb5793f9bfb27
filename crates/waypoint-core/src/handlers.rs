//! In-process handlers for the task types that need no external collaborator.

use async_trait::async_trait;
use serde_json::json;
use waypoint_places::RegistryError;
use waypoint_schema::{
    ChangeOperation, ChangeScope, ChangeSet, NodePatch, TaskFailure, TaskPayload, TaskResult,
    TaskType,
};

use crate::handler::{TaskContext, TaskHandler, TaskOutput};

/// Turns a structured edit intent into a change set against the task's itinerary.
pub struct ApplyEditHandler;

#[async_trait]
impl TaskHandler for ApplyEditHandler {
    fn task_type(&self) -> TaskType {
        TaskType::ApplyEdit
    }

    async fn handle(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskFailure> {
        let TaskPayload::ApplyEdit(intent) = &ctx.task.payload else {
            return Err(TaskFailure::permanent("apply_edit task without an edit intent"));
        };
        ctx.itinerary()?;
        if intent.operations.is_empty() {
            return Err(TaskFailure::permanent("edit intent has no operations"));
        }

        let change_set = ChangeSet {
            scope: intent.scope,
            operations: intent.operations.clone(),
            base_version: intent.base_version,
            idempotency_key: None,
            reason: intent.reason.clone(),
            actor: ctx.actor(),
        };
        let summary = format!("{} operation(s) proposed", change_set.operations.len());
        Ok(TaskOutput::new(TaskResult::summary(summary)).with_change_set(change_set))
    }
}

/// Resolves observed places through the registry and points nodes at the
/// canonical ids. Merge failures are queued by the registry and skipped here.
pub struct EnrichPlacesHandler;

#[async_trait]
impl TaskHandler for EnrichPlacesHandler {
    fn task_type(&self) -> TaskType {
        TaskType::EnrichPlaces
    }

    async fn handle(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskFailure> {
        let TaskPayload::EnrichPlaces(payload) = &ctx.task.payload else {
            return Err(TaskFailure::permanent(
                "enrich_places task without observations",
            ));
        };
        let itinerary = ctx.itinerary()?;

        let mut operations = Vec::new();
        let mut resolved = 0usize;
        let mut skipped = Vec::new();

        for observation in &payload.observations {
            let Some(node) = itinerary.node(&observation.node_id) else {
                skipped.push(json!({
                    "node_id": observation.node_id,
                    "reason": "node not found",
                }));
                continue;
            };

            match ctx.places.resolve(observation.candidate.clone()).await {
                Ok(outcome) => {
                    resolved += 1;
                    if node.place_id.as_deref() != Some(outcome.place_id.as_str()) {
                        operations.push(ChangeOperation::Update {
                            node_id: node.id.clone(),
                            patch: NodePatch {
                                place_id: Some(Some(outcome.place_id)),
                                ..NodePatch::default()
                            },
                        });
                    }
                }
                Err(RegistryError::MergeFailure { reason, .. }) => {
                    skipped.push(json!({ "node_id": node.id, "reason": reason }));
                }
                Err(e) => return Err(TaskFailure::transient(format!("place registry: {e}"))),
            }
        }

        let result = TaskResult {
            summary: Some(format!(
                "resolved {resolved} place(s), {} node(s) updated",
                operations.len()
            )),
            data: json!({ "resolved": resolved, "skipped": skipped }),
        };
        let mut output = TaskOutput::new(result);
        if !operations.is_empty() {
            output.change_sets.push(ChangeSet {
                scope: ChangeScope::Trip,
                operations,
                base_version: None,
                idempotency_key: None,
                reason: "place enrichment".to_string(),
                actor: ctx.actor(),
            });
        }
        Ok(output)
    }
}
