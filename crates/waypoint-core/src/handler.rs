//! The seam between the worker pool and the code that does a task's work.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use waypoint_places::PlaceRegistry;
use waypoint_schema::{
    Actor, ChangeSet, Itinerary, Lease, PlaceCandidate, Task, TaskFailure, TaskResult, TaskType,
};

/// Effects a handler asks the worker to apply once the attempt is known to be live.
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub result: TaskResult,
    /// Applied in order against the task's itinerary.
    pub change_sets: Vec<ChangeSet>,
    /// Resolved before any change set is applied.
    pub place_candidates: Vec<PlaceCandidate>,
}

impl TaskOutput {
    pub fn new(result: TaskResult) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    pub fn with_change_set(mut self, change_set: ChangeSet) -> Self {
        self.change_sets.push(change_set);
        self
    }
}

/// Read-only view handed to a handler for one attempt.
pub struct TaskContext {
    pub task: Task,
    pub lease: Lease,
    /// Snapshot of the target itinerary taken when the attempt started.
    pub itinerary: Option<Itinerary>,
    pub places: Arc<PlaceRegistry>,
}

impl TaskContext {
    /// Actor to stamp on change sets produced by this task.
    pub fn actor(&self) -> Actor {
        Actor::Agent {
            kind: self.task.agent_kind,
            task_id: Some(self.task.id),
        }
    }

    pub fn itinerary(&self) -> Result<&Itinerary, TaskFailure> {
        self.itinerary.as_ref().ok_or_else(|| {
            TaskFailure::permanent(format!(
                "{} task {} has no target itinerary",
                self.task.task_type, self.task.id
            ))
        })
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn handle(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskFailure>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the in-process edit and enrichment handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::handlers::ApplyEditHandler));
        registry.register(Arc::new(crate::handlers::EnrichPlacesHandler));
        registry
    }

    /// Register a handler, replacing any previous one for the same task type.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.task_type(), handler);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_edit_and_enrichment() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(
            registry.task_types(),
            vec![TaskType::ApplyEdit, TaskType::EnrichPlaces]
        );
        assert!(!registry.contains(TaskType::PlanTrip));
    }
}
