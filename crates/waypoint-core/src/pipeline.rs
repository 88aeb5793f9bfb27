use std::sync::Arc;

use anyhow::{Context, Result};
use waypoint_bus::EventBus;
use waypoint_places::PlaceRegistry;
use waypoint_revision::RevisionEngine;
use waypoint_tasks::TaskEngine;

use crate::config::WaypointConfig;
use crate::handler::HandlerRegistry;

/// The task engine, revision engine and place registry sharing one bus.
///
/// Constructed once and passed around by `Arc`.
pub struct Pipeline {
    bus: Arc<EventBus>,
    tasks: TaskEngine,
    revisions: RevisionEngine,
    places: Arc<PlaceRegistry>,
    handlers: HandlerRegistry,
}

impl Pipeline {
    pub fn new(
        bus: Arc<EventBus>,
        tasks: TaskEngine,
        revisions: RevisionEngine,
        places: Arc<PlaceRegistry>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            bus,
            tasks,
            revisions,
            places,
            handlers,
        }
    }

    /// Open the on-disk stores under `config.data_dir`.
    pub fn open(config: &WaypointConfig, handlers: HandlerRegistry) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data dir: {}", config.data_dir.display())
        })?;
        let bus = Arc::new(EventBus::default());
        let tasks = TaskEngine::open(&config.tasks_db(), config.tasks.clone(), bus.clone())
            .context("failed to open task store")?;
        let revisions =
            RevisionEngine::open(&config.itineraries_db(), config.revision.clone(), bus.clone())
                .context("failed to open itinerary store")?;
        let places = PlaceRegistry::open(&config.places_db(), config.places.clone(), bus.clone())
            .context("failed to open place store")?;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            handlers = handlers.len(),
            "pipeline opened"
        );
        Ok(Self::new(bus, tasks, revisions, Arc::new(places), handlers))
    }

    pub fn in_memory(config: &WaypointConfig, handlers: HandlerRegistry) -> Result<Self> {
        let bus = Arc::new(EventBus::default());
        let tasks = TaskEngine::in_memory(config.tasks.clone(), bus.clone())?;
        let revisions = RevisionEngine::in_memory(config.revision.clone(), bus.clone())?;
        let places = PlaceRegistry::in_memory(config.places.clone(), bus.clone())?;
        Ok(Self::new(bus, tasks, revisions, Arc::new(places), handlers))
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn tasks(&self) -> &TaskEngine {
        &self.tasks
    }

    pub fn revisions(&self) -> &RevisionEngine {
        &self.revisions
    }

    pub fn places(&self) -> &Arc<PlaceRegistry> {
        &self.places
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }
}
