use std::sync::Arc;

use waypoint_core::{Pipeline, TripService};

/// Shared application state accessible from all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub trips: Arc<TripService>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            trips: Arc::new(TripService::new(pipeline.clone())),
            pipeline,
        }
    }
}
