//! Wiring for the mutation pipeline: configuration, task handlers, the worker
//! pool that turns task output into itinerary revisions, and trip creation.

pub mod config;
pub mod handler;
pub mod handlers;
pub mod pipeline;
pub mod trip;
pub mod worker;

pub use config::{load_config, resolve_env_var, validate_config, WaypointConfig};
pub use handler::{HandlerRegistry, TaskContext, TaskHandler, TaskOutput};
pub use pipeline::Pipeline;
pub use trip::{TripCreated, TripError, TripRequest, TripService};
pub use worker::{process_next, sweep_once, RunReport, SweepReport, WorkerConfig, WorkerPool};
