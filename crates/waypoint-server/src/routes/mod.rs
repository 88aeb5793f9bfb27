pub mod itineraries;
pub mod places;
pub mod tasks;
pub mod trips;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/tasks", tasks::router())
        .nest("/trips", trips::router())
        .nest("/itineraries", itineraries::router())
        .nest("/places", places::router())
}
