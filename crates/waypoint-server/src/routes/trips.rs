use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use waypoint_core::{TripCreated, TripRequest};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(create_trip))
}

pub async fn create_trip(
    State(state): State<AppState>,
    Json(body): Json<TripRequest>,
) -> Result<(StatusCode, Json<TripCreated>), ApiError> {
    let created = state.trips.create_trip(body).await?;
    Ok((StatusCode::CREATED, Json(created)))
}
