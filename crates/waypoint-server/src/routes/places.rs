use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use waypoint_places::ResolveOutcome;
use waypoint_schema::{CanonicalPlace, PlaceCandidate};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ConfidenceBody {
    pub confidence: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingItem {
    pub source_key: String,
    pub last_error: String,
    pub attempts: u32,
    pub queued_at: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_places))
        .route("/resolve", post(resolve_place))
        .route("/pending", get(list_pending))
        .route("/{id}", get(get_place))
        .route("/{id}/confidence", put(set_confidence))
}

pub async fn resolve_place(
    State(state): State<AppState>,
    Json(candidate): Json<PlaceCandidate>,
) -> Result<Json<ResolveOutcome>, ApiError> {
    Ok(Json(state.pipeline.places().resolve(candidate).await?))
}

pub async fn get_place(
    State(state): State<AppState>,
    Path(place_id): Path<String>,
) -> Result<Json<CanonicalPlace>, ApiError> {
    Ok(Json(state.pipeline.places().get(&place_id).await?))
}

pub async fn list_places(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<CanonicalPlace>>, ApiError> {
    let limit = params.limit.unwrap_or(100);
    Ok(Json(state.pipeline.places().list(limit).await?))
}

pub async fn set_confidence(
    State(state): State<AppState>,
    Path(place_id): Path<String>,
    Json(body): Json<ConfidenceBody>,
) -> Result<Json<CanonicalPlace>, ApiError> {
    let place = state
        .pipeline
        .places()
        .adjust_confidence(&place_id, body.confidence)
        .await?;
    Ok(Json(place))
}

pub async fn list_pending(
    State(state): State<AppState>,
) -> Result<Json<Vec<PendingItem>>, ApiError> {
    let items = state
        .pipeline
        .places()
        .pending()
        .await?
        .into_iter()
        .map(|p| PendingItem {
            source_key: p.candidate.source_key(),
            last_error: p.last_error,
            attempts: p.attempts,
            queued_at: p.queued_at.to_rfc3339(),
        })
        .collect();
    Ok(Json(items))
}
