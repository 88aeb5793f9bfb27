use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_core::Stream;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use waypoint_bus::Topic;
use waypoint_revision::{ApplyOutcome, ItinerarySummary};
use waypoint_schema::{Actor, BusMessage, ChangeSet, Itinerary, RevisionRecord};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoBody {
    pub revision_id: Uuid,
    #[serde(default = "default_actor")]
    pub actor: Actor,
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    #[serde(default = "default_actor")]
    pub author: Actor,
    pub text: String,
}

fn default_actor() -> Actor {
    Actor::System
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_itineraries))
        .route("/{id}", get(get_itinerary))
        .route("/{id}/history", get(get_history))
        .route("/{id}/changesets", post(apply_change_set))
        .route("/{id}/undo", post(undo_revision))
        .route("/{id}/chat", post(append_chat))
        .route("/{id}/events", get(patch_stream))
}

pub async fn list_itineraries(
    State(state): State<AppState>,
) -> Result<Json<Vec<ItinerarySummary>>, ApiError> {
    Ok(Json(state.pipeline.revisions().list().await?))
}

pub async fn get_itinerary(
    State(state): State<AppState>,
    Path(itinerary_id): Path<String>,
) -> Result<Json<Itinerary>, ApiError> {
    Ok(Json(state.pipeline.revisions().get(&itinerary_id).await?))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(itinerary_id): Path<String>,
) -> Result<Json<Vec<RevisionRecord>>, ApiError> {
    Ok(Json(state.pipeline.revisions().history(&itinerary_id).await?))
}

pub async fn apply_change_set(
    State(state): State<AppState>,
    Path(itinerary_id): Path<String>,
    Json(change_set): Json<ChangeSet>,
) -> Result<Json<ApplyOutcome>, ApiError> {
    let outcome = state
        .pipeline
        .revisions()
        .apply_change_set(&itinerary_id, change_set)
        .await?;
    Ok(Json(outcome))
}

pub async fn undo_revision(
    State(state): State<AppState>,
    Path(itinerary_id): Path<String>,
    Json(body): Json<UndoBody>,
) -> Result<Json<ApplyOutcome>, ApiError> {
    let outcome = state
        .pipeline
        .revisions()
        .undo(&itinerary_id, body.revision_id, body.actor)
        .await?;
    Ok(Json(outcome))
}

pub async fn append_chat(
    State(state): State<AppState>,
    Path(itinerary_id): Path<String>,
    Json(body): Json<ChatBody>,
) -> Result<Json<Itinerary>, ApiError> {
    let doc = state
        .pipeline
        .revisions()
        .append_chat(&itinerary_id, body.author, &body.text)
        .await?;
    Ok(Json(doc))
}

/// Server-sent stream of patch events for one itinerary.
///
/// Patches that never reached this subscriber show up as a version gap; the
/// client is sent a `resync` event and should refetch the document.
pub async fn patch_stream(
    State(state): State<AppState>,
    Path(itinerary_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Subscribe first so no patch lands between the read and the subscription.
    let mut rx = state.pipeline.bus().subscribe(Topic::ItineraryPatched).await;
    let mut delivered = state.pipeline.revisions().get(&itinerary_id).await?.version;

    let stream = async_stream::stream! {
        while let Some(msg) = rx.recv().await {
            let BusMessage::ItineraryPatched { event } = msg else {
                continue;
            };
            if event.itinerary_id != itinerary_id || event.to_version <= delivered {
                continue;
            }
            if event.from_version != delivered {
                tracing::warn!(
                    itinerary_id = %itinerary_id,
                    delivered,
                    from_version = event.from_version,
                    "patch stream fell behind"
                );
                let resync = json!({
                    "itineraryId": itinerary_id,
                    "lastVersion": delivered,
                    "currentVersion": event.to_version,
                });
                yield Ok(Event::default().event("resync").data(resync.to_string()));
            }
            delivered = event.to_version;
            match serde_json::to_string(&event) {
                Ok(json) => {
                    yield Ok(Event::default()
                        .event("patch")
                        .id(event.to_version.to_string())
                        .data(json));
                }
                Err(e) => tracing::warn!("failed to encode patch event: {e}"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
