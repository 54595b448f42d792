// Event log listing (JSON)
// For diagnostics and clients that cannot hold an SSE connection open.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use storyline_core::event::{EventId, StoryId};
use storyline_core::{Event, EventLog, ReadScope};

use super::common::{ErrorResponse, ListResponse, Viewer};

/// Query parameters for event listing
#[derive(Debug, Default, Deserialize, ToSchema, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct EventsQuery {
    /// Only events with a greater id (default 0)
    pub since: Option<EventId>,
    /// Include text events for this story
    pub root_story_id: Option<StoryId>,
    /// Maximum events returned (capped at the server's read batch limit)
    pub limit: Option<usize>,
}

#[derive(Clone)]
pub struct AppState {
    pub log: Arc<dyn EventLog>,
    pub max_limit: usize,
}

impl AppState {
    pub fn new(log: Arc<dyn EventLog>, max_limit: usize) -> Self {
        Self { log, max_limit }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/events", get(list_events))
        .with_state(state)
}

/// GET /v1/events - List events visible to the viewer (JSON)
#[utoipa::path(
    get,
    path = "/v1/events",
    params(
        EventsQuery,
        ("X-Writer-Id" = Option<i64>, Header, description = "Authenticated writer id")
    ),
    responses(
        (status = 200, description = "Events list", body = ListResponse<Event>),
        (status = 400, description = "Invalid writer id", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "events"
)]
pub async fn list_events(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Query(query): Query<EventsQuery>,
) -> Result<Json<ListResponse<Event>>, (StatusCode, Json<ErrorResponse>)> {
    let limit = query
        .limit
        .unwrap_or(state.max_limit)
        .min(state.max_limit);
    let scope = ReadScope::new(viewer, query.root_story_id).with_limit(limit);

    let events = state
        .log
        .read_since(query.since.unwrap_or(0), &scope)
        .await
        .map_err(|e| {
            tracing::error!("Failed to list events: {}", e);
            ErrorResponse::new("Failed to list events")
                .into_response(StatusCode::INTERNAL_SERVER_ERROR)
        })?;

    Ok(Json(ListResponse::new(events)))
}
