// Realtime update stream (SSE)
//
// One DeliverySession per connection. Frames map 1:1 onto SSE messages:
// event: <kind>, data: <json>, id: <cursor> (data frames only).
// Dropping the response stream drops the frame receiver, which closes the session.

use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, Sse},
    routing::get,
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use utoipa::{IntoParams, ToSchema};

use storyline_core::event::{EventId, StoryId};
use storyline_core::{ConnectParams, GameFilters, StreamFrame, UpdateHub};

use super::common::{ErrorResponse, Viewer};

/// Standard SSE reconnection header
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Query parameters for the update stream
#[derive(Debug, Default, Deserialize, ToSchema, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct UpdatesQuery {
    /// Resume after this event id; absent or <= 0 starts at the log tail
    pub last_event_id: Option<EventId>,
    /// Story whose text updates should be delivered
    pub root_story_id: Option<StoryId>,
    /// JSON-encoded GameFilters
    pub filters: Option<String>,
    /// Free-text search term for games and story texts
    pub search: Option<String>,
}

// ============================================
// App State and Routes
// ============================================

#[derive(Clone)]
pub struct AppState {
    pub hub: UpdateHub,
}

impl AppState {
    pub fn new(hub: UpdateHub) -> Self {
        Self { hub }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/updates", get(stream_updates))
        .with_state(state)
}

// ============================================
// Request parsing
// ============================================

fn parse_filters(raw: Option<&str>) -> Result<GameFilters, String> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => serde_json::from_str(raw).map_err(|e| format!("Invalid filters: {}", e)),
        None => Ok(GameFilters::default()),
    }
}

/// Query parameter first, then the Last-Event-ID header browsers send on reconnect
fn resume_cursor(query: Option<EventId>, headers: &HeaderMap) -> Option<EventId> {
    query.or_else(|| {
        headers
            .get(LAST_EVENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

/// Render one frame; a frame that cannot be encoded goes out as an `error`
/// message without an id, so the client's cursor stays put
fn to_sse(frame: StreamFrame) -> Result<SseEvent, Infallible> {
    let data = match frame.data_json() {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(
                kind = frame.kind(),
                cursor = ?frame.cursor(),
                "Failed to encode frame: {}",
                e
            );
            return to_sse(StreamFrame::error("Failed to load an update"));
        }
    };
    let event = SseEvent::default().event(frame.kind()).data(data);
    Ok(match frame.cursor() {
        Some(cursor) => event.id(cursor.to_string()),
        None => event,
    })
}

// ============================================
// HTTP Handlers
// ============================================

/// GET /v1/updates - Stream realtime updates (SSE)
#[utoipa::path(
    get,
    path = "/v1/updates",
    params(
        UpdatesQuery,
        ("X-Writer-Id" = Option<i64>, Header, description = "Authenticated writer id"),
        ("Last-Event-ID" = Option<i64>, Header, description = "Resume cursor when lastEventId is absent")
    ),
    responses(
        (status = 200, description = "Update stream", content_type = "text/event-stream"),
        (status = 400, description = "Invalid filters or writer id", body = ErrorResponse)
    ),
    tag = "updates"
)]
pub async fn stream_updates(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    headers: HeaderMap,
    Query(query): Query<UpdatesQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, (StatusCode, Json<ErrorResponse>)>
{
    let filters = parse_filters(query.filters.as_deref())
        .map_err(|e| ErrorResponse::new(e).into_response(StatusCode::BAD_REQUEST))?;

    let params = ConnectParams {
        last_event_id: resume_cursor(query.last_event_id, &headers),
        viewer,
        root_story_id: query.root_story_id,
        filters,
        search: query.search.filter(|s| !s.trim().is_empty()),
    };

    tracing::info!(
        viewer = ?params.viewer,
        story = ?params.root_story_id,
        last_event_id = ?params.last_event_id,
        "Opening update stream"
    );

    let handle = state.hub.connect(params);
    let stream = ReceiverStream::new(handle.frames).map(to_sse);

    Ok(Sse::new(stream))
}
