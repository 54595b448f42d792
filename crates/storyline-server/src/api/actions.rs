// Action ingestion
// Platform services report a completed action; the publisher turns it into
// durable events and broadcasts them.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use utoipa::ToSchema;

use storyline_core::registry::Field;
use storyline_core::{EventPublisher, PublishError, PublishReport};

use super::common::{ErrorResponse, ListResponse, Viewer};

/// Action input: a flat JSON object keyed by field name (gameId, textId, ...)
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = Object)]
pub struct ActionInput(pub Map<String, Value>);

#[derive(Clone)]
pub struct AppState {
    pub publisher: EventPublisher,
}

impl AppState {
    pub fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/actions", get(list_actions))
        .route("/v1/actions/:action", post(publish_action))
        .with_state(state)
}

/// GET /v1/actions - List registered action names
#[utoipa::path(
    get,
    path = "/v1/actions",
    responses(
        (status = 200, description = "Registered actions", body = ListResponse<String>)
    ),
    tag = "actions"
)]
pub async fn list_actions(State(state): State<AppState>) -> Json<ListResponse<String>> {
    let names = state
        .publisher
        .registry()
        .action_names()
        .into_iter()
        .map(String::from)
        .collect();
    Json(ListResponse::new(names))
}

/// POST /v1/actions/{action} - Record an action and broadcast its events
#[utoipa::path(
    post,
    path = "/v1/actions/{action}",
    params(
        ("action" = String, Path, description = "Action name, e.g. game_closed"),
        ("X-Writer-Id" = Option<i64>, Header, description = "Acting writer; used when the body has no writerId")
    ),
    request_body = ActionInput,
    responses(
        (status = 201, description = "Events appended", body = PublishReport),
        (status = 422, description = "Unknown action or invalid input", body = ErrorResponse),
        (status = 500, description = "Event log unavailable", body = ErrorResponse)
    ),
    tag = "actions"
)]
pub async fn publish_action(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(action): Path<String>,
    Json(ActionInput(mut input)): Json<ActionInput>,
) -> Result<(StatusCode, Json<PublishReport>), (StatusCode, Json<ErrorResponse>)> {
    if let Some(writer_id) = viewer {
        input
            .entry(Field::WriterId.key())
            .or_insert_with(|| Value::from(writer_id));
    }

    match state.publisher.publish_action(&action, &input).await {
        Ok(report) => Ok((StatusCode::CREATED, Json(report))),
        Err(PublishError::Configuration(e)) => {
            tracing::warn!(action = %action, "Rejected action: {}", e);
            Err(ErrorResponse::new(e.to_string()).into_response(StatusCode::UNPROCESSABLE_ENTITY))
        }
        Err(PublishError::Store(e)) => {
            tracing::error!(action = %action, "Failed to append events: {}", e);
            Err(ErrorResponse::new("Failed to record action")
                .into_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}
