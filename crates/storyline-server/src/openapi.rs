// OpenAPI specification generation
//
// Served as JSON at /api-doc/openapi.json.

use crate::api;
use crate::api::{ErrorResponse, ListResponse};
use storyline_core::read_model::NodePermissions;
use storyline_core::{
    Event, GameFilters, GameState, GameStatus, NodeState, Notification, PublishReport,
    RelatedTable, SearchResult, UpdateFrame,
};
use utoipa::OpenApi;

/// OpenAPI documentation for the Storyline realtime API
#[derive(OpenApi)]
#[openapi(
    paths(
        api::updates::stream_updates,
        api::events::list_events,
        api::actions::list_actions,
        api::actions::publish_action,
    ),
    components(
        schemas(
            Event, RelatedTable,
            GameState, GameStatus, GameFilters,
            NodeState, NodePermissions, SearchResult,
            Notification, UpdateFrame, PublishReport,
            api::actions::ActionInput,
            api::updates::UpdatesQuery,
            api::events::EventsQuery,
            ErrorResponse,
            ListResponse<Event>,
            ListResponse<String>,
        )
    ),
    tags(
        (name = "updates", description = "Realtime update stream (SSE)"),
        (name = "events", description = "Event log listing"),
        (name = "actions", description = "Action ingestion")
    ),
    info(
        title = "Storyline Realtime API",
        version = "0.1.0",
        description = "Realtime game, story and notification updates for collaborative writing",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;
