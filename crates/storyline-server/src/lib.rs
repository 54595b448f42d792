// Storyline Server Library
// Decision: Shared library for the binary and router tests
// Decision: Backends are picked once at startup; a missing Redis degrades to polling, not to a crash

pub mod api;
pub mod config;
pub mod openapi;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use storyline_core::event::EventId;
use storyline_core::memory::{
    InMemoryBroadcaster, InMemoryEventLog, InMemoryReadModel, NoopBroadcaster,
};
use storyline_core::{
    Broadcaster, EventLog, EventPublisher, EventTypeRegistry, ReadModel, SessionConfig, UpdateHub,
};

use crate::config::{BroadcasterKind, ServerConfig};
use crate::openapi::ApiDoc;
use crate::storage::{Database, PostgresEventLog, PostgresReadModel, RedisBroadcaster};

// ============================================
// Services
// ============================================

/// Everything the HTTP layer needs, wired to concrete backends
#[derive(Clone)]
pub struct Services {
    pub hub: UpdateHub,
    pub publisher: EventPublisher,
}

impl Services {
    /// Wire backends from configuration
    pub async fn from_config(config: &ServerConfig) -> Result<Self> {
        let (log, read_model): (Arc<dyn EventLog>, Arc<dyn ReadModel>) =
            match &config.database_url {
                Some(url) => {
                    let db = Database::from_url(url)
                        .await
                        .context("Failed to connect to database")?;
                    db.migrate().await.context("Failed to run migrations")?;
                    tracing::info!("Connected to database");
                    (
                        Arc::new(PostgresEventLog::new(db.pool().clone())),
                        Arc::new(PostgresReadModel::new(db.pool().clone())),
                    )
                }
                None => {
                    tracing::warn!("DATABASE_URL not set, using in-memory storage (dev mode)");
                    (
                        Arc::new(InMemoryEventLog::new()),
                        Arc::new(InMemoryReadModel::new()),
                    )
                }
            };

        let broadcaster: Arc<dyn Broadcaster> = match config.broadcaster {
            BroadcasterKind::Memory => Arc::new(InMemoryBroadcaster::new()),
            BroadcasterKind::Redis => match RedisBroadcaster::connect(&config.redis_url).await {
                Ok(redis) => {
                    tracing::info!("Connected to Redis");
                    Arc::new(redis)
                }
                Err(e) => {
                    tracing::warn!("Redis unavailable ({}), sessions will poll the event log", e);
                    Arc::new(NoopBroadcaster)
                }
            },
            BroadcasterKind::None => Arc::new(NoopBroadcaster),
        };

        Self::with_backends(log, broadcaster, read_model, config.session.clone())
    }

    /// Fully in-memory services (dev mode and tests)
    pub fn in_memory(session: SessionConfig) -> Result<Self> {
        Self::with_backends(
            Arc::new(InMemoryEventLog::new()),
            Arc::new(InMemoryBroadcaster::new()),
            Arc::new(InMemoryReadModel::new()),
            session,
        )
    }

    pub fn with_backends(
        log: Arc<dyn EventLog>,
        broadcaster: Arc<dyn Broadcaster>,
        read_model: Arc<dyn ReadModel>,
        session: SessionConfig,
    ) -> Result<Self> {
        let registry = EventTypeRegistry::builtin().context("Invalid built-in action registry")?;
        let publisher = EventPublisher::new(
            Arc::new(registry),
            log.clone(),
            broadcaster.clone(),
            session.use_broadcaster,
        );
        let hub = UpdateHub::new(log, broadcaster, read_model, session);
        Ok(Self { hub, publisher })
    }
}

// ============================================
// Health
// ============================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    broadcaster: &'static str,
    broadcaster_available: bool,
    latest_event_id: Option<EventId>,
}

/// State for health endpoint
#[derive(Clone)]
struct HealthState {
    hub: UpdateHub,
}

async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    let broadcaster = state.hub.broadcaster();
    let (status, latest_event_id) = match state.hub.log().max_id().await {
        Ok(id) => ("ok", id),
        Err(e) => {
            tracing::warn!("Health check could not read the event log: {}", e);
            ("degraded", None)
        }
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        broadcaster: broadcaster.name(),
        broadcaster_available: broadcaster.is_available().await,
        latest_event_id,
    })
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// ============================================
// Router
// ============================================

/// Build the full application router
pub fn build_app(services: &Services, api_prefix: &str, cors_allowed_origins: &[String]) -> Router {
    let updates_state = api::updates::AppState::new(services.hub.clone());
    let events_state = api::events::AppState::new(
        services.hub.log().clone(),
        services.hub.config().read_batch_limit,
    );
    let actions_state = api::actions::AppState::new(services.publisher.clone());
    let health_state = HealthState {
        hub: services.hub.clone(),
    };

    let api_routes = Router::new()
        .merge(api::updates::routes(updates_state))
        .merge(api::events::routes(events_state))
        .merge(api::actions::routes(actions_state));

    // Health and the OpenAPI document stay at the root regardless of prefix
    let app = Router::new()
        .route("/health", get(health).with_state(health_state))
        .route("/api-doc/openapi.json", get(openapi_json))
        .merge(build_router_with_prefix(api_routes, api_prefix));

    let cors_origins: Vec<HeaderValue> = cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    // Add CORS layer only if origins are configured
    let app = if !cors_origins.is_empty() {
        app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    header::ORIGIN,
                    header::CACHE_CONTROL,
                    header::HeaderName::from_static("last-event-id"),
                    header::HeaderName::from_static(api::common::WRITER_ID_HEADER),
                ])
                .allow_credentials(true),
        )
    } else {
        app
    };

    app.layer(TraceLayer::new_for_http())
}

/// Build router with optional API prefix
pub fn build_router_with_prefix<S: Clone + Send + Sync + 'static>(
    api_routes: Router<S>,
    api_prefix: &str,
) -> Router<S> {
    if api_prefix.is_empty() {
        api_routes
    } else {
        Router::new().nest(api_prefix, api_routes)
    }
}
