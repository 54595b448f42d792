// Common DTOs and extractors for the public API

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use storyline_core::event::WriterId;

/// Header carrying the authenticated writer id, set by the upstream auth layer
pub const WRITER_ID_HEADER: &str = "x-writer-id";

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    /// Convert to axum response tuple
    pub fn into_response(self, status: StatusCode) -> (StatusCode, Json<Self>) {
        (status, Json(self))
    }
}

/// Response wrapper for list endpoints.
/// All list endpoints return responses wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    /// Array of items returned by the list operation.
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// The writer making the request, if signed in.
///
/// Missing header means anonymous. A header that is not a positive integer is
/// rejected with 400.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Viewer(pub Option<WriterId>);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Viewer
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(raw) = parts.headers.get(WRITER_ID_HEADER) else {
            return Ok(Viewer(None));
        };

        raw.to_str()
            .ok()
            .and_then(|s| s.trim().parse::<WriterId>().ok())
            .filter(|id| *id > 0)
            .map(|id| Viewer(Some(id)))
            .ok_or_else(|| {
                ErrorResponse::new("Invalid X-Writer-Id header").into_response(StatusCode::BAD_REQUEST)
            })
    }
}
