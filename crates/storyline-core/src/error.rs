// Error types for the realtime engine
//
// Each seam has its own error enum so callers can tell a configuration problem
// (bad action input) from a transient transport or storage failure.

use thiserror::Error;

use crate::event::RelatedTable;

/// Errors produced while expanding an action into event rows.
///
/// All variants are configuration errors: they are fatal to the single action
/// and never affect open streams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No descriptor is registered under this action name
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// A required input field was absent
    #[error("action '{action}' is missing required field '{field}'")]
    MissingRequiredField { action: String, field: String },

    /// A field was present but had the wrong shape
    #[error("action '{action}' has invalid field '{field}': {reason}")]
    InvalidField {
        action: String,
        field: String,
        reason: String,
    },

    /// A descriptor references a field it does not require
    #[error("descriptor for '{action}' emits field '{field}' that is not required")]
    InvalidDescriptor { action: String, field: String },
}

/// Event log errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Publish/subscribe transport errors
#[derive(Debug, Clone, Error)]
pub enum BroadcastError {
    /// The transport is not reachable; callers fall back to polling
    #[error("broadcaster unavailable")]
    Unavailable,

    /// The transport dropped while a subscription was active
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A message could not be encoded or decoded
    #[error("invalid broadcast message: {0}")]
    Serialization(String),
}

/// Errors raised while hydrating an event into a client payload
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The read model failed to fetch the entity
    #[error("failed to resolve {table} {id}: {reason}")]
    Fetch {
        table: RelatedTable,
        id: i64,
        reason: String,
    },

    /// Search results could not be computed
    #[error("search failed: {0}")]
    Search(String),
}

/// Errors raised by the action-to-event boundary
#[derive(Debug, Error)]
pub enum PublishError {
    /// The action input did not satisfy its descriptor
    #[error(transparent)]
    Configuration(#[from] RegistryError),

    /// The rows could not be appended to the log
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced inside a delivery session loop
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl RegistryError {
    pub fn missing(action: impl Into<String>, field: impl Into<String>) -> Self {
        RegistryError::MissingRequiredField {
            action: action.into(),
            field: field.into(),
        }
    }

    pub fn invalid(
        action: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        RegistryError::InvalidField {
            action: action.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl StoreError {
    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        StoreError::Database(msg.into())
    }
}

impl BroadcastError {
    /// Create a transport failure
    pub fn transport(msg: impl Into<String>) -> Self {
        BroadcastError::TransportFailure(msg.into())
    }
}

impl DeliveryError {
    /// Message shown to the client in an `error` frame.
    ///
    /// Keeps storage and transport internals out of the stream.
    pub fn client_message(&self) -> &'static str {
        match self {
            DeliveryError::Store(_) => "Failed to read updates, retrying",
            DeliveryError::Broadcast(_) => "Realtime transport interrupted",
            DeliveryError::Resolve(_) => "Failed to load an update",
        }
    }
}
