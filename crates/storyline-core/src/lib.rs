// Realtime Update Engine
//
// This crate provides a DB-agnostic engine that turns platform actions into
// durable events and streams them to connected writers.
//
// Key design decisions:
// - Uses traits (EventLog, Broadcaster, ReadModel) for pluggable backends
// - The event log is the source of truth; the broadcaster is an optional accelerator
// - Each connected client gets one DeliverySession task (push or poll, fixed at connect)
// - Clients resume from the last event id they saw; sessions dedup per event
// - Payloads are always re-resolved from the read model, never taken from broadcasts
// - Registry actions are tagged variants with static emission tables

// Domain types
pub mod error;
pub mod event;
pub mod frames;
pub mod read_model;

// Action -> event rows
pub mod registry;

// Routing, resolution and delivery
pub mod channels;
pub mod dedup;
pub mod hub;
pub mod publisher;
pub mod resolver;
pub mod session;
pub mod traits;

// Logging setup
pub mod telemetry;

// In-memory implementations for dev mode and testing
pub mod memory;

// Re-exports for convenience
pub use channels::{ChannelRouter, ChannelSet};
pub use error::{BroadcastError, DeliveryError, PublishError, RegistryError, ResolveError, StoreError};
pub use event::{BroadcastMessage, Event, EventId, EventRef, NewEvent, RelatedTable};
pub use frames::{StreamFrame, UpdateFrame};
pub use hub::{SessionHandle, UpdateHub};
pub use publisher::{EventPublisher, PublishReport};
pub use read_model::{GameFilters, GameState, GameStatus, NodeState, Notification, SearchResult};
pub use registry::{Action, EventTypeRegistry};
pub use resolver::{ResolvedUpdate, UpdateResolver, ViewerContext};
pub use session::{
    CloseReason, ConnectParams, DeliveryMode, DeliverySession, SessionConfig, SessionOutcome,
};
pub use traits::{Broadcaster, EventLog, MessageHandler, ReadModel, ReadScope};
