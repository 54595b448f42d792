// Core traits for pluggable backends
//
// These traits keep the delivery engine independent of storage and transport:
// - In-memory implementations for tests and dev mode (see `memory`)
// - PostgreSQL / Redis implementations in the server crate

use async_trait::async_trait;
use std::ops::ControlFlow;
use tokio_util::sync::CancellationToken;

use crate::error::{BroadcastError, StoreError};
use crate::event::{Event, EventId, NewEvent, RelatedTable, StoryId, WriterId};
use crate::read_model::{GameState, NodeState, Notification, SearchResult};

// ============================================================================
// EventLog - append-only durable replay source
// ============================================================================

/// Visibility rules applied by `EventLog::read_since`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadScope {
    pub viewer: Option<WriterId>,
    pub story: Option<StoryId>,
    /// Maximum rows per read
    pub limit: usize,
}

impl ReadScope {
    pub const DEFAULT_LIMIT: usize = 500;

    pub fn new(viewer: Option<WriterId>, story: Option<StoryId>) -> Self {
        Self {
            viewer,
            story,
            limit: Self::DEFAULT_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Whether an event is visible in this scope.
    ///
    /// Games are global, texts need a matching story scope (there is no global
    /// text feed), notifications belong to their recipient only.
    pub fn admits(&self, event: &Event) -> bool {
        match event.related_table {
            RelatedTable::Game => true,
            RelatedTable::Text => self.story.is_some() && event.story_id == self.story,
            RelatedTable::Notification => {
                self.viewer.is_some() && event.writer_id == self.viewer
            }
        }
    }
}

/// Append-only store of emitted events
///
/// Implementations must assign strictly increasing ids and never mutate or
/// delete a row once written.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append rows atomically; returns the persisted events in input order
    async fn append(&self, rows: Vec<NewEvent>) -> Result<Vec<Event>, StoreError>;

    /// Events with `id > cursor` visible in `scope`, ascending by id
    async fn read_since(&self, cursor: EventId, scope: &ReadScope)
        -> Result<Vec<Event>, StoreError>;

    /// Highest assigned id, `None` for an empty log
    async fn max_id(&self) -> Result<Option<EventId>, StoreError>;
}

// ============================================================================
// Broadcaster - publish/subscribe transport
// ============================================================================

/// Callback invoked for each message a subscription receives
#[async_trait]
pub trait MessageHandler: Send {
    /// Handle one raw message. `Break` ends the subscription.
    async fn on_message(&mut self, channel: &str, raw: &str) -> ControlFlow<()>;
}

/// Publish/subscribe transport
///
/// The engine works without one (only slower): when `is_available` is false,
/// sessions poll the event log instead.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Whether the transport can be used right now
    async fn is_available(&self) -> bool;

    /// Publish a message; returns how many subscribers received it
    async fn publish(&self, channel: &str, message: &str) -> Result<usize, BroadcastError>;

    /// Deliver messages on `channels` to `handler` until the transport ends,
    /// the handler breaks, or `cancel` fires.
    ///
    /// Returns `Ok(())` on handler break or cancellation, and
    /// `Err(TransportFailure)` when the underlying connection drops.
    async fn subscribe(
        &self,
        channels: &[String],
        handler: &mut dyn MessageHandler,
        cancel: CancellationToken,
    ) -> Result<(), BroadcastError>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

// ============================================================================
// ReadModel - narrow read API onto the platform's entities
// ============================================================================

/// Read access to the current state of games, texts and notifications.
///
/// The platform owns these entities; the engine only reads them when turning
/// an event into a client payload.
#[async_trait]
pub trait ReadModel: Send + Sync {
    async fn game(&self, game_id: i64) -> anyhow::Result<Option<GameState>>;

    /// Node state with permissions computed for `viewer`
    async fn node(&self, text_id: i64, viewer: Option<WriterId>)
        -> anyhow::Result<Option<NodeState>>;

    async fn notification(&self, notification_id: i64) -> anyhow::Result<Option<Notification>>;

    /// Texts in a story matching a free-text term
    async fn search(&self, story: StoryId, term: &str) -> anyhow::Result<Vec<SearchResult>>;
}
