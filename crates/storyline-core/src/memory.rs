// In-memory implementations for tests and dev mode
// Decision: Use parking_lot for thread-safe access (never held across an await)
// Decision: One tokio broadcast channel per pub/sub channel name
//
// These keep all data in memory, making them suitable for:
// - Unit and integration tests
// - Running the server without PostgreSQL or Redis

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;

use crate::error::{BroadcastError, StoreError};
use crate::event::{Event, EventId, NewEvent, StoryId, WriterId};
use crate::read_model::{
    GameState, GameStatus, NodePermissions, NodeState, Notification, SearchResult,
};
use crate::traits::{Broadcaster, EventLog, MessageHandler, ReadModel, ReadScope};

// ============================================================================
// InMemoryEventLog
// ============================================================================

/// Vec-backed event log; ids start at 1
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    events: RwLock<Vec<Event>>,
    failing: AtomicBool,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail (for testing retry paths)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::database("simulated event log failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, rows: Vec<NewEvent>) -> Result<Vec<Event>, StoreError> {
        self.check()?;

        let mut events = self.events.write();
        let mut next_id = events.last().map(|e| e.id).unwrap_or(0) + 1;
        let now = Utc::now();

        let appended: Vec<Event> = rows
            .into_iter()
            .map(|row| {
                let event = Event::from_new(next_id, row, now);
                next_id += 1;
                event
            })
            .collect();
        events.extend(appended.iter().cloned());

        Ok(appended)
    }

    async fn read_since(
        &self,
        cursor: EventId,
        scope: &ReadScope,
    ) -> Result<Vec<Event>, StoreError> {
        self.check()?;

        let events = self.events.read();
        let start = events.partition_point(|e| e.id <= cursor);
        Ok(events[start..]
            .iter()
            .filter(|e| scope.admits(e))
            .take(scope.limit)
            .cloned()
            .collect())
    }

    async fn max_id(&self) -> Result<Option<EventId>, StoreError> {
        self.check()?;
        Ok(self.events.read().last().map(|e| e.id))
    }
}

// ============================================================================
// InMemoryBroadcaster
// ============================================================================

/// Process-local pub/sub over tokio broadcast channels
pub struct InMemoryBroadcaster {
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
    available: AtomicBool,
}

impl InMemoryBroadcaster {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Per-channel buffer; a subscriber that falls further behind is dropped
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop every channel, ending all active subscriptions
    pub fn disconnect_all(&self) {
        self.channels.write().clear();
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        if let Some(tx) = self.channels.read().get(channel) {
            return tx.clone();
        }
        self.channels
            .write()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broadcaster for InMemoryBroadcaster {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, BroadcastError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BroadcastError::Unavailable);
        }
        let tx = self.channels.read().get(channel).cloned();
        // send() only fails when nobody is listening
        Ok(tx
            .map(|tx| tx.send(message.to_string()).unwrap_or(0))
            .unwrap_or(0))
    }

    async fn subscribe(
        &self,
        channels: &[String],
        handler: &mut dyn MessageHandler,
        cancel: CancellationToken,
    ) -> Result<(), BroadcastError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BroadcastError::Unavailable);
        }

        let mut streams = StreamMap::new();
        for channel in channels {
            let rx = self.sender(channel).subscribe();
            streams.insert(channel.clone(), BroadcastStream::new(rx));
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = streams.next() => match next {
                    Some((channel, Ok(message))) => {
                        if let ControlFlow::Break(()) = handler.on_message(&channel, &message).await {
                            return Ok(());
                        }
                    }
                    Some((channel, Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                        return Err(BroadcastError::transport(format!(
                            "subscriber lagged {} messages on {}",
                            skipped, channel
                        )));
                    }
                    None => return Err(BroadcastError::transport("all channels closed")),
                },
            }
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// NoopBroadcaster
// ============================================================================

/// Broadcaster that is never available; sessions always poll
#[derive(Debug, Clone, Default)]
pub struct NoopBroadcaster;

#[async_trait]
impl Broadcaster for NoopBroadcaster {
    async fn is_available(&self) -> bool {
        false
    }

    async fn publish(&self, _channel: &str, _message: &str) -> Result<usize, BroadcastError> {
        Err(BroadcastError::Unavailable)
    }

    async fn subscribe(
        &self,
        _channels: &[String],
        _handler: &mut dyn MessageHandler,
        _cancel: CancellationToken,
    ) -> Result<(), BroadcastError> {
        Err(BroadcastError::Unavailable)
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

// ============================================================================
// InMemoryReadModel
// ============================================================================

#[derive(Debug, Clone)]
struct NodeRecord {
    id: i64,
    root_story_id: StoryId,
    parent_id: Option<i64>,
    writer_id: WriterId,
    summary: String,
    vote_count: i64,
    voters: Vec<WriterId>,
    annotation_count: i64,
    deleted: bool,
    updated_at: chrono::DateTime<Utc>,
}

impl NodeRecord {
    fn to_state(&self, viewer: Option<WriterId>) -> NodeState {
        NodeState {
            id: self.id,
            root_story_id: self.root_story_id,
            parent_id: self.parent_id,
            writer_id: self.writer_id,
            summary: self.summary.clone(),
            vote_count: self.vote_count,
            annotation_count: self.annotation_count,
            deleted: self.deleted,
            updated_at: self.updated_at,
            permissions: NodePermissions::for_viewer(
                self.writer_id,
                self.deleted,
                viewer,
                viewer.is_some_and(|v| self.voters.contains(&v)),
            ),
        }
    }
}

const SNIPPET_CHARS: usize = 120;

/// HashMap-backed read model with seeding helpers
#[derive(Debug, Default)]
pub struct InMemoryReadModel {
    games: RwLock<HashMap<i64, GameState>>,
    nodes: RwLock<HashMap<i64, NodeRecord>>,
    notifications: RwLock<HashMap<i64, Notification>>,
    failing: AtomicBool,
}

impl InMemoryReadModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail (for testing resolver errors)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn upsert_game(
        &self,
        id: i64,
        text_id: i64,
        title: &str,
        status: GameStatus,
        writer_ids: Vec<WriterId>,
    ) {
        self.games.write().insert(
            id,
            GameState {
                id,
                text_id,
                title: title.to_string(),
                status,
                writer_ids,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn upsert_node(
        &self,
        id: i64,
        root_story_id: StoryId,
        parent_id: Option<i64>,
        writer_id: WriterId,
        summary: &str,
    ) {
        let mut nodes = self.nodes.write();
        let (vote_count, voters, annotation_count) = nodes
            .get(&id)
            .map(|n| (n.vote_count, n.voters.clone(), n.annotation_count))
            .unwrap_or((0, Vec::new(), 0));
        nodes.insert(
            id,
            NodeRecord {
                id,
                root_story_id,
                parent_id,
                writer_id,
                summary: summary.to_string(),
                vote_count,
                voters,
                annotation_count,
                deleted: false,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn add_vote(&self, text_id: i64, voter: WriterId) {
        if let Some(node) = self.nodes.write().get_mut(&text_id) {
            node.vote_count += 1;
            node.voters.push(voter);
            node.updated_at = Utc::now();
        }
    }

    pub fn add_annotation(&self, text_id: i64) {
        if let Some(node) = self.nodes.write().get_mut(&text_id) {
            node.annotation_count += 1;
            node.updated_at = Utc::now();
        }
    }

    pub fn delete_node(&self, text_id: i64) {
        if let Some(node) = self.nodes.write().get_mut(&text_id) {
            node.deleted = true;
            node.updated_at = Utc::now();
        }
    }

    pub fn upsert_notification(&self, id: i64, recipient_id: WriterId, message: &str) {
        self.notifications.write().insert(
            id,
            Notification {
                id,
                recipient_id,
                message: message.to_string(),
                is_read: false,
                created_at: Utc::now(),
            },
        );
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("simulated read model failure");
        }
        Ok(())
    }
}

#[async_trait]
impl ReadModel for InMemoryReadModel {
    async fn game(&self, game_id: i64) -> anyhow::Result<Option<GameState>> {
        self.check()?;
        Ok(self.games.read().get(&game_id).cloned())
    }

    async fn node(
        &self,
        text_id: i64,
        viewer: Option<WriterId>,
    ) -> anyhow::Result<Option<NodeState>> {
        self.check()?;
        Ok(self
            .nodes
            .read()
            .get(&text_id)
            .map(|node| node.to_state(viewer)))
    }

    async fn notification(&self, notification_id: i64) -> anyhow::Result<Option<Notification>> {
        self.check()?;
        Ok(self.notifications.read().get(&notification_id).cloned())
    }

    async fn search(&self, story: StoryId, term: &str) -> anyhow::Result<Vec<SearchResult>> {
        self.check()?;
        let needle = term.to_lowercase();
        let mut results: Vec<SearchResult> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.root_story_id == story && !n.deleted)
            .filter(|n| n.summary.to_lowercase().contains(&needle))
            .map(|n| SearchResult {
                text_id: n.id,
                snippet: n.summary.chars().take(SNIPPET_CHARS).collect(),
            })
            .collect();
        results.sort_by_key(|r| r.text_id);
        Ok(results)
    }
}
