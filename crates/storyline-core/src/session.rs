// Delivery session
// Decision: One task per connected client; frames leave through a bounded mpsc channel
// Decision: Mode (push | poll) is fixed at connect and never changes mid-session
// Decision: A push message is only a wake-up; both modes read the log forward
// from the cursor and share `deliver`, so a row that was never broadcast is
// still delivered and ids at or below the cursor never come back
// Decision: Frames carry the id of the last event they cover, so a reconnect
// with that id neither skips nor repeats an event
//
// Lifecycle: Connecting -> Pushing | Polling -> Closed
//
// Only client disconnect, server shutdown, transport failure (push mode) and
// the max session duration end a session. Read and resolve errors are
// reported to the client as `error` frames and the loop keeps going.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::channels::{ChannelRouter, ChannelSet};
use crate::dedup::{DedupKey, RecentSet, DEFAULT_DEDUP_CAPACITY};
use crate::error::{BroadcastError, DeliveryError, ResolveError, StoreError};
use crate::event::{BroadcastMessage, Event, EventId, EventRef, StoryId, WriterId};
use crate::frames::{StreamFrame, UpdateFrame};
use crate::read_model::{GameFilters, Notification};
use crate::resolver::{ResolvedUpdate, UpdateResolver, ViewerContext};
use crate::traits::{Broadcaster, EventLog, MessageHandler, ReadScope};

// ============================================================================
// Configuration
// ============================================================================

/// Session timing and sizing
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Delay between log reads in poll mode
    pub poll_interval: Duration,

    /// Time between keepalive frames
    pub keepalive_interval: Duration,

    /// Sessions are closed with a `timeout` frame after this long
    pub max_duration: Duration,

    /// Wait after a failed log read before retrying
    pub error_backoff: Duration,

    /// Identities remembered for deduplication
    pub dedup_capacity: usize,

    /// Maximum rows per log read
    pub read_batch_limit: usize,

    /// Use the broadcaster when it is available
    pub use_broadcaster: bool,

    /// Frames buffered between the session and the client writer
    pub frame_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(30),
            max_duration: Duration::from_secs(300),
            error_backoff: Duration::from_secs(5),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            read_batch_limit: ReadScope::DEFAULT_LIMIT,
            use_broadcaster: true,
            frame_buffer: 32,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = duration;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity.max(1);
        self
    }

    pub fn with_read_batch_limit(mut self, limit: usize) -> Self {
        self.read_batch_limit = limit.max(1);
        self
    }

    pub fn with_use_broadcaster(mut self, enabled: bool) -> Self {
        self.use_broadcaster = enabled;
        self
    }

    pub fn with_frame_buffer(mut self, size: usize) -> Self {
        self.frame_buffer = size.max(1);
        self
    }
}

// ============================================================================
// Connection parameters and outcome
// ============================================================================

/// What a client sends when it opens the stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectParams {
    /// Cursor from a previous session; values <= 0 start at the log tail
    pub last_event_id: Option<EventId>,
    pub viewer: Option<WriterId>,
    pub root_story_id: Option<StoryId>,
    pub filters: GameFilters,
    pub search: Option<String>,
}

impl ConnectParams {
    pub fn viewer_context(&self) -> ViewerContext {
        ViewerContext {
            viewer: self.viewer,
            story: self.root_story_id,
            filters: self.filters.clone(),
            search: self.search.clone(),
        }
    }

    pub fn read_scope(&self, limit: usize) -> ReadScope {
        ReadScope::new(self.viewer, self.root_story_id).with_limit(limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Push,
    Poll,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Push => "push",
            DeliveryMode::Poll => "poll",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Pushing,
    Polling,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away
    Disconnected,
    /// Server shutdown
    Cancelled,
    /// Max session duration reached
    Timeout,
    /// The push transport dropped
    TransportFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub reason: CloseReason,
    pub mode: DeliveryMode,
    /// Last event id covered by the session
    pub cursor: EventId,
    pub frames_sent: usize,
}

/// Result of one step; `Err` ends the session
type Step = Result<(), CloseReason>;

// ============================================================================
// DeliverySession
// ============================================================================

pub struct DeliverySession {
    id: Uuid,
    params: ConnectParams,
    ctx: ViewerContext,
    channels: ChannelSet,
    log: Arc<dyn EventLog>,
    broadcaster: Arc<dyn Broadcaster>,
    resolver: UpdateResolver,
    config: SessionConfig,
    tx: mpsc::Sender<StreamFrame>,
    cancel: CancellationToken,
    cursor: EventId,
    sent: RecentSet<DedupKey>,
    state: SessionState,
    started_at: Instant,
    last_keepalive_at: Instant,
    frames_sent: usize,
}

impl DeliverySession {
    pub fn new(
        params: ConnectParams,
        log: Arc<dyn EventLog>,
        broadcaster: Arc<dyn Broadcaster>,
        resolver: UpdateResolver,
        config: SessionConfig,
        tx: mpsc::Sender<StreamFrame>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::now_v7(),
            ctx: params.viewer_context(),
            channels: ChannelRouter::route(params.viewer, params.root_story_id),
            sent: RecentSet::new(config.dedup_capacity),
            params,
            log,
            broadcaster,
            resolver,
            config,
            tx,
            cancel,
            cursor: 0,
            state: SessionState::Connecting,
            started_at: now,
            last_keepalive_at: now,
            frames_sent: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// Drive the session to completion
    #[instrument(
        name = "delivery_session",
        skip(self),
        fields(
            session_id = %self.id,
            viewer = ?self.params.viewer,
            story = ?self.params.root_story_id
        )
    )]
    pub async fn run(mut self) -> SessionOutcome {
        let mode = if self.config.use_broadcaster && self.broadcaster.is_available().await {
            DeliveryMode::Push
        } else {
            DeliveryMode::Poll
        };
        info!(
            mode = mode.as_str(),
            broadcaster = self.broadcaster.name(),
            channels = ?self.channels.channels(),
            "Session connecting"
        );

        let reason = match mode {
            DeliveryMode::Push => self.run_push().await,
            DeliveryMode::Poll => self.run_poll().await,
        };

        self.set_state(SessionState::Closed);
        info!(
            reason = ?reason,
            cursor = self.cursor,
            frames_sent = self.frames_sent,
            "Session closed"
        );

        SessionOutcome {
            reason,
            mode,
            cursor: self.cursor,
            frames_sent: self.frames_sent,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(from = ?self.state, to = ?state, "Session state change");
        self.state = state;
    }

    // ------------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------------

    /// Seed the cursor, then replay everything after it
    async fn connect(&mut self) -> Step {
        self.cursor = match self.params.last_event_id.filter(|id| *id > 0) {
            Some(id) => id,
            None => loop {
                match self.log.max_id().await {
                    Ok(tail) => break tail.unwrap_or(0),
                    Err(e) => self.report_read_error(e).await?,
                }
            },
        };
        debug!(cursor = self.cursor, "Cursor seeded");

        self.catch_up().await
    }

    /// Read pages until the log is drained
    async fn catch_up(&mut self) -> Step {
        let scope = self.params.read_scope(self.config.read_batch_limit);
        loop {
            match self.log.read_since(self.cursor, &scope).await {
                Ok(batch) => {
                    let full_page = batch.len() >= scope.limit;
                    self.deliver_events(&batch).await?;
                    if !full_page {
                        return Ok(());
                    }
                }
                Err(e) => self.report_read_error(e).await?,
            }
        }
    }

    // ------------------------------------------------------------------------
    // Push mode
    // ------------------------------------------------------------------------

    async fn run_push(&mut self) -> CloseReason {
        let subscription_cancel = self.cancel.child_token();
        let (ref_tx, mut ref_rx) = mpsc::channel(self.config.frame_buffer);

        // Subscribe before catching up so nothing published in between is lost
        let subscription = self.spawn_subscription(ref_tx, subscription_cancel.clone());

        if let Err(reason) = self.connect().await {
            subscription_cancel.cancel();
            return reason;
        }
        self.set_state(SessionState::Pushing);

        let cancel = self.cancel.clone();
        let tx = self.tx.clone();
        let deadline = self.started_at + self.config.max_duration;

        let reason = loop {
            let keepalive_at = self.last_keepalive_at + self.config.keepalive_interval;
            tokio::select! {
                _ = cancel.cancelled() => break CloseReason::Cancelled,
                _ = tx.closed() => break CloseReason::Disconnected,
                _ = sleep_until(deadline) => break self.expire().await,
                _ = sleep_until(keepalive_at) => {
                    if let Err(reason) = self.keepalive().await {
                        break reason;
                    }
                }
                next = ref_rx.recv() => match next {
                    Some(event_ref) => {
                        if let Err(reason) = self.wake(event_ref, &mut ref_rx).await {
                            break reason;
                        }
                    }
                    None => break self.transport_lost(subscription).await,
                },
            }
        };

        subscription_cancel.cancel();
        reason
    }

    /// Reconcile against the log after a broadcast message.
    ///
    /// Queued messages are coalesced into one read. Messages without an event
    /// id have no row to read back and are delivered as they are.
    async fn wake(&mut self, first: EventRef, refs: &mut mpsc::Receiver<EventRef>) -> Step {
        let mut woken = vec![first];
        while let Ok(event_ref) = refs.try_recv() {
            woken.push(event_ref);
        }
        let (logged, synthesized): (Vec<_>, Vec<_>) =
            woken.into_iter().partition(|r| r.event_id.is_some());
        trace!(
            logged = logged.len(),
            synthesized = synthesized.len(),
            cursor = self.cursor,
            "Push wake-up"
        );

        if !logged.is_empty() {
            self.catch_up().await?;
        }
        if synthesized.is_empty() {
            return Ok(());
        }
        self.deliver(synthesized).await
    }

    fn spawn_subscription(
        &self,
        refs: mpsc::Sender<EventRef>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), BroadcastError>> {
        let broadcaster = self.broadcaster.clone();
        let channels = self.channels.clone();
        tokio::spawn(async move {
            let mut handler = PushHandler { channels, refs };
            let names = handler.channels.channels();
            broadcaster.subscribe(&names, &mut handler, cancel).await
        })
    }

    /// The subscription ended on its own: report and close
    async fn transport_lost(
        &mut self,
        subscription: JoinHandle<Result<(), BroadcastError>>,
    ) -> CloseReason {
        if self.cancel.is_cancelled() {
            return CloseReason::Cancelled;
        }

        let err = match subscription.await {
            Ok(Err(e)) => e,
            Ok(Ok(())) => BroadcastError::transport("subscription ended"),
            Err(e) => BroadcastError::transport(format!("subscription task failed: {}", e)),
        };
        warn!(error = %err, cursor = self.cursor, "Push transport lost, closing session");

        let message = DeliveryError::from(err).client_message();
        // Closing either way; a failed send only means the client is gone too
        let _ = self.send(StreamFrame::error(message)).await;
        CloseReason::TransportFailure
    }

    // ------------------------------------------------------------------------
    // Poll mode
    // ------------------------------------------------------------------------

    async fn run_poll(&mut self) -> CloseReason {
        if let Err(reason) = self.connect().await {
            return reason;
        }
        self.set_state(SessionState::Polling);

        loop {
            if let Err(reason) = self.poll_once().await {
                return reason;
            }
        }
    }

    async fn poll_once(&mut self) -> Step {
        if self.cancel.is_cancelled() {
            return Err(CloseReason::Cancelled);
        }
        if self.tx.is_closed() {
            return Err(CloseReason::Disconnected);
        }
        if self.started_at.elapsed() >= self.config.max_duration {
            return Err(self.expire().await);
        }
        if self.last_keepalive_at.elapsed() >= self.config.keepalive_interval {
            self.keepalive().await?;
        }

        let scope = self.params.read_scope(self.config.read_batch_limit);
        match self.log.read_since(self.cursor, &scope).await {
            Ok(batch) => {
                trace!(cursor = self.cursor, count = batch.len(), "Polled event log");
                self.deliver_events(&batch).await?;
                self.pause(self.config.poll_interval).await
            }
            Err(e) => self.report_read_error(e).await,
        }
    }

    // ------------------------------------------------------------------------
    // Shared delivery
    // ------------------------------------------------------------------------

    async fn deliver_events(&mut self, batch: &[Event]) -> Step {
        if batch.is_empty() {
            return Ok(());
        }
        self.deliver(batch.iter().map(Event::event_ref).collect()).await
    }

    /// Resolve, dedup and emit one batch of refs (ascending by id)
    async fn deliver(&mut self, refs: Vec<EventRef>) -> Step {
        let mut batch_cursor = self.cursor;
        let mut resolved: Vec<(EventId, ResolvedUpdate)> = Vec::new();

        for event_ref in refs {
            if let Some(id) = event_ref.event_id {
                batch_cursor = batch_cursor.max(id);
            }

            let key = DedupKey::for_ref(&event_ref);
            if self.sent.contains(&key) {
                trace!(key = ?key, "Skipping already delivered event");
                continue;
            }

            match self.resolver.resolve(&event_ref, &self.ctx).await {
                Ok(Some(update)) => {
                    self.sent.insert(key);
                    resolved.push((batch_cursor, update));
                }
                Ok(None) => {
                    self.sent.insert(key);
                }
                Err(e) => {
                    // The update is skipped; the cursor still moves past it
                    self.report_resolve_error(e).await?;
                }
            }
        }

        let frames = self.build_frames(resolved, batch_cursor).await?;
        for frame in frames {
            let cursor = frame.cursor();
            self.send(frame).await?;
            if let Some(cursor) = cursor {
                self.cursor = self.cursor.max(cursor);
            }
        }
        self.cursor = self.cursor.max(batch_cursor);
        Ok(())
    }

    /// Group consecutive updates into frames, in event order.
    ///
    /// Each frame's cursor is the last event id it covers; the final frame
    /// carries the batch cursor.
    async fn build_frames(
        &mut self,
        resolved: Vec<(EventId, ResolvedUpdate)>,
        batch_cursor: EventId,
    ) -> Result<Vec<StreamFrame>, CloseReason> {
        let mut assembler = FrameAssembler::default();
        for (cursor, update) in resolved {
            assembler.push(update, cursor);
        }
        let mut frames = assembler.finish(batch_cursor);

        let needs_search = frames
            .iter()
            .any(|f| matches!(f, StreamFrame::Update { data, .. } if data.has_modifications()));
        if needs_search {
            match self.resolver.search(&self.ctx).await {
                Ok(results) => {
                    let last_update = frames.iter_mut().rev().find_map(|f| match f {
                        StreamFrame::Update { data, .. } => Some(data),
                        _ => None,
                    });
                    if let Some(data) = last_update {
                        data.search_results = results;
                    }
                }
                Err(e) => self.report_resolve_error(e).await?,
            }
        }

        Ok(frames)
    }

    // ------------------------------------------------------------------------
    // Frame output
    // ------------------------------------------------------------------------

    async fn send(&mut self, frame: StreamFrame) -> Step {
        let kind = frame.kind();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CloseReason::Cancelled),
            result = self.tx.send(frame) => {
                result.map_err(|_| CloseReason::Disconnected)?;
                self.frames_sent += 1;
                trace!(kind, cursor = self.cursor, "Frame sent");
                Ok(())
            }
        }
    }

    async fn keepalive(&mut self) -> Step {
        self.last_keepalive_at = Instant::now();
        self.send(StreamFrame::keepalive()).await
    }

    async fn expire(&mut self) -> CloseReason {
        info!(cursor = self.cursor, "Max session duration reached");
        match self
            .send(StreamFrame::timeout("Session expired, please reconnect"))
            .await
        {
            Ok(()) => CloseReason::Timeout,
            Err(reason) => reason,
        }
    }

    /// Sleep unless the client leaves, the server shuts down or the session
    /// runs out of time
    async fn pause(&mut self, duration: Duration) -> Step {
        let deadline = self.started_at + self.config.max_duration;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CloseReason::Cancelled),
            _ = self.tx.closed() => Err(CloseReason::Disconnected),
            _ = sleep_until(deadline) => Err(self.expire().await),
            _ = sleep(duration) => Ok(()),
        }
    }

    async fn report_read_error(&mut self, err: StoreError) -> Step {
        warn!(
            error = %err,
            cursor = self.cursor,
            backoff_ms = self.config.error_backoff.as_millis() as u64,
            "Event log read failed, retrying"
        );
        let message = DeliveryError::from(err).client_message();
        self.send(StreamFrame::error(message)).await?;
        self.pause(self.config.error_backoff).await
    }

    async fn report_resolve_error(&mut self, err: ResolveError) -> Step {
        warn!(error = %err, cursor = self.cursor, "Failed to resolve update");
        let message = DeliveryError::from(err).client_message();
        self.send(StreamFrame::error(message)).await
    }
}

// ============================================================================
// Frame assembly
// ============================================================================

/// Builds frames from resolved updates; at most one frame is open at a time
#[derive(Default)]
struct FrameAssembler {
    frames: Vec<StreamFrame>,
    update: Option<UpdateFrame>,
    notifications: Option<Vec<Notification>>,
    cursor: EventId,
}

impl FrameAssembler {
    fn push(&mut self, update: ResolvedUpdate, cursor: EventId) {
        match update {
            ResolvedUpdate::Game(game) => self.open_update().push_game(game),
            ResolvedUpdate::Node(node) => self.open_update().push_node(node),
            ResolvedUpdate::Notification(n) => self.open_notifications().push(n),
        }
        self.cursor = cursor;
    }

    fn open_update(&mut self) -> &mut UpdateFrame {
        if self.notifications.is_some() {
            self.flush();
        }
        self.update.get_or_insert_with(UpdateFrame::default)
    }

    fn open_notifications(&mut self) -> &mut Vec<Notification> {
        if self.update.is_some() {
            self.flush();
        }
        self.notifications.get_or_insert_with(Vec::new)
    }

    fn flush(&mut self) {
        let cursor = self.cursor;
        if let Some(data) = self.update.take() {
            self.frames.push(StreamFrame::Update { data, cursor });
        }
        if let Some(data) = self.notifications.take() {
            self.frames.push(StreamFrame::NotificationUpdate { data, cursor });
        }
    }

    fn finish(mut self, batch_cursor: EventId) -> Vec<StreamFrame> {
        self.cursor = batch_cursor;
        self.flush();
        self.frames
    }
}

// ============================================================================
// PushHandler
// ============================================================================

/// Forwards broadcast messages into the session loop
struct PushHandler {
    channels: ChannelSet,
    refs: mpsc::Sender<EventRef>,
}

#[async_trait]
impl MessageHandler for PushHandler {
    async fn on_message(&mut self, channel: &str, raw: &str) -> ControlFlow<()> {
        if !self.channels.contains(channel) {
            trace!(channel, "Ignoring message on unsubscribed channel");
            return ControlFlow::Continue(());
        }

        let event_ref = match BroadcastMessage::decode(raw) {
            Ok(message) => message.into_ref(),
            Err(e) => {
                warn!(channel, error = %e, "Dropping malformed broadcast message");
                return ControlFlow::Continue(());
            }
        };

        match self.refs.send(event_ref).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}
