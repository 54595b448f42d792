// Stream frames
//
// Every frame a session writes to its client. The server renders these as
// text/event-stream messages: `event: <kind>`, `data: <json>`, and an `id:`
// line carrying the resumption cursor on data frames.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::EventId;
use crate::read_model::{GameState, NodeState, Notification, SearchResult};

pub const UPDATE: &str = "update";
pub const NOTIFICATION_UPDATE: &str = "notificationUpdate";
pub const KEEPALIVE: &str = "keepalive";
pub const ERROR: &str = "error";
pub const TIMEOUT: &str = "timeout";

/// Body of an `update` frame
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct UpdateFrame {
    pub modified_games: Vec<GameState>,
    pub modified_nodes: Vec<NodeState>,
    pub search_results: Vec<SearchResult>,
}

impl UpdateFrame {
    /// Add a game, replacing an earlier entry for the same game
    pub fn push_game(&mut self, game: GameState) {
        self.modified_games.retain(|g| g.id != game.id);
        self.modified_games.push(game);
    }

    /// Add a node, replacing an earlier entry for the same node
    pub fn push_node(&mut self, node: NodeState) {
        self.modified_nodes.retain(|n| n.id != node.id);
        self.modified_nodes.push(node);
    }

    pub fn has_modifications(&self) -> bool {
        !self.modified_games.is_empty() || !self.modified_nodes.is_empty()
    }
}

#[derive(Debug, Serialize)]
struct KeepaliveBody {
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct MessageBody<'a> {
    message: &'a str,
}

/// A complete frame. Frames are built fully before being written.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Update {
        data: UpdateFrame,
        cursor: EventId,
    },
    NotificationUpdate {
        data: Vec<Notification>,
        cursor: EventId,
    },
    Keepalive {
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
    Timeout {
        message: String,
    },
}

impl StreamFrame {
    pub fn keepalive() -> Self {
        StreamFrame::Keepalive {
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamFrame::Error {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        StreamFrame::Timeout {
            message: message.into(),
        }
    }

    /// SSE event name
    pub fn kind(&self) -> &'static str {
        match self {
            StreamFrame::Update { .. } => UPDATE,
            StreamFrame::NotificationUpdate { .. } => NOTIFICATION_UPDATE,
            StreamFrame::Keepalive { .. } => KEEPALIVE,
            StreamFrame::Error { .. } => ERROR,
            StreamFrame::Timeout { .. } => TIMEOUT,
        }
    }

    /// Resumption cursor the client should send back after this frame
    pub fn cursor(&self) -> Option<EventId> {
        match self {
            StreamFrame::Update { cursor, .. } | StreamFrame::NotificationUpdate { cursor, .. } => {
                Some(*cursor)
            }
            _ => None,
        }
    }

    /// JSON body of the `data:` line
    pub fn data_json(&self) -> serde_json::Result<String> {
        match self {
            StreamFrame::Update { data, .. } => serde_json::to_string(data),
            StreamFrame::NotificationUpdate { data, .. } => serde_json::to_string(data),
            StreamFrame::Keepalive { timestamp } => serde_json::to_string(&KeepaliveBody {
                timestamp: *timestamp,
            }),
            StreamFrame::Error { message } | StreamFrame::Timeout { message } => {
                serde_json::to_string(&MessageBody { message })
            }
        }
    }
}
