// Event model
//
// An Event is an immutable row in the append-only event log. Its id is assigned
// by the log and doubles as the resumption cursor for delivery sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BroadcastError;

/// Log-assigned event id; strictly increasing
pub type EventId = i64;

/// Writer (user) id
pub type WriterId = i64;

/// Root story id used to scope text updates
pub type StoryId = i64;

// ============================================================================
// RelatedTable
// ============================================================================

/// The kind of entity an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum RelatedTable {
    Game,
    Text,
    Notification,
}

impl RelatedTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelatedTable::Game => "game",
            RelatedTable::Text => "text",
            RelatedTable::Notification => "notification",
        }
    }
}

impl fmt::Display for RelatedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelatedTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "game" => Ok(RelatedTable::Game),
            "text" => Ok(RelatedTable::Text),
            "notification" => Ok(RelatedTable::Notification),
            other => Err(format!("unknown related table: {}", other)),
        }
    }
}

// ============================================================================
// Event rows
// ============================================================================

/// An event row before the log assigns its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub related_table: RelatedTable,
    pub related_id: i64,
    /// Actor, or the recipient for notification rows
    pub writer_id: Option<WriterId>,
    pub event_kind: String,
    /// Root story of a text row
    pub story_id: Option<StoryId>,
    pub payload: serde_json::Value,
}

/// A persisted event row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Event {
    pub id: EventId,
    pub related_table: RelatedTable,
    pub related_id: i64,
    pub writer_id: Option<WriterId>,
    pub event_kind: String,
    pub story_id: Option<StoryId>,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Build a persisted event from a new row and the values the log assigned
    pub fn from_new(id: EventId, row: NewEvent, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            related_table: row.related_table,
            related_id: row.related_id,
            writer_id: row.writer_id,
            event_kind: row.event_kind,
            story_id: row.story_id,
            payload: row.payload,
            created_at,
        }
    }

    /// Reference used by the delivery loop
    pub fn event_ref(&self) -> EventRef {
        EventRef {
            table: self.related_table,
            related_id: self.related_id,
            event_id: Some(self.id),
            kind: Some(self.event_kind.clone()),
            emitted_at: self.created_at,
        }
    }
}

// ============================================================================
// EventRef - what a session needs to resolve an update
// ============================================================================

/// A bare reference to a changed entity.
///
/// Both delivery modes reduce their input to this type: poll mode from log
/// rows, push mode from broadcast messages.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRef {
    pub table: RelatedTable,
    pub related_id: i64,
    /// Log id, when the producer knew it
    pub event_id: Option<EventId>,
    pub kind: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

// ============================================================================
// BroadcastMessage - wire body on pub/sub channels
// ============================================================================

/// Minimal message published on a channel.
///
/// Receivers never render this body; they re-resolve current state.
/// Field names are camelCase on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub table: RelatedTable,
    /// Log id of the triggering event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    pub related_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl BroadcastMessage {
    pub fn from_event(event: &Event) -> Self {
        Self {
            table: event.related_table,
            id: Some(event.id),
            related_id: event.related_id,
            kind: Some(event.event_kind.clone()),
            emitted_at: event.created_at,
        }
    }

    pub fn encode(&self) -> Result<String, BroadcastError> {
        serde_json::to_string(self).map_err(|e| BroadcastError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, BroadcastError> {
        serde_json::from_str(raw).map_err(|e| BroadcastError::Serialization(e.to_string()))
    }

    pub fn into_ref(self) -> EventRef {
        EventRef {
            table: self.table,
            related_id: self.related_id,
            event_id: self.id,
            kind: self.kind,
            emitted_at: self.emitted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> Event {
        Event::from_new(
            42,
            NewEvent {
                related_table: RelatedTable::Text,
                related_id: 7,
                writer_id: Some(3),
                event_kind: "text.added".to_string(),
                story_id: Some(1),
                payload: json!({"textId": 7}),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_related_table_parse() {
        assert_eq!("game".parse::<RelatedTable>(), Ok(RelatedTable::Game));
        assert_eq!(
            "notification".parse::<RelatedTable>(),
            Ok(RelatedTable::Notification)
        );
        assert!("games".parse::<RelatedTable>().is_err());
        assert_eq!(RelatedTable::Text.to_string(), "text");
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(json["id"], 42);
        assert_eq!(json["related_table"], "text");
        assert_eq!(json["event_kind"], "text.added");
        assert_eq!(json["payload"]["textId"], 7);
    }

    #[test]
    fn test_broadcast_message_is_minimal() {
        let message = BroadcastMessage::from_event(&sample_event());
        let raw = message.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["table"], "text");
        assert_eq!(value["id"], 42);
        assert_eq!(value["relatedId"], 7);
        assert!(value["emittedAt"].is_string());
        assert!(value.get("related_id").is_none());
        assert!(value.get("payload").is_none());

        let decoded = BroadcastMessage::decode(&raw).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_broadcast_message_without_id() {
        let raw = r#"{"table":"game","relatedId":9,"emittedAt":"2024-05-01T10:00:00Z"}"#;
        let event_ref = BroadcastMessage::decode(raw).unwrap().into_ref();

        assert_eq!(event_ref.table, RelatedTable::Game);
        assert_eq!(event_ref.event_id, None);
        assert_eq!(event_ref.related_id, 9);
    }

    #[test]
    fn test_broadcast_message_rejects_garbage() {
        assert!(matches!(
            BroadcastMessage::decode("not json"),
            Err(BroadcastError::Serialization(_))
        ));
    }
}
