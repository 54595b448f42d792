// Event type registry
// Decision: One tagged Action variant per domain action, each with a static typed
// emission list. Field references are enum values, so a descriptor that names an
// unknown field does not compile, and one that emits an unrequired field is
// rejected when the registry is built.
//
// The registry is a pure transform: action name + input -> event rows. Callers
// persist and publish the rows (see EventPublisher).

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::RegistryError;
use crate::event::{NewEvent, RelatedTable};

/// Input key holding the acting writer, used when an emission names no writer field
const DEFAULT_ACTOR_FIELD: Field = Field::WriterId;

// ============================================================================
// Fields
// ============================================================================

/// Shape of an input field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Integer id (JSON number or integer string)
    Id,
    /// Free text
    Text,
}

/// Known action input keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    GameId,
    TextId,
    RootStoryId,
    WriterId,
    RecipientId,
    NotificationId,
    AnnotationId,
    Title,
    Message,
}

impl Field {
    /// Key as it appears in action input
    pub const fn key(&self) -> &'static str {
        match self {
            Field::GameId => "gameId",
            Field::TextId => "textId",
            Field::RootStoryId => "rootStoryId",
            Field::WriterId => "writerId",
            Field::RecipientId => "recipientId",
            Field::NotificationId => "notificationId",
            Field::AnnotationId => "annotationId",
            Field::Title => "title",
            Field::Message => "message",
        }
    }

    pub const fn kind(&self) -> FieldKind {
        match self {
            Field::Title | Field::Message => FieldKind::Text,
            _ => FieldKind::Id,
        }
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// One row an action emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emission {
    pub table: RelatedTable,
    pub event_kind: &'static str,
    /// Field whose value becomes `related_id`
    pub related_id_field: Field,
    /// Field whose value becomes `story_id` (text rows)
    pub story_id_field: Option<Field>,
    /// Fields copied into the row payload
    pub payload_fields: &'static [Field],
    /// Overrides the default actor field, e.g. the recipient of a notification
    pub writer_id_field: Option<Field>,
}

impl Emission {
    fn referenced_fields(&self) -> impl Iterator<Item = Field> + '_ {
        std::iter::once(self.related_id_field)
            .chain(self.story_id_field)
            .chain(self.writer_id_field)
            .chain(self.payload_fields.iter().copied())
    }
}

/// Declarative description of what an action emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTypeDescriptor {
    pub action: Action,
    pub required_fields: &'static [Field],
    pub emissions: &'static [Emission],
}

impl EventTypeDescriptor {
    /// Check that every field an emission reads is required
    pub fn validate(&self) -> Result<(), RegistryError> {
        for emission in self.emissions {
            if let Some(field) = emission
                .referenced_fields()
                .find(|field| !self.required_fields.contains(field))
            {
                return Err(RegistryError::InvalidDescriptor {
                    action: self.action.name().to_string(),
                    field: field.key().to_string(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Domain actions with realtime visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    GameCreated,
    GameClosed,
    GameJoined,
    TextAdded,
    TextEdited,
    TextDeleted,
    VoteCast,
    AnnotationAdded,
    NotificationCreated,
    NotificationRead,
    DraftSaved,
}

const fn game(event_kind: &'static str, payload_fields: &'static [Field]) -> Emission {
    Emission {
        table: RelatedTable::Game,
        event_kind,
        related_id_field: Field::GameId,
        story_id_field: None,
        payload_fields,
        writer_id_field: None,
    }
}

const fn text(event_kind: &'static str, payload_fields: &'static [Field]) -> Emission {
    Emission {
        table: RelatedTable::Text,
        event_kind,
        related_id_field: Field::TextId,
        story_id_field: Some(Field::RootStoryId),
        payload_fields,
        writer_id_field: None,
    }
}

const fn notification(event_kind: &'static str, payload_fields: &'static [Field]) -> Emission {
    Emission {
        table: RelatedTable::Notification,
        event_kind,
        related_id_field: Field::NotificationId,
        story_id_field: None,
        payload_fields,
        writer_id_field: Some(Field::RecipientId),
    }
}

impl Action {
    pub const ALL: [Action; 11] = [
        Action::GameCreated,
        Action::GameClosed,
        Action::GameJoined,
        Action::TextAdded,
        Action::TextEdited,
        Action::TextDeleted,
        Action::VoteCast,
        Action::AnnotationAdded,
        Action::NotificationCreated,
        Action::NotificationRead,
        Action::DraftSaved,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Action::GameCreated => "game_created",
            Action::GameClosed => "game_closed",
            Action::GameJoined => "game_joined",
            Action::TextAdded => "text_added",
            Action::TextEdited => "text_edited",
            Action::TextDeleted => "text_deleted",
            Action::VoteCast => "vote_cast",
            Action::AnnotationAdded => "annotation_added",
            Action::NotificationCreated => "notification_created",
            Action::NotificationRead => "notification_read",
            Action::DraftSaved => "draft_saved",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.name() == name)
    }

    pub fn descriptor(&self) -> EventTypeDescriptor {
        let (required_fields, emissions) = match self {
            Action::GameCreated => (GAME_CREATED_FIELDS, GAME_CREATED),
            Action::GameClosed => (GAME_CLOSED_FIELDS, GAME_CLOSED),
            Action::GameJoined => (GAME_JOINED_FIELDS, GAME_JOINED),
            Action::TextAdded => (TEXT_ADDED_FIELDS, TEXT_ADDED),
            Action::TextEdited => (TEXT_CHANGE_FIELDS, TEXT_EDITED),
            Action::TextDeleted => (TEXT_CHANGE_FIELDS, TEXT_DELETED),
            Action::VoteCast => (TEXT_CHANGE_FIELDS, VOTE_CAST),
            Action::AnnotationAdded => (ANNOTATION_ADDED_FIELDS, ANNOTATION_ADDED),
            Action::NotificationCreated => (NOTIFICATION_CREATED_FIELDS, NOTIFICATION_CREATED),
            Action::NotificationRead => (NOTIFICATION_READ_FIELDS, NOTIFICATION_READ),
            // Drafts are private until published; nothing to broadcast
            Action::DraftSaved => (DRAFT_SAVED_FIELDS, NO_EMISSIONS),
        };

        EventTypeDescriptor {
            action: *self,
            required_fields,
            emissions,
        }
    }
}

// Descriptor tables

const GAME_CREATED_FIELDS: &[Field] = &[Field::GameId, Field::TextId, Field::Title, Field::WriterId];
const GAME_CREATED: &[Emission] = &[game(
    "game.created",
    &[Field::GameId, Field::TextId, Field::Title],
)];

const GAME_CLOSED_FIELDS: &[Field] = &[Field::TextId, Field::GameId, Field::Title];
const GAME_CLOSED: &[Emission] = &[game(
    "game.closed",
    &[Field::TextId, Field::GameId, Field::Title],
)];

const GAME_JOINED_FIELDS: &[Field] = &[Field::GameId, Field::WriterId];
const GAME_JOINED: &[Emission] = &[game("game.joined", &[Field::GameId, Field::WriterId])];

const TEXT_ADDED_FIELDS: &[Field] = &[
    Field::TextId,
    Field::RootStoryId,
    Field::GameId,
    Field::WriterId,
];
const TEXT_ADDED: &[Emission] = &[
    text("text.added", &[Field::TextId, Field::RootStoryId]),
    game("game.updated", &[Field::GameId]),
];

const TEXT_CHANGE_FIELDS: &[Field] = &[Field::TextId, Field::RootStoryId, Field::WriterId];
const TEXT_EDITED: &[Emission] = &[text("text.edited", &[Field::TextId, Field::RootStoryId])];
const TEXT_DELETED: &[Emission] = &[text("text.deleted", &[Field::TextId, Field::RootStoryId])];
const VOTE_CAST: &[Emission] = &[text("text.voted", &[Field::TextId, Field::RootStoryId])];

const ANNOTATION_ADDED_FIELDS: &[Field] = &[
    Field::AnnotationId,
    Field::TextId,
    Field::RootStoryId,
    Field::WriterId,
];
const ANNOTATION_ADDED: &[Emission] = &[text(
    "text.annotated",
    &[Field::AnnotationId, Field::TextId, Field::RootStoryId],
)];

const NOTIFICATION_CREATED_FIELDS: &[Field] =
    &[Field::NotificationId, Field::RecipientId, Field::Message];
const NOTIFICATION_CREATED: &[Emission] = &[notification(
    "notification.created",
    &[Field::NotificationId, Field::Message],
)];

const NOTIFICATION_READ_FIELDS: &[Field] = &[Field::NotificationId, Field::RecipientId];
const NOTIFICATION_READ: &[Emission] =
    &[notification("notification.read", &[Field::NotificationId])];

const DRAFT_SAVED_FIELDS: &[Field] = &[Field::TextId, Field::WriterId];
const NO_EMISSIONS: &[Emission] = &[];

// ============================================================================
// Registry
// ============================================================================

/// Immutable lookup table from action name to descriptor
#[derive(Debug, Clone)]
pub struct EventTypeRegistry {
    descriptors: HashMap<&'static str, EventTypeDescriptor>,
}

impl EventTypeRegistry {
    /// Build a registry, rejecting descriptors that emit unrequired fields
    pub fn new(
        descriptors: impl IntoIterator<Item = EventTypeDescriptor>,
    ) -> Result<Self, RegistryError> {
        let mut map = HashMap::new();
        for descriptor in descriptors {
            descriptor.validate()?;
            map.insert(descriptor.action.name(), descriptor);
        }
        Ok(Self { descriptors: map })
    }

    /// Registry with every built-in action
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::new(Action::ALL.iter().map(Action::descriptor))
    }

    pub fn get(&self, action_name: &str) -> Option<&EventTypeDescriptor> {
        self.descriptors.get(action_name)
    }

    /// Registered action names, sorted
    pub fn action_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.descriptors.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Expand an action into the rows it must emit.
    ///
    /// All required fields are validated before any row is built, so an error
    /// never leaves a partial expansion behind.
    pub fn expand(
        &self,
        action_name: &str,
        input: &Map<String, Value>,
    ) -> Result<Vec<NewEvent>, RegistryError> {
        let descriptor = self
            .get(action_name)
            .ok_or_else(|| RegistryError::UnknownAction(action_name.to_string()))?;

        let mut values: HashMap<Field, Value> = HashMap::new();
        for field in descriptor.required_fields {
            let value = read_field(action_name, input, *field)?
                .ok_or_else(|| RegistryError::missing(action_name, field.key()))?;
            values.insert(*field, value);
        }

        let actor = read_field(action_name, input, DEFAULT_ACTOR_FIELD)?
            .and_then(|value| value.as_i64());

        let rows = descriptor
            .emissions
            .iter()
            .map(|emission| {
                let id_of = |field: Field| values.get(&field).and_then(Value::as_i64);

                let payload: Map<String, Value> = emission
                    .payload_fields
                    .iter()
                    .filter_map(|field| {
                        values
                            .get(field)
                            .map(|value| (field.key().to_string(), value.clone()))
                    })
                    .collect();

                NewEvent {
                    related_table: emission.table,
                    // Presence checked above; descriptors only reference required fields
                    related_id: id_of(emission.related_id_field).unwrap_or_default(),
                    writer_id: emission.writer_id_field.map_or(actor, id_of),
                    event_kind: emission.event_kind.to_string(),
                    story_id: emission.story_id_field.and_then(id_of),
                    payload: Value::Object(payload),
                }
            })
            .collect();

        Ok(rows)
    }
}

/// Read and normalize one field. `Ok(None)` means absent or null.
fn read_field(
    action: &str,
    input: &Map<String, Value>,
    field: Field,
) -> Result<Option<Value>, RegistryError> {
    let value = match input.get(field.key()) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };

    match field.kind() {
        FieldKind::Id => {
            let id = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            id.map(|id| Some(Value::from(id)))
                .ok_or_else(|| RegistryError::invalid(action, field.key(), "expected an integer id"))
        }
        FieldKind::Text => match value {
            Value::String(s) => Ok(Some(Value::String(s.clone()))),
            _ => Err(RegistryError::invalid(action, field.key(), "expected a string")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test input must be an object"),
        }
    }

    fn registry() -> EventTypeRegistry {
        EventTypeRegistry::builtin().unwrap()
    }

    #[test]
    fn test_builtin_descriptors_are_valid() {
        for action in Action::ALL {
            assert!(action.descriptor().validate().is_ok(), "{}", action.name());
        }
        assert_eq!(registry().action_names().len(), Action::ALL.len());
    }

    #[test]
    fn test_action_names_round_trip() {
        for action in Action::ALL {
            assert_eq!(Action::from_name(action.name()), Some(action));
        }
        assert_eq!(Action::from_name("nope"), None);
    }

    #[test]
    fn test_game_closed_emits_one_game_row() {
        let rows = registry()
            .expand(
                "game_closed",
                &input(json!({"textId": 1, "gameId": 1, "title": "T"})),
            )
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].related_table, RelatedTable::Game);
        assert_eq!(rows[0].related_id, 1);
        assert_eq!(rows[0].event_kind, "game.closed");
        assert_eq!(rows[0].writer_id, None);
        assert_eq!(
            rows[0].payload,
            json!({"textId": 1, "gameId": 1, "title": "T"})
        );
    }

    #[test]
    fn test_missing_field_emits_nothing() {
        let err = registry()
            .expand("game_closed", &input(json!({"textId": 1, "gameId": 1})))
            .unwrap_err();

        assert_eq!(err, RegistryError::missing("game_closed", "title"));
    }

    #[test]
    fn test_null_counts_as_missing() {
        let err = registry()
            .expand(
                "game_closed",
                &input(json!({"textId": 1, "gameId": 1, "title": null})),
            )
            .unwrap_err();

        assert!(matches!(err, RegistryError::MissingRequiredField { .. }));
    }

    #[test]
    fn test_unknown_action() {
        let err = registry().expand("game_exploded", &Map::new()).unwrap_err();
        assert_eq!(err, RegistryError::UnknownAction("game_exploded".into()));
    }

    #[test]
    fn test_invalid_id_type() {
        let err = registry()
            .expand(
                "game_closed",
                &input(json!({"textId": "abc", "gameId": 1, "title": "T"})),
            )
            .unwrap_err();

        assert!(matches!(err, RegistryError::InvalidField { ref field, .. } if field == "textId"));
    }

    #[test]
    fn test_string_ids_are_normalized() {
        let rows = registry()
            .expand(
                "text_edited",
                &input(json!({"textId": "12", "rootStoryId": "3", "writerId": 5})),
            )
            .unwrap();

        assert_eq!(rows[0].related_id, 12);
        assert_eq!(rows[0].story_id, Some(3));
        assert_eq!(rows[0].writer_id, Some(5));
        assert_eq!(rows[0].payload, json!({"textId": 12, "rootStoryId": 3}));
    }

    #[test]
    fn test_text_added_emits_text_and_game_rows_in_order() {
        let rows = registry()
            .expand(
                "text_added",
                &input(json!({"textId": 8, "rootStoryId": 2, "gameId": 4, "writerId": 6})),
            )
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].related_table, RelatedTable::Text);
        assert_eq!(rows[0].story_id, Some(2));
        assert_eq!(rows[1].related_table, RelatedTable::Game);
        assert_eq!(rows[1].related_id, 4);
        assert_eq!(rows[1].story_id, None);
        assert!(rows.iter().all(|row| row.writer_id == Some(6)));
    }

    #[test]
    fn test_notification_writer_is_recipient() {
        let rows = registry()
            .expand(
                "notification_created",
                &input(json!({
                    "notificationId": 30,
                    "recipientId": 9,
                    "writerId": 2,
                    "message": "Your turn"
                })),
            )
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].related_table, RelatedTable::Notification);
        assert_eq!(rows[0].writer_id, Some(9));
        assert_eq!(
            rows[0].payload,
            json!({"notificationId": 30, "message": "Your turn"})
        );
    }

    #[test]
    fn test_zero_emissions_is_legal() {
        let rows = registry()
            .expand("draft_saved", &input(json!({"textId": 1, "writerId": 1})))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_zero_emissions_still_validates_input() {
        let err = registry()
            .expand("draft_saved", &input(json!({"textId": 1})))
            .unwrap_err();
        assert_eq!(err, RegistryError::missing("draft_saved", "writerId"));
    }

    #[test]
    fn test_descriptor_emitting_unrequired_field_is_rejected() {
        const BAD: EventTypeDescriptor = EventTypeDescriptor {
            action: Action::GameJoined,
            required_fields: &[Field::GameId],
            emissions: &[Emission {
                table: RelatedTable::Game,
                event_kind: "game.joined",
                related_id_field: Field::GameId,
                story_id_field: None,
                payload_fields: &[Field::Title],
                writer_id_field: None,
            }],
        };

        let err = EventTypeRegistry::new([BAD]).unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidDescriptor {
                action: "game_joined".into(),
                field: "title".into(),
            }
        );
    }
}
