// Client-facing entity state
//
// These are the projections the UpdateResolver hands to clients. They are read
// from the platform's own tables through the ReadModel trait; this crate never
// writes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{StoryId, WriterId};

// ============================================================================
// Games
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Open,
    Closed,
}

/// Current projected state of a game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub id: i64,
    /// Root text of the game's story
    pub text_id: i64,
    pub title: String,
    pub status: GameStatus,
    pub writer_ids: Vec<WriterId>,
    pub updated_at: DateTime<Utc>,
}

/// Game filter set supplied by the client at connect time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase", default)]
pub struct GameFilters {
    /// Only games in one of these states
    pub status: Option<Vec<GameStatus>>,
    /// Only games this writer takes part in
    pub writer_id: Option<WriterId>,
}

impl GameFilters {
    /// Whether a game is visible under these filters and an optional search term
    pub fn matches(&self, game: &GameState, search: Option<&str>) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&game.status) {
                return false;
            }
        }
        if let Some(writer_id) = self.writer_id {
            if !game.writer_ids.contains(&writer_id) {
                return false;
            }
        }
        match search.map(str::trim).filter(|term| !term.is_empty()) {
            Some(term) => game.title.to_lowercase().contains(&term.to_lowercase()),
            None => true,
        }
    }
}

// ============================================================================
// Story nodes
// ============================================================================

/// What the viewing writer may do with a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct NodePermissions {
    pub can_view: bool,
    pub can_edit: bool,
    pub can_delete: bool,
    pub can_vote: bool,
    pub can_annotate: bool,
}

impl NodePermissions {
    /// Owner edits and deletes, other signed-in writers vote once, everyone
    /// reads live nodes. Deleted nodes stay visible to their owner only.
    pub fn for_viewer(
        owner: WriterId,
        deleted: bool,
        viewer: Option<WriterId>,
        has_voted: bool,
    ) -> Self {
        let is_owner = viewer == Some(owner);
        let signed_in = viewer.is_some();
        Self {
            can_view: !deleted || is_owner,
            can_edit: is_owner && !deleted,
            can_delete: is_owner && !deleted,
            can_vote: signed_in && !is_owner && !deleted && !has_voted,
            can_annotate: signed_in && !deleted,
        }
    }
}

/// Current state of one text node, with permissions for the viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub id: i64,
    pub root_story_id: StoryId,
    pub parent_id: Option<i64>,
    pub writer_id: WriterId,
    pub summary: String,
    pub vote_count: i64,
    pub annotation_count: i64,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
    pub permissions: NodePermissions,
}

/// A text matching a story search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub text_id: i64,
    pub snippet: String,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    pub recipient_id: WriterId,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_for_owner_and_others() {
        let owner = NodePermissions::for_viewer(5, false, Some(5), false);
        assert!(owner.can_edit && owner.can_delete && !owner.can_vote);

        let other = NodePermissions::for_viewer(5, false, Some(6), false);
        assert!(other.can_vote && !other.can_edit);
        assert!(!NodePermissions::for_viewer(5, false, Some(6), true).can_vote);

        let anonymous = NodePermissions::for_viewer(5, false, None, false);
        assert!(anonymous.can_view && !anonymous.can_annotate);

        assert!(!NodePermissions::for_viewer(5, true, Some(6), false).can_view);
        assert!(NodePermissions::for_viewer(5, true, Some(5), false).can_view);
    }

    fn game(status: GameStatus, writers: Vec<i64>) -> GameState {
        GameState {
            id: 1,
            text_id: 1,
            title: "The Lighthouse Keeper".into(),
            status,
            writer_ids: writers,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let filters = GameFilters::default();
        assert!(filters.matches(&game(GameStatus::Open, vec![]), None));
        assert!(filters.matches(&game(GameStatus::Closed, vec![]), Some("  ")));
    }

    #[test]
    fn test_status_filter() {
        let filters = GameFilters {
            status: Some(vec![GameStatus::Open]),
            ..Default::default()
        };
        assert!(filters.matches(&game(GameStatus::Open, vec![]), None));
        assert!(!filters.matches(&game(GameStatus::Closed, vec![]), None));
    }

    #[test]
    fn test_writer_filter() {
        let filters = GameFilters {
            writer_id: Some(4),
            ..Default::default()
        };
        assert!(filters.matches(&game(GameStatus::Open, vec![2, 4]), None));
        assert!(!filters.matches(&game(GameStatus::Open, vec![2]), None));
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let filters = GameFilters::default();
        let g = game(GameStatus::Open, vec![]);
        assert!(filters.matches(&g, Some("lighthouse")));
        assert!(!filters.matches(&g, Some("dragon")));
    }

    #[test]
    fn test_filters_parse_from_client_json() {
        let filters: GameFilters =
            serde_json::from_str(r#"{"status":["open"],"writerId":3}"#).unwrap();
        assert_eq!(filters.status, Some(vec![GameStatus::Open]));
        assert_eq!(filters.writer_id, Some(3));

        let empty: GameFilters = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, GameFilters::default());
    }

    #[test]
    fn test_node_serializes_camel_case() {
        let node = NodeState {
            id: 5,
            root_story_id: 1,
            parent_id: Some(4),
            writer_id: 2,
            summary: "It was a dark night".into(),
            vote_count: 3,
            annotation_count: 0,
            deleted: false,
            updated_at: Utc::now(),
            permissions: NodePermissions {
                can_view: true,
                can_vote: true,
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["rootStoryId"], 1);
        assert_eq!(json["permissions"]["canVote"], true);
        assert_eq!(json["permissions"]["canEdit"], false);
    }
}
