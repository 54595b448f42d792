// Channel routing
//
// Derives the pub/sub channels a session listens on, and the channel an event
// is published to. Both directions use the same naming so they cannot disagree.

use serde::Serialize;

use crate::event::{Event, RelatedTable, StoryId, WriterId};

/// Site-wide game updates
pub const GAMES_CHANNEL: &str = "games:updates";

/// Per-story text channel name
pub fn story_channel(story_id: StoryId) -> String {
    format!("texts:{}", story_id)
}

/// Per-user notification channel name
pub fn user_channel(writer_id: WriterId) -> String {
    format!("notifications:{}", writer_id)
}

/// Channels one session subscribes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSet {
    pub games_channel: String,
    pub story_channel: Option<String>,
    pub user_channel: Option<String>,
}

impl ChannelSet {
    /// Flatten into the list handed to `Broadcaster::subscribe`
    pub fn channels(&self) -> Vec<String> {
        std::iter::once(self.games_channel.clone())
            .chain(self.story_channel.clone())
            .chain(self.user_channel.clone())
            .collect()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.games_channel == channel
            || self.story_channel.as_deref() == Some(channel)
            || self.user_channel.as_deref() == Some(channel)
    }
}

/// Stateless channel derivation
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelRouter;

impl ChannelRouter {
    /// Channels for a viewer and optional story scope.
    ///
    /// Computed once per connection; a scope change needs a new connection.
    pub fn route(viewer: Option<WriterId>, story: Option<StoryId>) -> ChannelSet {
        ChannelSet {
            games_channel: GAMES_CHANNEL.to_string(),
            story_channel: story.map(story_channel),
            user_channel: viewer.map(user_channel),
        }
    }

    /// Channel an event is published on, if any.
    ///
    /// Text rows without a story and notifications without a recipient have no
    /// audience and are not published.
    pub fn channel_for(event: &Event) -> Option<String> {
        match event.related_table {
            RelatedTable::Game => Some(GAMES_CHANNEL.to_string()),
            RelatedTable::Text => event.story_id.map(story_channel),
            RelatedTable::Notification => event.writer_id.map(user_channel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NewEvent;
    use chrono::Utc;
    use serde_json::json;

    fn event(table: RelatedTable, writer_id: Option<i64>, story_id: Option<i64>) -> Event {
        Event::from_new(
            1,
            NewEvent {
                related_table: table,
                related_id: 10,
                writer_id,
                event_kind: "test".into(),
                story_id,
                payload: json!({}),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_anonymous_without_story_gets_games_only() {
        let set = ChannelRouter::route(None, None);
        assert_eq!(set.channels(), vec!["games:updates".to_string()]);
    }

    #[test]
    fn test_full_scope() {
        let set = ChannelRouter::route(Some(7), Some(3));
        assert_eq!(
            set.channels(),
            vec![
                "games:updates".to_string(),
                "texts:3".to_string(),
                "notifications:7".to_string()
            ]
        );
        assert!(set.contains("texts:3"));
        assert!(!set.contains("texts:4"));
    }

    #[test]
    fn test_route_is_deterministic() {
        assert_eq!(
            ChannelRouter::route(Some(1), Some(2)),
            ChannelRouter::route(Some(1), Some(2))
        );
    }

    #[test]
    fn test_channel_for_events() {
        assert_eq!(
            ChannelRouter::channel_for(&event(RelatedTable::Game, Some(1), None)).as_deref(),
            Some("games:updates")
        );
        assert_eq!(
            ChannelRouter::channel_for(&event(RelatedTable::Text, Some(1), Some(5))).as_deref(),
            Some("texts:5")
        );
        assert_eq!(
            ChannelRouter::channel_for(&event(RelatedTable::Text, Some(1), None)),
            None
        );
        assert_eq!(
            ChannelRouter::channel_for(&event(RelatedTable::Notification, Some(9), None))
                .as_deref(),
            Some("notifications:9")
        );
    }
}
