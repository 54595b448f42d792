// Update resolver
//
// The only place where event log records become client payloads. Every event
// is re-read from the read model (the broadcast body may be stale) and passed
// through the viewer's scope and permission checks.

use std::sync::Arc;

use tracing::debug;

use crate::error::ResolveError;
use crate::event::{EventRef, RelatedTable, StoryId, WriterId};
use crate::read_model::{GameFilters, GameState, NodeState, Notification, SearchResult};
use crate::traits::ReadModel;

/// Who is looking, and through which lens
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewerContext {
    pub viewer: Option<WriterId>,
    pub story: Option<StoryId>,
    pub filters: GameFilters,
    pub search: Option<String>,
}

impl ViewerContext {
    /// Search term, if non-blank
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
    }
}

/// A hydrated, permission-filtered update
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedUpdate {
    Game(GameState),
    Node(NodeState),
    Notification(Notification),
}

#[derive(Clone)]
pub struct UpdateResolver {
    read_model: Arc<dyn ReadModel>,
}

impl UpdateResolver {
    pub fn new(read_model: Arc<dyn ReadModel>) -> Self {
        Self { read_model }
    }

    /// Resolve one event for a viewer. `Ok(None)` means nothing to show.
    pub async fn resolve(
        &self,
        event_ref: &EventRef,
        ctx: &ViewerContext,
    ) -> Result<Option<ResolvedUpdate>, ResolveError> {
        let id = event_ref.related_id;
        let fetch_error = |e: anyhow::Error| ResolveError::Fetch {
            table: event_ref.table,
            id,
            reason: e.to_string(),
        };

        match event_ref.table {
            RelatedTable::Game => {
                let game = self.read_model.game(id).await.map_err(fetch_error)?;
                Ok(game
                    .filter(|game| ctx.filters.matches(game, ctx.search_term()))
                    .map(ResolvedUpdate::Game))
            }
            RelatedTable::Text => {
                // Text updates only make sense inside a story view
                let Some(story) = ctx.story else {
                    return Ok(None);
                };
                let node = self
                    .read_model
                    .node(id, ctx.viewer)
                    .await
                    .map_err(fetch_error)?;
                Ok(node
                    .filter(|node| node.root_story_id == story && node.permissions.can_view)
                    .map(ResolvedUpdate::Node))
            }
            RelatedTable::Notification => {
                let Some(viewer) = ctx.viewer else {
                    return Ok(None);
                };
                let notification = self
                    .read_model
                    .notification(id)
                    .await
                    .map_err(fetch_error)?;
                match notification {
                    Some(n) if n.recipient_id == viewer => {
                        Ok(Some(ResolvedUpdate::Notification(n)))
                    }
                    Some(n) => {
                        // Channel routing is not an access boundary on its own
                        debug!(
                            notification_id = n.id,
                            viewer, "dropping notification for another recipient"
                        );
                        Ok(None)
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Search results for the viewer's story and term; empty when either is unset
    pub async fn search(&self, ctx: &ViewerContext) -> Result<Vec<SearchResult>, ResolveError> {
        match (ctx.story, ctx.search_term()) {
            (Some(story), Some(term)) => self
                .read_model
                .search(story, term)
                .await
                .map_err(|e| ResolveError::Search(e.to_string())),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryReadModel;
    use crate::read_model::GameStatus;
    use chrono::Utc;

    fn event_ref(table: RelatedTable, related_id: i64) -> EventRef {
        EventRef {
            table,
            related_id,
            event_id: Some(1),
            kind: None,
            emitted_at: Utc::now(),
        }
    }

    fn setup() -> (Arc<InMemoryReadModel>, UpdateResolver) {
        let model = Arc::new(InMemoryReadModel::new());
        model.upsert_game(1, 100, "Harbor Lights", GameStatus::Open, vec![7]);
        model.upsert_node(100, 100, None, 7, "The fog rolled in");
        model.upsert_node(200, 200, None, 8, "Another story");
        model.upsert_notification(50, 7, "Your turn");
        let resolver = UpdateResolver::new(model.clone());
        (model, resolver)
    }

    fn ctx(viewer: Option<i64>, story: Option<i64>) -> ViewerContext {
        ViewerContext {
            viewer,
            story,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_game_resolves_globally() {
        let (_, resolver) = setup();
        let update = resolver
            .resolve(&event_ref(RelatedTable::Game, 1), &ctx(None, None))
            .await
            .unwrap();
        assert!(matches!(update, Some(ResolvedUpdate::Game(g)) if g.title == "Harbor Lights"));
    }

    #[tokio::test]
    async fn test_game_filtered_out() {
        let (_, resolver) = setup();
        let mut viewer = ctx(None, None);
        viewer.filters.status = Some(vec![GameStatus::Closed]);

        let update = resolver
            .resolve(&event_ref(RelatedTable::Game, 1), &viewer)
            .await
            .unwrap();
        assert_eq!(update, None);
    }

    #[tokio::test]
    async fn test_missing_game_is_none() {
        let (_, resolver) = setup();
        let update = resolver
            .resolve(&event_ref(RelatedTable::Game, 999), &ctx(None, None))
            .await
            .unwrap();
        assert_eq!(update, None);
    }

    #[tokio::test]
    async fn test_text_requires_story_scope() {
        let (_, resolver) = setup();
        let text = event_ref(RelatedTable::Text, 100);

        assert_eq!(resolver.resolve(&text, &ctx(Some(7), None)).await.unwrap(), None);

        let update = resolver.resolve(&text, &ctx(Some(7), Some(100))).await.unwrap();
        match update {
            Some(ResolvedUpdate::Node(node)) => {
                assert_eq!(node.id, 100);
                assert!(node.permissions.can_edit);
            }
            other => panic!("expected node, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_text_from_other_story_is_dropped() {
        let (_, resolver) = setup();
        let update = resolver
            .resolve(&event_ref(RelatedTable::Text, 200), &ctx(Some(7), Some(100)))
            .await
            .unwrap();
        assert_eq!(update, None);
    }

    #[tokio::test]
    async fn test_notification_only_for_recipient() {
        let (_, resolver) = setup();
        let note = event_ref(RelatedTable::Notification, 50);

        assert!(resolver
            .resolve(&note, &ctx(Some(7), None))
            .await
            .unwrap()
            .is_some());
        assert_eq!(resolver.resolve(&note, &ctx(Some(8), None)).await.unwrap(), None);
        assert_eq!(resolver.resolve(&note, &ctx(None, None)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_model_failure_is_resolve_error() {
        let (model, resolver) = setup();
        model.set_failing(true);

        let err = resolver
            .resolve(&event_ref(RelatedTable::Game, 1), &ctx(None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Fetch { id: 1, .. }));
    }

    #[tokio::test]
    async fn test_search_needs_story_and_term() {
        let (_, resolver) = setup();
        let mut viewer = ctx(Some(7), Some(100));
        assert!(resolver.search(&viewer).await.unwrap().is_empty());

        viewer.search = Some("fog".into());
        let results = resolver.search(&viewer).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text_id, 100);

        viewer.story = None;
        assert!(resolver.search(&viewer).await.unwrap().is_empty());
    }
}
