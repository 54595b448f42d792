// PostgreSQL implementation of ReadModel
//
// Reads the platform's games, texts and notifications tables. Votes and
// annotations are counted on the fly; permissions follow NodePermissions.

use anyhow::{bail, Context};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use storyline_core::event::{StoryId, WriterId};
use storyline_core::read_model::NodePermissions;
use storyline_core::{GameState, GameStatus, NodeState, Notification, ReadModel, SearchResult};

/// Maximum search hits returned with an update frame
const SEARCH_LIMIT: i64 = 50;
const SNIPPET_CHARS: i32 = 120;

#[derive(Clone)]
pub struct PostgresReadModel {
    pool: PgPool,
}

impl PostgresReadModel {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_status(raw: &str) -> anyhow::Result<GameStatus> {
    match raw {
        "open" => Ok(GameStatus::Open),
        "closed" => Ok(GameStatus::Closed),
        other => bail!("unknown game status '{}'", other),
    }
}

/// Escape LIKE metacharacters so the term matches literally
fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl ReadModel for PostgresReadModel {
    #[instrument(skip(self))]
    async fn game(&self, game_id: i64) -> anyhow::Result<Option<GameState>> {
        let row = sqlx::query(
            r#"
            SELECT g.id, g.text_id, g.title, g.status, g.updated_at,
                   COALESCE(
                       array_agg(gw.writer_id ORDER BY gw.writer_id)
                           FILTER (WHERE gw.writer_id IS NOT NULL),
                       '{}'
                   ) AS writer_ids
            FROM games g
            LEFT JOIN game_writers gw ON gw.game_id = g.id
            WHERE g.id = $1
            GROUP BY g.id
            "#,
        )
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load game")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.get("status");

        Ok(Some(GameState {
            id: row.get("id"),
            text_id: row.get("text_id"),
            title: row.get("title"),
            status: parse_status(&status)?,
            writer_ids: row.get("writer_ids"),
            updated_at: row.get("updated_at"),
        }))
    }

    #[instrument(skip(self))]
    async fn node(
        &self,
        text_id: i64,
        viewer: Option<WriterId>,
    ) -> anyhow::Result<Option<NodeState>> {
        let row = sqlx::query(
            r#"
            SELECT t.id, t.root_story_id, t.parent_id, t.writer_id, t.summary,
                   t.deleted, t.updated_at,
                   (SELECT COUNT(*) FROM votes v WHERE v.text_id = t.id) AS vote_count,
                   (SELECT COUNT(*) FROM annotations a WHERE a.text_id = t.id) AS annotation_count,
                   EXISTS (
                       SELECT 1 FROM votes v
                       WHERE v.text_id = t.id AND $2::BIGINT IS NOT NULL AND v.writer_id = $2
                   ) AS has_voted
            FROM texts t
            WHERE t.id = $1
            "#,
        )
        .bind(text_id)
        .bind(viewer)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load text")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let writer_id: WriterId = row.get("writer_id");
        let deleted: bool = row.get("deleted");
        let has_voted: bool = row.get("has_voted");

        Ok(Some(NodeState {
            id: row.get("id"),
            root_story_id: row.get("root_story_id"),
            parent_id: row.get("parent_id"),
            writer_id,
            summary: row.get("summary"),
            vote_count: row.get("vote_count"),
            annotation_count: row.get("annotation_count"),
            deleted,
            updated_at: row.get("updated_at"),
            permissions: NodePermissions::for_viewer(writer_id, deleted, viewer, has_voted),
        }))
    }

    #[instrument(skip(self))]
    async fn notification(&self, notification_id: i64) -> anyhow::Result<Option<Notification>> {
        let row = sqlx::query(
            r#"
            SELECT id, recipient_id, message, is_read, created_at
            FROM notifications
            WHERE id = $1
            "#,
        )
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load notification")?;

        Ok(row.map(|row| Notification {
            id: row.get("id"),
            recipient_id: row.get("recipient_id"),
            message: row.get("message"),
            is_read: row.get("is_read"),
            created_at: row.get("created_at"),
        }))
    }

    #[instrument(skip(self))]
    async fn search(&self, story: StoryId, term: &str) -> anyhow::Result<Vec<SearchResult>> {
        let rows = sqlx::query(
            r#"
            SELECT id, LEFT(summary, $3) AS snippet
            FROM texts
            WHERE root_story_id = $1
              AND NOT deleted
              AND summary ILIKE $2 ESCAPE '\'
            ORDER BY id ASC
            LIMIT $4
            "#,
        )
        .bind(story)
        .bind(like_pattern(term))
        .bind(SNIPPET_CHARS)
        .bind(SEARCH_LIMIT)
        .fetch_all(&self.pool)
        .await
        .context("failed to search texts")?;

        Ok(rows
            .iter()
            .map(|row| SearchResult {
                text_id: row.get("id"),
                snippet: row.get("snippet"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("dragon"), "%dragon%");
        assert_eq!(like_pattern("100%_done"), "%100\\%\\_done%");
        assert_eq!(like_pattern("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("open").unwrap(), GameStatus::Open);
        assert_eq!(parse_status("closed").unwrap(), GameStatus::Closed);
        assert!(parse_status("archived").is_err());
    }
}
