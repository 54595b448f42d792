// PostgreSQL implementation of EventLog
//
// Production persistence with:
// - One transaction per append (all rows or none)
// - An advisory lock around appends so ids become visible in commit order
// - Scope filtering pushed down into SQL

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use storyline_core::event::{Event, EventId, NewEvent, RelatedTable};
use storyline_core::traits::{EventLog, ReadScope};
use storyline_core::StoreError;

/// Advisory lock key serializing appends
const APPEND_LOCK_KEY: i64 = 0x5354_4f52_594c_4e45;

/// Connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Apply bundled migrations
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// PostgreSQL implementation of EventLog
///
/// # Example
///
/// ```ignore
/// use storyline_server::storage::PostgresEventLog;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/storyline").await?;
/// let log = PostgresEventLog::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
}

impl PostgresEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_error(context: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| {
        error!("{}: {}", context, e);
        StoreError::Database(e.to_string())
    }
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let table: String = row.get("related_table");
    let related_table: RelatedTable = table.parse().map_err(StoreError::Serialization)?;
    let created_at: DateTime<Utc> = row.get("created_at");

    Ok(Event {
        id: row.get("id"),
        related_table,
        related_id: row.get("related_id"),
        writer_id: row.get("writer_id"),
        event_kind: row.get("event_kind"),
        story_id: row.get("story_id"),
        payload: row.get("payload"),
        created_at,
    })
}

#[async_trait]
impl EventLog for PostgresEventLog {
    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn append(&self, rows: Vec<NewEvent>) -> Result<Vec<Event>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin append"))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to take append lock"))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let inserted = sqlx::query(
                r#"
                INSERT INTO storyline_events
                    (related_table, related_id, writer_id, event_kind, story_id, payload)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id, created_at
                "#,
            )
            .bind(row.related_table.as_str())
            .bind(row.related_id)
            .bind(row.writer_id)
            .bind(&row.event_kind)
            .bind(row.story_id)
            .bind(&row.payload)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("Failed to insert event"))?;

            let id: EventId = inserted.get("id");
            let created_at: DateTime<Utc> = inserted.get("created_at");
            events.push(Event::from_new(id, row, created_at));
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit append"))?;

        debug!(
            first_id = events.first().map(|e| e.id),
            last_id = events.last().map(|e| e.id),
            "appended events"
        );
        Ok(events)
    }

    #[instrument(skip(self))]
    async fn read_since(
        &self,
        cursor: EventId,
        scope: &ReadScope,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, related_table, related_id, writer_id, event_kind, story_id, payload, created_at
            FROM storyline_events
            WHERE id > $1
              AND (
                related_table = 'game'
                OR (related_table = 'text' AND $2::BIGINT IS NOT NULL AND story_id = $2)
                OR (related_table = 'notification' AND $3::BIGINT IS NOT NULL AND writer_id = $3)
              )
            ORDER BY id ASC
            LIMIT $4
            "#,
        )
        .bind(cursor)
        .bind(scope.story)
        .bind(scope.viewer)
        .bind(scope.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to read events"))?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn max_id(&self) -> Result<Option<EventId>, StoreError> {
        sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(id) FROM storyline_events")
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Failed to read log tail"))
    }
}
