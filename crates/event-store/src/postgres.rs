use std::collections::{HashMap, VecDeque};
use std::future::Future;

use async_trait::async_trait;
use futures_util::stream;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, EventEnvelope, EventId, EventQuery, EventStoreError, NewEvent, Result, Snapshot,
    SnapshotStore, Version,
    store::{EventStore, EventStream, validate_batch},
};

const EVENT_COLUMNS: &str = "position, id, aggregate_id, aggregate_type, version, event_type, occurred_at, isolation, payload, metadata";

const DEFAULT_PAGE_SIZE: i64 = 500;

/// PostgreSQL-backed event store.
///
/// Appends take a transaction-scoped advisory lock on the aggregate id and
/// re-check the stored version under it; the `unique_aggregate_version`
/// constraint backs this up. Reads are paged lazily so long streams are
/// never loaded whole.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    page_size: i64,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets how many rows a stream fetches per round trip.
    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let metadata: HashMap<String, serde_json::Value> =
            serde_json::from_value(row.try_get("metadata")?)?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            position: row.try_get("position")?,
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            version: Version::new(row.try_get("version")?),
            event_type: row.try_get("event_type")?,
            occurred_at: row.try_get("occurred_at")?,
            isolation: serde_json::from_value(row.try_get("isolation")?)?,
            payload: row.try_get("payload")?,
            metadata,
        })
    }
}

struct Page {
    cursor: i64,
    buffer: VecDeque<EventEnvelope>,
    exhausted: bool,
}

/// Builds a stream that fetches `page_size` rows at a time.
///
/// `fetch(cursor)` returns the next rows at or beyond `cursor`; `advance`
/// gives the cursor following an event.
fn paged_stream<F, Fut>(
    start: i64,
    page_size: i64,
    fetch: F,
    advance: fn(&EventEnvelope) -> i64,
) -> EventStream
where
    F: Fn(i64) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<EventEnvelope>>> + Send + 'static,
{
    let initial = Page {
        cursor: start,
        buffer: VecDeque::new(),
        exhausted: false,
    };

    let stream = stream::try_unfold(initial, move |mut page| {
        let pending = (page.buffer.is_empty() && !page.exhausted).then(|| fetch(page.cursor));
        async move {
            if let Some(pending) = pending {
                let rows = pending.await?;
                page.exhausted = (rows.len() as i64) < page_size;
                page.buffer.extend(rows);
            }
            match page.buffer.pop_front() {
                Some(event) => {
                    page.cursor = advance(&event);
                    Ok::<_, EventStoreError>(Some((event, page)))
                }
                None => Ok(None),
            }
        }
    });

    Box::pin(stream)
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>> {
        validate_batch(&events)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(aggregate_id.to_string())
            .execute(&mut *tx)
            .await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
        let actual = Version::new(current.unwrap_or(0));

        if actual != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }

        let mut committed = Vec::with_capacity(events.len());
        let mut version = expected_version;
        for event in events {
            version = version.next();
            let position: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO events (id, aggregate_id, aggregate_type, version, event_type, occurred_at, isolation, payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING position
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(aggregate_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(version.as_i64())
            .bind(&event.event_type)
            .bind(event.occurred_at)
            .bind(serde_json::to_value(&event.isolation)?)
            .bind(&event.payload)
            .bind(serde_json::to_value(&event.metadata)?)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_aggregate_version")
                {
                    return EventStoreError::ConcurrencyConflict {
                        aggregate_id,
                        expected: expected_version,
                        actual: version,
                    };
                }
                EventStoreError::Database(e)
            })?;

            committed.push(event.commit(aggregate_id, version, position));
        }

        tx.commit().await?;
        metrics::counter!("event_store_events_appended_total", "store" => "postgres")
            .increment(committed.len() as u64);
        tracing::debug!(%aggregate_id, %version, "events appended");
        Ok(committed)
    }

    async fn read_stream(
        &self,
        aggregate_id: AggregateId,
        from_version: Version,
    ) -> Result<EventStream> {
        let pool = self.pool.clone();
        let page_size = self.page_size;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE aggregate_id = $1 AND version >= $2 ORDER BY version ASC LIMIT $3"
        );

        let fetch = move |cursor: i64| {
            let pool = pool.clone();
            let sql = sql.clone();
            async move {
                let rows = sqlx::query(&sql)
                    .bind(aggregate_id.as_uuid())
                    .bind(cursor)
                    .bind(page_size)
                    .fetch_all(&pool)
                    .await?;
                rows.into_iter()
                    .map(Self::row_to_event)
                    .collect::<Result<Vec<_>>>()
            }
        };

        Ok(paged_stream(
            from_version.as_i64(),
            page_size,
            fetch,
            |event| event.version.as_i64() + 1,
        ))
    }

    async fn current_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(Version::new))
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1=1");
        let mut param_count = 0;

        if query.aggregate_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_id = ${param_count}"));
        }
        if query.aggregate_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_type = ${param_count}"));
        }
        if query.event_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ANY(${param_count})"));
        }
        if query.from_version.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND version >= ${param_count}"));
        }
        if query.to_version.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND version <= ${param_count}"));
        }
        if query.from_time.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND occurred_at >= ${param_count}"));
        }
        if query.to_time.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND occurred_at <= ${param_count}"));
        }
        if query.after_position.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND position > ${param_count}"));
        }

        sql.push_str(" ORDER BY position ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.aggregate_id {
            sqlx_query = sqlx_query.bind(id.as_uuid());
        }
        if let Some(aggregate_type) = query.aggregate_type {
            sqlx_query = sqlx_query.bind(aggregate_type);
        }
        if let Some(event_types) = query.event_types {
            sqlx_query = sqlx_query.bind(event_types);
        }
        if let Some(from_version) = query.from_version {
            sqlx_query = sqlx_query.bind(from_version.as_i64());
        }
        if let Some(to_version) = query.to_version {
            sqlx_query = sqlx_query.bind(to_version.as_i64());
        }
        if let Some(from_time) = query.from_time {
            sqlx_query = sqlx_query.bind(from_time);
        }
        if let Some(to_time) = query.to_time {
            sqlx_query = sqlx_query.bind(to_time);
        }
        if let Some(after) = query.after_position {
            sqlx_query = sqlx_query.bind(after);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn stream_all_events(&self, after_position: i64) -> Result<EventStream> {
        let pool = self.pool.clone();
        let page_size = self.page_size;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE position >= $1 ORDER BY position ASC LIMIT $2"
        );

        let fetch = move |cursor: i64| {
            let pool = pool.clone();
            let sql = sql.clone();
            async move {
                let rows = sqlx::query(&sql)
                    .bind(cursor)
                    .bind(page_size)
                    .fetch_all(&pool)
                    .await?;
                rows.into_iter()
                    .map(Self::row_to_event)
                    .collect::<Result<Vec<_>>>()
            }
        };

        Ok(paged_stream(
            after_position + 1,
            page_size,
            fetch,
            |event| event.position + 1,
        ))
    }
}

/// PostgreSQL-backed snapshot store.
#[derive(Clone)]
pub struct PostgresSnapshotStore {
    pool: PgPool,
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, aggregate_type, version, taken_at, state)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (aggregate_id) DO UPDATE SET
                aggregate_type = EXCLUDED.aggregate_type,
                version = EXCLUDED.version,
                taken_at = EXCLUDED.taken_at,
                state = EXCLUDED.state
            WHERE snapshots.version < EXCLUDED.version
            "#,
        )
        .bind(snapshot.aggregate_id.as_uuid())
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.version.as_i64())
        .bind(snapshot.taken_at)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load(&self, aggregate_id: AggregateId) -> Result<Option<Snapshot>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_type, version, taken_at, state
            FROM snapshots
            WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Snapshot> {
            Ok(Snapshot {
                aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
                aggregate_type: row.try_get("aggregate_type")?,
                version: Version::new(row.try_get("version")?),
                taken_at: row.try_get("taken_at")?,
                state: row.try_get("state")?,
            })
        })
        .transpose()
    }
}
