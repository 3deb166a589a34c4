//! PostgreSQL event store.
//!
//! Dedup relies on a UNIQUE constraint over the fingerprint column combined
//! with `ON CONFLICT DO NOTHING`, so replays and retried submissions are
//! absorbed by the database rather than checked in application code.

use crate::error::{with_deadline, StoreResult};
use crate::store::EventStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fast_ingest_core::config::DatabaseConfig;
use fast_ingest_core::types::{ChannelCount, Event, MetricsQuery, TimeBucketCount, TimeGranularity, Totals};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Rows per INSERT statement. Eight binds per row keeps a full chunk well
/// under PostgreSQL's 65535 bind-parameter limit.
const INSERT_CHUNK_ROWS: usize = 1000;

const INSERT_PREFIX: &str =
    "INSERT INTO events (dedupe_key, event_name, channel, campaign_id, user_id, ts, tags, metadata) ";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        id          BIGSERIAL   PRIMARY KEY,
        dedupe_key  TEXT        NOT NULL UNIQUE,
        event_name  TEXT        NOT NULL,
        channel     TEXT        NOT NULL,
        campaign_id TEXT,
        user_id     TEXT        NOT NULL,
        ts          TIMESTAMPTZ NOT NULL,
        tags        JSONB       NOT NULL DEFAULT '[]'::jsonb,
        metadata    JSONB       NOT NULL DEFAULT '{}'::jsonb,
        received_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_name_ts ON events (event_name, ts)",
    "CREATE INDEX IF NOT EXISTS idx_events_name_channel_ts ON events (event_name, channel, ts)",
];

const TOTALS_SQL: &str = "SELECT
    COUNT(*) AS total_events,
    COUNT(DISTINCT user_id) AS total_unique_events_for_user
FROM events
WHERE event_name = $1
AND ts >= $2 AND ts < $3";

const TIME_BREAKDOWN_SQL: &str = "SELECT
    date_trunc($1, ts, 'UTC') AS bucket,
    COUNT(*) AS total_events,
    COUNT(DISTINCT user_id) AS total_unique_events_for_user
FROM events
WHERE event_name = $2
AND ts >= $3 AND ts < $4
GROUP BY bucket
ORDER BY bucket";

const CHANNEL_BREAKDOWN_SQL: &str = "SELECT
    channel,
    COUNT(*) AS total_events,
    COUNT(DISTINCT user_id) AS total_unique_events_for_user
FROM events
WHERE event_name = $1
AND ts >= $2 AND ts < $3
GROUP BY channel
ORDER BY channel";

/// Event store over a PostgreSQL connection pool.
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Build the pool and verify connectivity before returning.
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(Some(Duration::from_secs(config.max_lifetime_secs)))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .acquire_timeout(connect_timeout)
            .connect(&config.url)
            .await?;

        let store = Self { pool };
        if let Err(e) = with_deadline(connect_timeout, store.ping()).await {
            store.pool.close().await;
            return Err(e);
        }

        info!("PostgreSQL connection established");
        Ok(store)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the events table and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("PostgreSQL schema verified");
        Ok(())
    }

    fn insert_statement<'a>(events: &'a [Event]) -> QueryBuilder<'a, Postgres> {
        let mut qb: QueryBuilder<'a, Postgres> = QueryBuilder::new(INSERT_PREFIX);
        qb.push_values(events, |mut row, e| {
            row.push_bind(e.fingerprint())
                .push_bind(e.event_name.as_str())
                .push_bind(e.channel.as_str())
                .push_bind(e.campaign())
                .push_bind(e.user_id.as_str())
                .push_bind(e.occurred_at())
                .push_bind(Json(&e.tags))
                .push_bind(Json(&e.metadata));
        });
        qb.push(" ON CONFLICT (dedupe_key) DO NOTHING");
        qb
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_event(&self, event: &Event) -> StoreResult<()> {
        Self::insert_statement(std::slice::from_ref(event))
            .build()
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_events(&self, events: &[Event]) -> StoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        debug!(count = events.len(), "Inserting event batch");
        let start = Instant::now();

        // Dropping the transaction on an early return rolls it back.
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in events.chunks(INSERT_CHUNK_ROWS) {
            let result = Self::insert_statement(chunk)
                .build()
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        metrics::histogram!("store.batch_insert_ms").record(elapsed_ms as f64);
        debug!(
            count = events.len(),
            inserted = inserted,
            duplicates = events.len() as u64 - inserted,
            elapsed_ms = elapsed_ms,
            "Batch insert committed"
        );
        Ok(())
    }

    async fn totals(&self, query: &MetricsQuery) -> StoreResult<Totals> {
        let (total_events, total_unique_events_for_user): (i64, i64) =
            sqlx::query_as(TOTALS_SQL)
                .bind(&query.event_name)
                .bind(query.from)
                .bind(query.to)
                .fetch_one(&self.pool)
                .await?;
        Ok(Totals {
            total_events,
            total_unique_events_for_user,
        })
    }

    async fn time_breakdown(
        &self,
        query: &MetricsQuery,
        granularity: TimeGranularity,
    ) -> StoreResult<Vec<TimeBucketCount>> {
        let rows: Vec<(DateTime<Utc>, i64, i64)> = sqlx::query_as(TIME_BREAKDOWN_SQL)
            .bind(granularity.sql_unit())
            .bind(&query.event_name)
            .bind(query.from)
            .bind(query.to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(bucket, total_events, total_unique_events_for_user)| TimeBucketCount {
                bucket,
                total_events,
                total_unique_events_for_user,
            })
            .collect())
    }

    async fn channel_breakdown(&self, query: &MetricsQuery) -> StoreResult<Vec<ChannelCount>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(CHANNEL_BREAKDOWN_SQL)
            .bind(&query.event_name)
            .bind(query.from)
            .bind(query.to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(channel, total_events, total_unique_events_for_user)| ChannelCount {
                channel,
                total_events,
                total_unique_events_for_user,
            })
            .collect())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
