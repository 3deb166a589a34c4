//! Persistence port shared by the batch writer, the metrics engine and the
//! health probe.

use crate::error::StoreResult;
use async_trait::async_trait;
use fast_ingest_core::types::{ChannelCount, Event, MetricsQuery, TimeBucketCount, TimeGranularity, Totals};

/// Durable event store.
///
/// Inserts are idempotent on the event fingerprint: a duplicate is a silent
/// no-op, never an error. All read queries use the half-open range
/// `[query.from, query.to)` and filter on `query.event_name`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Liveness check.
    async fn ping(&self) -> StoreResult<()>;

    /// Insert a single event, ignoring duplicates.
    async fn insert_event(&self, event: &Event) -> StoreResult<()>;

    /// Insert a batch atomically: either every novel event is committed or
    /// none is. Duplicates inside or outside the batch are ignored.
    async fn insert_events(&self, events: &[Event]) -> StoreResult<()>;

    /// Event count and distinct user count.
    async fn totals(&self, query: &MetricsQuery) -> StoreResult<Totals>;

    /// Per-bucket counts, ascending by bucket start.
    async fn time_breakdown(
        &self,
        query: &MetricsQuery,
        granularity: TimeGranularity,
    ) -> StoreResult<Vec<TimeBucketCount>>;

    /// Per-channel counts, ascending by channel name.
    async fn channel_breakdown(&self, query: &MetricsQuery) -> StoreResult<Vec<ChannelCount>>;

    /// Release connections. Further calls may fail.
    async fn close(&self) {}

    /// Backend name for logs.
    fn backend_name(&self) -> &'static str;
}
