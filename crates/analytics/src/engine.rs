//! Metrics aggregation over the event store.
//!
//! Totals are always computed. A day/hour grouping adds a time-bucketed
//! breakdown, a channel grouping adds a per-channel breakdown; the two are
//! never combined. A failed totals query fails the request. A failed
//! breakdown query is logged and the result carries totals only.

use fast_ingest_core::types::{GroupBreakdown, GroupBy, MetricsQuery, MetricsResult};
use fast_ingest_storage::error::with_deadline;
use fast_ingest_storage::{EventStore, StoreResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub struct MetricsEngine {
    store: Arc<dyn EventStore>,
    timeout: Duration,
}

impl MetricsEngine {
    pub fn new(store: Arc<dyn EventStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Answer a validated query. Results are built fresh on every call.
    pub async fn query_metrics(&self, query: &MetricsQuery) -> StoreResult<MetricsResult> {
        let totals = with_deadline(self.timeout, self.store.totals(query))
            .await
            .map_err(|e| {
                metrics::counter!("metrics_query.errors").increment(1);
                error!(error = %e, event_name = %query.event_name, "Totals query failed");
                e
            })?;

        let mut result = MetricsResult::new(query, totals);

        if let Some(group_by) = query.group_by {
            match self.breakdown(query, group_by).await {
                Ok(breakdown) => {
                    debug!(
                        group_by = %group_by,
                        rows = breakdown.len(),
                        "Breakdown computed"
                    );
                    result.group_breakdown = Some(breakdown);
                }
                Err(e) => {
                    metrics::counter!("metrics_query.breakdown_errors").increment(1);
                    warn!(
                        error = %e,
                        group_by = %group_by,
                        event_name = %query.event_name,
                        "Breakdown query failed, returning totals only"
                    );
                }
            }
        }

        Ok(result)
    }

    async fn breakdown(&self, query: &MetricsQuery, group_by: GroupBy) -> StoreResult<GroupBreakdown> {
        match group_by.granularity() {
            Some(granularity) => {
                let rows =
                    with_deadline(self.timeout, self.store.time_breakdown(query, granularity)).await?;
                Ok(GroupBreakdown::Time(rows))
            }
            None => {
                let rows = with_deadline(self.timeout, self.store.channel_breakdown(query)).await?;
                Ok(GroupBreakdown::Channel(rows))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use fast_ingest_core::types::{
        ChannelCount, Event, TimeBucketCount, TimeGranularity, Totals,
    };
    use fast_ingest_storage::{MemoryEventStore, StoreError};

    fn event(channel: &str, user: &str, ts: i64) -> Event {
        Event {
            event_name: "click".into(),
            channel: channel.into(),
            campaign_id: None,
            user_id: user.into(),
            timestamp: ts,
            tags: vec![],
            metadata: Default::default(),
        }
    }

    fn query(from: i64, to: i64, group_by: Option<GroupBy>) -> MetricsQuery {
        MetricsQuery {
            event_name: "click".into(),
            from: DateTime::from_timestamp(from, 0).unwrap(),
            to: DateTime::from_timestamp(to, 0).unwrap(),
            group_by,
        }
    }

    fn engine(store: Arc<dyn EventStore>) -> MetricsEngine {
        MetricsEngine::new(store, Duration::from_secs(5))
    }

    /// Totals work; every breakdown fails.
    struct BrokenBreakdownStore;

    #[async_trait]
    impl EventStore for BrokenBreakdownStore {
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }
        async fn insert_event(&self, _event: &Event) -> StoreResult<()> {
            Ok(())
        }
        async fn insert_events(&self, _events: &[Event]) -> StoreResult<()> {
            Ok(())
        }
        async fn totals(&self, _query: &MetricsQuery) -> StoreResult<Totals> {
            Ok(Totals {
                total_events: 3,
                total_unique_events_for_user: 2,
            })
        }
        async fn time_breakdown(
            &self,
            _query: &MetricsQuery,
            _granularity: TimeGranularity,
        ) -> StoreResult<Vec<TimeBucketCount>> {
            Err(StoreError::Unavailable("bucket query failed".into()))
        }
        async fn channel_breakdown(&self, _query: &MetricsQuery) -> StoreResult<Vec<ChannelCount>> {
            Err(StoreError::Unavailable("channel query failed".into()))
        }
        fn backend_name(&self) -> &'static str {
            "broken-breakdown"
        }
    }

    /// Every read fails.
    struct OfflineStore;

    #[async_trait]
    impl EventStore for OfflineStore {
        async fn ping(&self) -> StoreResult<()> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn insert_event(&self, _event: &Event) -> StoreResult<()> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn insert_events(&self, _events: &[Event]) -> StoreResult<()> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn totals(&self, _query: &MetricsQuery) -> StoreResult<Totals> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn time_breakdown(
            &self,
            _query: &MetricsQuery,
            _granularity: TimeGranularity,
        ) -> StoreResult<Vec<TimeBucketCount>> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn channel_breakdown(&self, _query: &MetricsQuery) -> StoreResult<Vec<ChannelCount>> {
            Err(StoreError::Unavailable("offline".into()))
        }
        fn backend_name(&self) -> &'static str {
            "offline"
        }
    }

    #[tokio::test]
    async fn test_channel_grouping_scenario() {
        let store = Arc::new(MemoryEventStore::new());
        store
            .insert_events(&[event("web", "u1", 1000), event("web", "u2", 1000)])
            .await
            .unwrap();

        let result = engine(store)
            .query_metrics(&query(0, 2000, Some(GroupBy::Channel)))
            .await
            .unwrap();

        assert_eq!(result.total_events, 2);
        assert_eq!(result.total_unique_events_for_user, 2);
        assert_eq!(
            result.group_breakdown,
            Some(GroupBreakdown::Channel(vec![ChannelCount {
                channel: "web".into(),
                total_events: 2,
                total_unique_events_for_user: 2,
            }]))
        );
    }

    #[tokio::test]
    async fn test_empty_range_is_zero_not_error() {
        let store = Arc::new(MemoryEventStore::new());
        let result = engine(store).query_metrics(&query(0, 2000, None)).await.unwrap();
        assert_eq!(result.total_events, 0);
        assert_eq!(result.total_unique_events_for_user, 0);
        assert!(result.group_by.is_none());
        assert!(result.group_breakdown.is_none());
    }

    #[tokio::test]
    async fn test_day_grouping_ascending_buckets() {
        let store = Arc::new(MemoryEventStore::new());
        store
            .insert_events(&[
                event("web", "u1", 86_400 + 5),
                event("app", "u1", 10),
                event("web", "u2", 20),
            ])
            .await
            .unwrap();

        let result = engine(store)
            .query_metrics(&query(0, 3 * 86_400, Some(GroupBy::Day)))
            .await
            .unwrap();

        assert_eq!(result.total_events, 3);
        assert_eq!(result.total_unique_events_for_user, 2);
        match result.group_breakdown.unwrap() {
            GroupBreakdown::Time(rows) => {
                let buckets: Vec<i64> = rows.iter().map(|r| r.bucket.timestamp()).collect();
                assert_eq!(buckets, vec![0, 86_400]);
                assert_eq!(rows[0].total_events, 2);
                assert_eq!(rows[0].total_unique_events_for_user, 2);
            }
            other => panic!("expected time breakdown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_breakdown_failure_degrades_to_totals() {
        let engine = engine(Arc::new(BrokenBreakdownStore));
        for group_by in [GroupBy::Day, GroupBy::Hour, GroupBy::Channel] {
            let result = engine
                .query_metrics(&query(0, 2000, Some(group_by)))
                .await
                .unwrap();
            assert_eq!(result.total_events, 3);
            assert_eq!(result.group_by, Some(group_by));
            assert!(result.group_breakdown.is_none());
        }
    }

    #[tokio::test]
    async fn test_totals_failure_is_an_error() {
        let engine = engine(Arc::new(OfflineStore));
        assert!(engine.query_metrics(&query(0, 2000, None)).await.is_err());
    }

    #[tokio::test]
    async fn test_result_echoes_query() {
        let store = Arc::new(MemoryEventStore::new());
        let result = engine(store)
            .query_metrics(&query(0, 2000, Some(GroupBy::Hour)))
            .await
            .unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["event_name"], "click");
        assert_eq!(json["from"], "1970-01-01T00:00:00Z");
        assert_eq!(json["group_by"], "hour");
        assert_eq!(json["group_breakdown"], serde_json::json!([]));
    }
}
