//! In-memory event store backed by DashMap.
//!
//! Same dedup and query semantics as the PostgreSQL store. Used for local
//! development (`--memory-store`) and tests; nothing survives a restart.

use crate::error::StoreResult;
use crate::store::EventStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fast_ingest_core::types::{ChannelCount, Event, MetricsQuery, TimeBucketCount, TimeGranularity, Totals};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Thread-safe in-memory store keyed by event fingerprint.
pub struct MemoryEventStore {
    events: DashMap<String, Event>,
}

#[derive(Default)]
struct Tally<'a> {
    total: i64,
    users: HashSet<&'a str>,
}

impl<'a> Tally<'a> {
    fn add(&mut self, user_id: &'a str) {
        self.total += 1;
        self.users.insert(user_id);
    }

    fn unique(&self) -> i64 {
        self.users.len() as i64
    }
}

impl MemoryEventStore {
    pub fn new() -> Self {
        info!("Event store initialized (in-memory, development mode)");
        Self {
            events: DashMap::new(),
        }
    }

    /// Number of distinct stored events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.events.contains_key(fingerprint)
    }

    /// Snapshot of the stored events matching a query, for aggregation.
    fn matching(&self, query: &MetricsQuery) -> Vec<(DateTime<Utc>, String, String)> {
        self.events
            .iter()
            .filter(|e| e.event_name == query.event_name)
            .filter_map(|e| {
                let at = e.occurred_at();
                query
                    .contains(at)
                    .then(|| (at, e.channel.clone(), e.user_id.clone()))
            })
            .collect()
    }

    fn insert(&self, event: &Event) -> bool {
        match self.events.entry(event.fingerprint()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(event.clone());
                true
            }
        }
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn insert_event(&self, event: &Event) -> StoreResult<()> {
        self.insert(event);
        Ok(())
    }

    async fn insert_events(&self, events: &[Event]) -> StoreResult<()> {
        let inserted = events.iter().filter(|e| self.insert(e)).count();
        debug!(
            count = events.len(),
            inserted = inserted,
            "In-memory batch insert"
        );
        Ok(())
    }

    async fn totals(&self, query: &MetricsQuery) -> StoreResult<Totals> {
        let rows = self.matching(query);
        let mut tally = Tally::default();
        for (_, _, user) in &rows {
            tally.add(user);
        }
        Ok(Totals {
            total_events: tally.total,
            total_unique_events_for_user: tally.unique(),
        })
    }

    async fn time_breakdown(
        &self,
        query: &MetricsQuery,
        granularity: TimeGranularity,
    ) -> StoreResult<Vec<TimeBucketCount>> {
        let rows = self.matching(query);
        let mut buckets: BTreeMap<DateTime<Utc>, Tally> = BTreeMap::new();
        for (at, _, user) in &rows {
            buckets
                .entry(granularity.truncate(*at))
                .or_default()
                .add(user);
        }
        Ok(buckets
            .into_iter()
            .map(|(bucket, tally)| TimeBucketCount {
                bucket,
                total_events: tally.total,
                total_unique_events_for_user: tally.unique(),
            })
            .collect())
    }

    async fn channel_breakdown(&self, query: &MetricsQuery) -> StoreResult<Vec<ChannelCount>> {
        let rows = self.matching(query);
        let mut channels: BTreeMap<&str, Tally> = BTreeMap::new();
        for (_, channel, user) in &rows {
            channels.entry(channel.as_str()).or_default().add(user);
        }
        Ok(channels
            .into_iter()
            .map(|(channel, tally)| ChannelCount {
                channel: channel.to_string(),
                total_events: tally.total,
                total_unique_events_for_user: tally.unique(),
            })
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event(name: &str, channel: &str, user: &str, ts: i64) -> Event {
        Event {
            event_name: name.into(),
            channel: channel.into(),
            campaign_id: None,
            user_id: user.into(),
            timestamp: ts,
            tags: vec![],
            metadata: Default::default(),
        }
    }

    fn query(from: i64, to: i64) -> MetricsQuery {
        MetricsQuery {
            event_name: "click".into(),
            from: DateTime::from_timestamp(from, 0).unwrap(),
            to: DateTime::from_timestamp(to, 0).unwrap(),
            group_by: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_insert_stores_one_row() {
        let store = MemoryEventStore::new();
        let e = event("click", "web", "u1", 1000);
        store.insert_event(&e).await.unwrap();
        store.insert_event(&e).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_millis_duplicate_absorbed() {
        let store = MemoryEventStore::new();
        store
            .insert_events(&[
                event("click", "web", "u1", 1_769_904_000),
                event("click", "web", "u1", 1_769_904_000_000),
            ])
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_totals_empty_range() {
        let store = MemoryEventStore::new();
        let totals = store.totals(&query(0, 2000)).await.unwrap();
        assert_eq!(totals, Totals::default());
    }

    #[tokio::test]
    async fn test_totals_half_open_and_name_filter() {
        let store = MemoryEventStore::new();
        store
            .insert_events(&[
                event("click", "web", "u1", 1000),
                event("click", "web", "u1", 1500),
                event("click", "web", "u2", 2000),
                event("view", "web", "u3", 1000),
            ])
            .await
            .unwrap();
        let totals = store.totals(&query(1000, 2000)).await.unwrap();
        assert_eq!(totals.total_events, 2);
        assert_eq!(totals.total_unique_events_for_user, 1);
    }

    #[tokio::test]
    async fn test_channel_breakdown_sorted() {
        let store = MemoryEventStore::new();
        store
            .insert_events(&[
                event("click", "web", "u1", 1000),
                event("click", "app", "u1", 1001),
                event("click", "web", "u2", 1002),
            ])
            .await
            .unwrap();
        let rows = store.channel_breakdown(&query(0, 2000)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].channel, "app");
        assert_eq!(rows[1].channel, "web");
        assert_eq!(rows[1].total_events, 2);
        assert_eq!(rows[1].total_unique_events_for_user, 2);
    }

    #[tokio::test]
    async fn test_hour_breakdown_ascending() {
        let store = MemoryEventStore::new();
        store
            .insert_events(&[
                event("click", "web", "u1", 7300),
                event("click", "web", "u2", 100),
                event("click", "web", "u2", 200),
            ])
            .await
            .unwrap();
        let rows = store
            .time_breakdown(&query(0, 10_000), TimeGranularity::Hour)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bucket.timestamp(), 0);
        assert_eq!(rows[0].total_events, 2);
        assert_eq!(rows[0].total_unique_events_for_user, 1);
        assert_eq!(rows[1].bucket.timestamp(), 7200);
    }
}
