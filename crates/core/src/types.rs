use crate::dedup;
use crate::error::{IngestError, IngestResult};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single analytics event as submitted by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Event {
    pub event_name: String,
    pub channel: String,
    #[serde(default)]
    pub campaign_id: Option<String>,
    pub user_id: String,
    /// Seconds or milliseconds since the epoch; see [`dedup::normalize_timestamp`].
    pub timestamp: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Absent and `null` both decode to the empty value.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Event {
    /// Check required fields. Invalid events never enter the pipeline.
    pub fn validate(&self) -> IngestResult<()> {
        if self.event_name.is_empty() || self.channel.is_empty() || self.user_id.is_empty() {
            return Err(IngestError::validation("missing required fields"));
        }
        if self.timestamp == 0 {
            return Err(IngestError::validation("missing required fields"));
        }
        if dedup::normalize_timestamp(self.timestamp).is_none() {
            return Err(IngestError::validation("timestamp out of range"));
        }
        Ok(())
    }

    /// Campaign id with empty strings folded into `None`.
    pub fn campaign(&self) -> Option<&str> {
        self.campaign_id.as_deref().filter(|c| !c.is_empty())
    }

    /// Event time in UTC. Falls back to the epoch for events that were never
    /// validated.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        dedup::normalize_timestamp(self.timestamp).unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn fingerprint(&self) -> String {
        dedup::fingerprint(self)
    }
}

// ─── Metrics query ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Day,
    Hour,
    Channel,
}

impl GroupBy {
    /// Time granularity for bucketed groupings, `None` for channel grouping.
    pub fn granularity(self) -> Option<TimeGranularity> {
        match self {
            GroupBy::Day => Some(TimeGranularity::Day),
            GroupBy::Hour => Some(TimeGranularity::Hour),
            GroupBy::Channel => None,
        }
    }
}

impl FromStr for GroupBy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(GroupBy::Day),
            "hour" => Ok(GroupBy::Hour),
            "channel" => Ok(GroupBy::Channel),
            _ => Err(IngestError::validation("invalid group_by value")),
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupBy::Day => "day",
            GroupBy::Hour => "hour",
            GroupBy::Channel => "channel",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeGranularity {
    Day,
    Hour,
}

impl TimeGranularity {
    fn seconds(self) -> i64 {
        match self {
            TimeGranularity::Day => 86_400,
            TimeGranularity::Hour => 3_600,
        }
    }

    /// Unit name understood by PostgreSQL's `date_trunc`.
    pub fn sql_unit(self) -> &'static str {
        match self {
            TimeGranularity::Day => "day",
            TimeGranularity::Hour => "hour",
        }
    }

    /// Truncate an instant to the start of its UTC bucket.
    pub fn truncate(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let start = secs - secs.rem_euclid(self.seconds());
        DateTime::from_timestamp(start, 0).unwrap_or(ts)
    }
}

/// Raw metrics request as it arrives in a query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsRequest {
    pub event_name: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub group_by: Option<String>,
}

impl MetricsRequest {
    /// Validate into a [`MetricsQuery`]. `from` must not be older than
    /// `max_lookback_days` before `now`.
    pub fn validate(self, now: DateTime<Utc>, max_lookback_days: i64) -> IngestResult<MetricsQuery> {
        let (from, to) = match (self.from.as_deref(), self.to.as_deref()) {
            (Some(f), Some(t)) if !f.is_empty() && !t.is_empty() => (f, t),
            _ => {
                return Err(IngestError::validation(
                    "from and to query parameters are required",
                ))
            }
        };
        let from: i64 = from
            .parse()
            .map_err(|_| IngestError::validation("invalid from timestamp"))?;
        let to: i64 = to
            .parse()
            .map_err(|_| IngestError::validation("invalid to timestamp"))?;

        let event_name = self.event_name.unwrap_or_default();
        if event_name.is_empty() {
            return Err(IngestError::validation("event_name is required"));
        }

        let group_by = match self.group_by.as_deref() {
            None | Some("") => None,
            Some(g) => Some(g.parse::<GroupBy>()?),
        };

        if from >= to {
            return Err(IngestError::validation("from must be before to"));
        }

        let from = DateTime::from_timestamp(from, 0)
            .ok_or_else(|| IngestError::validation("invalid from timestamp"))?;
        let to = DateTime::from_timestamp(to, 0)
            .ok_or_else(|| IngestError::validation("invalid to timestamp"))?;

        if from < now - Duration::days(max_lookback_days) {
            return Err(IngestError::validation(format!(
                "from must be within the last {max_lookback_days} days"
            )));
        }

        Ok(MetricsQuery {
            event_name,
            from,
            to,
            group_by,
        })
    }
}

/// A validated aggregate query over the half-open range `[from, to)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsQuery {
    pub event_name: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub group_by: Option<GroupBy>,
}

impl MetricsQuery {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.from && ts < self.to
    }
}

// ─── Metrics result ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub total_events: i64,
    pub total_unique_events_for_user: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBucketCount {
    pub bucket: DateTime<Utc>,
    pub total_events: i64,
    pub total_unique_events_for_user: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCount {
    pub channel: String,
    pub total_events: i64,
    pub total_unique_events_for_user: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupBreakdown {
    Time(Vec<TimeBucketCount>),
    Channel(Vec<ChannelCount>),
}

impl GroupBreakdown {
    pub fn len(&self) -> usize {
        match self {
            GroupBreakdown::Time(rows) => rows.len(),
            GroupBreakdown::Channel(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Assembled answer to a [`MetricsQuery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsResult {
    pub event_name: String,
    pub from: String,
    pub to: String,
    pub total_events: i64,
    pub total_unique_events_for_user: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<GroupBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_breakdown: Option<GroupBreakdown>,
}

impl MetricsResult {
    pub fn new(query: &MetricsQuery, totals: Totals) -> Self {
        Self {
            event_name: query.event_name.clone(),
            from: format_instant(query.from),
            to: format_instant(query.to),
            total_events: totals.total_events,
            total_unique_events_for_user: totals.total_unique_events_for_user,
            group_by: query.group_by,
            group_breakdown: None,
        }
    }
}

/// RFC 3339, UTC, whole seconds, `Z` suffix.
pub fn format_instant(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
