//! Content-derived event identity.
//!
//! Producers send timestamps in either seconds or milliseconds since the epoch
//! without saying which. Precision is decided by magnitude: anything above
//! [`MILLIS_THRESHOLD`] is milliseconds. This misreads second timestamps past
//! the year 33658 and millisecond timestamps from early 1970; both are accepted
//! limitations.

use crate::types::Event;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Timestamps strictly greater than this are treated as milliseconds.
pub const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Hex-encoded SHA-256, always 64 characters.
pub const FINGERPRINT_LEN: usize = 64;

/// ASCII unit separator. Not expected inside any identity field.
const FIELD_SEPARATOR: char = '\u{1f}';

/// Resolve an ambiguous-precision timestamp to whole seconds since the epoch.
pub fn normalize_to_seconds(ts: i64) -> i64 {
    if ts > MILLIS_THRESHOLD {
        ts / 1000
    } else {
        ts
    }
}

/// Resolve an ambiguous-precision timestamp to a UTC instant.
///
/// Returns `None` when the normalized value is outside the range chrono can
/// represent.
pub fn normalize_timestamp(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(normalize_to_seconds(ts), 0)
}

/// Stable identity fingerprint over
/// (event name, channel, campaign, user, normalized seconds).
///
/// A missing campaign and an empty campaign hash identically.
pub fn fingerprint(event: &Event) -> String {
    let campaign = event.campaign_id.as_deref().unwrap_or("");
    let seconds = normalize_to_seconds(event.timestamp).to_string();

    let mut hasher = Sha256::new();
    let fields = [
        event.event_name.as_str(),
        event.channel.as_str(),
        campaign,
        event.user_id.as_str(),
        seconds.as_str(),
    ];
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            let mut buf = [0u8; 4];
            hasher.update(FIELD_SEPARATOR.encode_utf8(&mut buf).as_bytes());
        }
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}
