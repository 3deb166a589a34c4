//! What the writer does with a batch whose flush failed.

use async_trait::async_trait;
use fast_ingest_core::types::Event;
use fast_ingest_storage::StoreError;
use tracing::{debug, error};

/// Hook invoked once per failed flush, before the batch buffer is cleared.
///
/// The default [`LogAndDrop`] favours admission latency over durability.
/// Retry-with-backoff or a dead-letter sink can be plugged in here without
/// touching the writer loop.
#[async_trait]
pub trait FlushFailurePolicy: Send + Sync {
    async fn on_flush_failure(&self, batch: &[Event], error: &StoreError);
}

/// Log the failure and every dropped event's fingerprint, then give up.
pub struct LogAndDrop;

#[async_trait]
impl FlushFailurePolicy for LogAndDrop {
    async fn on_flush_failure(&self, batch: &[Event], error: &StoreError) {
        metrics::counter!("writer.dropped").increment(batch.len() as u64);
        error!(
            error = %error,
            count = batch.len(),
            "Failed to flush event batch, dropping events"
        );
        for event in batch {
            debug!(
                fingerprint = %event.fingerprint(),
                event_name = %event.event_name,
                "Dropped event"
            );
        }
    }
}
