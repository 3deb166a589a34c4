//! Background writer that batches admitted events and flushes them to the
//! event store.
//!
//! A flush happens when the batch reaches `batch_size`, when the flush
//! interval ticks, or once on shutdown. A failed flush is handed to the
//! [`FlushFailurePolicy`] and the batch is cleared either way; the writer never
//! retries or requeues on its own.

use crate::policy::{FlushFailurePolicy, LogAndDrop};
use crate::queue::QueueDrain;
use fast_ingest_core::config::PipelineConfig;
use fast_ingest_core::types::Event;
use fast_ingest_storage::error::with_deadline;
use fast_ingest_storage::{EventStore, StoreError, StoreResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Deadline for a single store call. Expiry counts as a failed flush.
    pub store_timeout: Duration,
    /// Budget for the final flush after shutdown. Whatever is still unsent
    /// when it runs out goes to the failure policy.
    pub shutdown_grace: Duration,
}

impl From<&PipelineConfig> for WriterConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            store_timeout: config.store_timeout(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// The sole consumer of the admission queue.
pub struct BatchWriter {
    store: Arc<dyn EventStore>,
    policy: Arc<dyn FlushFailurePolicy>,
    config: WriterConfig,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn EventStore>, config: WriterConfig) -> Self {
        Self {
            store,
            policy: Arc::new(LogAndDrop),
            config,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn FlushFailurePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Spawn [`run`](Self::run) on the tokio runtime.
    pub fn spawn(self, drain: QueueDrain, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(drain, shutdown).await;
        })
    }

    /// Consume the queue until `shutdown` is cancelled or every producer is
    /// gone, then close the queue and flush whatever is left.
    pub async fn run(self, mut drain: QueueDrain, shutdown: CancellationToken) {
        let batch_size = self.config.batch_size;
        let mut buffer: Vec<Event> = Vec::with_capacity(batch_size);
        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            backend = self.store.backend_name(),
            batch_size = batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "Batch writer started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.flush(&mut buffer).await;
                }
                maybe = drain.recv() => match maybe {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= batch_size {
                            self.flush(&mut buffer).await;
                        }
                    }
                    None => {
                        info!("Admission queue closed by all producers");
                        break;
                    }
                },
            }
        }

        self.finish(drain, buffer).await;
    }

    async fn finish(&self, mut drain: QueueDrain, mut buffer: Vec<Event>) {
        let deadline = Instant::now() + self.config.shutdown_grace;
        let residual = drain.close_and_drain(&mut buffer).await;
        info!(
            pending = buffer.len(),
            residual = residual,
            "Batch writer shutting down, final flush"
        );

        let mut remaining = buffer.as_slice();
        while !remaining.is_empty() {
            let budget = deadline
                .saturating_duration_since(Instant::now())
                .min(self.config.store_timeout);
            if budget.is_zero() {
                let error = StoreError::Timeout(self.config.shutdown_grace);
                self.abandon(remaining, &error).await;
                break;
            }

            let (chunk, rest) = remaining.split_at(remaining.len().min(self.config.batch_size));
            match self.write(chunk, budget).await {
                Ok(()) => remaining = rest,
                Err(e) => {
                    self.abandon(remaining, &e).await;
                    break;
                }
            }
        }

        info!("Batch writer stopped");
    }

    /// Hand everything left after a failed or overdue final flush to the
    /// failure policy in one call.
    async fn abandon(&self, remaining: &[Event], error: &StoreError) {
        warn!(
            count = remaining.len(),
            error = %error,
            "Final flush abandoned"
        );
        self.policy.on_flush_failure(remaining, error).await;
    }

    async fn flush(&self, buffer: &mut Vec<Event>) {
        if buffer.is_empty() {
            return;
        }
        debug!(count = buffer.len(), "Flushing event batch");

        let batch = buffer.as_slice();
        if let Err(e) = self.write(batch, self.config.store_timeout).await {
            self.policy.on_flush_failure(batch, &e).await;
        }

        buffer.clear();
    }

    async fn write(&self, batch: &[Event], timeout: Duration) -> StoreResult<()> {
        let result = with_deadline(timeout, self.store.insert_events(batch)).await;
        match &result {
            Ok(()) => {
                metrics::counter!("writer.flushed").increment(batch.len() as u64);
                debug!(count = batch.len(), "Event batch flushed");
            }
            Err(_) => {
                metrics::counter!("writer.flush_errors").increment(1);
            }
        }
        result
    }
}
