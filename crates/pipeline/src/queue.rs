//! Bounded admission queue between request handlers and the batch writer.
//!
//! Producers never wait: a full queue is reported immediately so the HTTP
//! layer can answer with a back-pressure status. Built on a bounded tokio
//! mpsc channel, which gives FIFO order and an atomic capacity check.

use fast_ingest_core::error::{IngestError, IngestResult};
use fast_ingest_core::types::Event;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Producer side. Cheap to clone, one per request handler.
#[derive(Clone)]
pub struct AdmissionQueue {
    sender: mpsc::Sender<Event>,
}

/// Consumer side, owned by the single batch writer.
pub struct QueueDrain {
    receiver: mpsc::Receiver<Event>,
}

impl AdmissionQueue {
    /// Create a queue holding at most `capacity` events.
    ///
    /// # Panics
    /// If `capacity` is zero. `AppConfig::validate` rejects that earlier.
    pub fn bounded(capacity: usize) -> (AdmissionQueue, QueueDrain) {
        let (sender, receiver) = mpsc::channel(capacity);
        (AdmissionQueue { sender }, QueueDrain { receiver })
    }

    /// Admit one event without blocking.
    pub fn enqueue(&self, event: Event) -> IngestResult<()> {
        match self.sender.try_send(event) {
            Ok(()) => {
                metrics::counter!("ingest.accepted").increment(1);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                metrics::counter!("ingest.queue_full").increment(1);
                Err(IngestError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(IngestError::ShuttingDown),
        }
    }

    /// Admit every event or none of them, without blocking.
    ///
    /// Capacity for the whole batch is reserved up front, so a bulk request
    /// never ends up partially queued.
    pub fn enqueue_all(&self, events: Vec<Event>) -> IngestResult<usize> {
        let count = events.len();
        if count == 0 {
            return Ok(0);
        }
        if self.is_closed() {
            return Err(IngestError::ShuttingDown);
        }
        if count > self.capacity() {
            metrics::counter!("ingest.queue_full").increment(count as u64);
            return Err(IngestError::QueueFull);
        }
        let permits = match self.sender.try_reserve_many(count) {
            Ok(permits) => permits,
            Err(TrySendError::Full(())) => {
                metrics::counter!("ingest.queue_full").increment(count as u64);
                return Err(IngestError::QueueFull);
            }
            Err(TrySendError::Closed(())) => return Err(IngestError::ShuttingDown),
        };
        for (permit, event) in permits.zip(events) {
            permit.send(event);
        }
        metrics::counter!("ingest.accepted").increment(count as u64);
        Ok(count)
    }

    /// Number of events currently waiting for the writer.
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl QueueDrain {
    /// Next event in arrival order. `None` once the queue is closed and
    /// empty, or every producer handle is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Close the queue and move everything still in it into `out`.
    ///
    /// Waits for producers that already hold capacity to finish sending, so
    /// nothing admitted before the close is lost. Returns how many events
    /// were moved.
    pub async fn close_and_drain(&mut self, out: &mut Vec<Event>) -> usize {
        self.receiver.close();
        let mut moved = 0;
        while let Some(event) = self.receiver.recv().await {
            out.push(event);
            moved += 1;
        }
        moved
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event(n: i64) -> Event {
        Event {
            event_name: "click".into(),
            channel: "web".into(),
            campaign_id: None,
            user_id: format!("u{n}"),
            timestamp: 1_000 + n,
            tags: vec![],
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_below_capacity_preserves_order() {
        let (queue, mut drain) = AdmissionQueue::bounded(4);
        for n in 0..4 {
            queue.enqueue(event(n)).unwrap();
        }
        assert_eq!(queue.depth(), 4);

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(drain.recv().await.unwrap().timestamp);
        }
        assert_eq!(order, vec![1000, 1001, 1002, 1003]);
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_enqueue_at_capacity_is_queue_full() {
        let (queue, _drain) = AdmissionQueue::bounded(2);
        queue.enqueue(event(0)).unwrap();
        queue.enqueue(event(1)).unwrap();
        for n in 2..10 {
            assert!(matches!(queue.enqueue(event(n)), Err(IngestError::QueueFull)));
        }
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn test_space_frees_after_recv() {
        let (queue, mut drain) = AdmissionQueue::bounded(1);
        queue.enqueue(event(0)).unwrap();
        assert!(queue.enqueue(event(1)).is_err());
        drain.recv().await.unwrap();
        assert!(queue.enqueue(event(2)).is_ok());
    }

    #[test]
    fn test_enqueue_all_is_all_or_nothing() {
        let (queue, _drain) = AdmissionQueue::bounded(5);
        queue.enqueue(event(0)).unwrap();
        queue.enqueue(event(1)).unwrap();

        let batch: Vec<Event> = (10..14).map(event).collect();
        assert!(matches!(queue.enqueue_all(batch), Err(IngestError::QueueFull)));
        assert_eq!(queue.depth(), 2);

        let batch: Vec<Event> = (10..13).map(event).collect();
        assert_eq!(queue.enqueue_all(batch).unwrap(), 3);
        assert_eq!(queue.depth(), 5);
    }

    #[test]
    fn test_enqueue_all_larger_than_capacity() {
        let (queue, _drain) = AdmissionQueue::bounded(3);
        let batch: Vec<Event> = (0..4).map(event).collect();
        assert!(matches!(queue.enqueue_all(batch), Err(IngestError::QueueFull)));
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_close_and_drain_keeps_queued_events() {
        let (queue, mut drain) = AdmissionQueue::bounded(4);
        queue.enqueue(event(0)).unwrap();
        queue.enqueue(event(1)).unwrap();

        let mut out = Vec::new();
        assert_eq!(drain.close_and_drain(&mut out).await, 2);
        assert_eq!(out[0].timestamp, 1000);

        assert!(queue.is_closed());
        assert!(matches!(queue.enqueue(event(2)), Err(IngestError::ShuttingDown)));
        assert!(matches!(
            queue.enqueue_all(vec![event(3)]),
            Err(IngestError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_producers_never_exceed_capacity() {
        let (queue, mut drain) = AdmissionQueue::bounded(100);
        let mut handles = Vec::new();
        for p in 0..8 {
            let q = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut accepted = 0usize;
                for n in 0..50 {
                    if q.enqueue(event(p * 1000 + n)).is_ok() {
                        accepted += 1;
                    }
                }
                accepted
            }));
        }
        let mut accepted = 0;
        for h in handles {
            accepted += h.await.unwrap();
        }
        assert_eq!(accepted, 100);

        let mut out = Vec::new();
        assert_eq!(drain.close_and_drain(&mut out).await, 100);
    }
}
