// Per-subscription batching.
//
// A queue flushes when it reaches its size or when its timer fires,
// whichever comes first. The timer is a spawned task owned by the gateway;
// the queue keeps its abort handle and a generation counter. Every flush
// bumps the generation, so a timer that lost the race to a size-triggered
// flush finds a newer generation and does nothing.

use std::time::Duration;

use beacon_common::protocol::ws::{now_millis, BatchPayload, Envelope, MessageType, SubscriptionOptions};
use beacon_common::types::GatewayEvent;
use tokio::task::AbortHandle;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub default_batch_size: usize,
    pub default_timeout: Duration,
    /// Upper clamp for client-requested batch sizes.
    pub max_batch_size: usize,
    pub compression_enabled: bool,
    /// Frames strictly larger than this are compressed.
    pub compression_threshold_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 10,
            default_timeout: Duration::from_millis(1000),
            max_batch_size: 100,
            compression_enabled: true,
            compression_threshold_bytes: 1024,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchQueue {
    events: Vec<GatewayEvent>,
    generation: u64,
    timer: Option<AbortHandle>,
}

impl BatchQueue {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Abort the pending timer, if any. Queued events are kept.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn drain(&mut self) -> Vec<GatewayEvent> {
        self.generation = self.generation.wrapping_add(1);
        std::mem::take(&mut self.events)
    }
}

impl Drop for BatchQueue {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// What the caller has to do after [`BatchScheduler::enqueue`].
#[derive(Debug)]
pub enum Enqueued {
    /// The queue reached its size; deliver these events now.
    Flush(Vec<GatewayEvent>),
    /// First event of a fresh batch; spawn a timer for `generation`.
    ArmTimer { generation: u64, delay: Duration },
    /// A timer is already pending.
    Queued,
}

#[derive(Debug, Clone)]
pub struct BatchScheduler {
    config: BatchConfig,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Compression threshold, or `None` when compression is off.
    pub fn compression_threshold(&self) -> Option<usize> {
        self.config.compression_enabled.then_some(self.config.compression_threshold_bytes)
    }

    pub fn batch_size_for(&self, options: &SubscriptionOptions) -> usize {
        options
            .batch_size
            .unwrap_or(self.config.default_batch_size)
            .clamp(1, self.config.max_batch_size)
    }

    pub fn timeout_for(&self, options: &SubscriptionOptions) -> Duration {
        options
            .batch_timeout
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout)
    }

    pub fn enqueue(
        &self,
        queue: &mut BatchQueue,
        options: &SubscriptionOptions,
        event: GatewayEvent,
    ) -> Enqueued {
        queue.events.push(event);

        if queue.events.len() >= self.batch_size_for(options) {
            queue.cancel_timer();
            return Enqueued::Flush(queue.drain());
        }

        if queue.timer.is_none() {
            Enqueued::ArmTimer { generation: queue.generation, delay: self.timeout_for(options) }
        } else {
            Enqueued::Queued
        }
    }

    /// Attach a spawned timer. A stale generation aborts the timer instead.
    pub fn arm(&self, queue: &mut BatchQueue, generation: u64, timer: AbortHandle) {
        if generation == queue.generation && !queue.events.is_empty() {
            queue.cancel_timer();
            queue.timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    /// Called from the timer task itself. Returns the batch only if the
    /// timer still owns the current generation.
    pub fn take_expired(&self, queue: &mut BatchQueue, generation: u64) -> Option<Vec<GatewayEvent>> {
        if generation != queue.generation || queue.events.is_empty() {
            return None;
        }
        // Dropping the handle without aborting: this task is the timer.
        queue.timer = None;
        Some(queue.drain())
    }

    /// Explicit flush. Cancels the timer and returns whatever was queued.
    pub fn flush(&self, queue: &mut BatchQueue) -> Option<Vec<GatewayEvent>> {
        queue.cancel_timer();
        if queue.events.is_empty() {
            return None;
        }
        Some(queue.drain())
    }

    pub fn batch_envelope(
        subscription_id: &str,
        events: Vec<GatewayEvent>,
    ) -> Result<Envelope, serde_json::Error> {
        let payload = BatchPayload {
            subscription_id: subscription_id.to_owned(),
            batch_size: events.len(),
            events,
            timestamp: now_millis(),
        };
        Envelope::new(MessageType::Batch, &payload)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(n: u32) -> GatewayEvent {
        GatewayEvent::new("tick", json!({ "n": n }), "test")
    }

    fn options(batch_size: usize) -> SubscriptionOptions {
        SubscriptionOptions { batching: true, batch_size: Some(batch_size), ..Default::default() }
    }

    #[test]
    fn size_trigger_flushes_in_order() {
        let scheduler = BatchScheduler::new(BatchConfig::default());
        let mut queue = BatchQueue::default();
        let opts = options(3);

        assert!(matches!(scheduler.enqueue(&mut queue, &opts, event(1)), Enqueued::ArmTimer { .. }));
        // No timer attached in this test, so the scheduler keeps asking for one.
        assert!(matches!(scheduler.enqueue(&mut queue, &opts, event(2)), Enqueued::ArmTimer { .. }));

        let Enqueued::Flush(events) = scheduler.enqueue(&mut queue, &opts, event(3)) else {
            panic!("third event should flush");
        };
        let ns: Vec<_> = events.iter().map(|e| e.payload["n"].as_u64().unwrap()).collect();
        assert_eq!(ns, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn batch_size_is_clamped() {
        let scheduler = BatchScheduler::new(BatchConfig { max_batch_size: 5, ..Default::default() });
        assert_eq!(scheduler.batch_size_for(&options(50)), 5);
        assert_eq!(scheduler.batch_size_for(&options(0)), 1);
        assert_eq!(scheduler.batch_size_for(&SubscriptionOptions::default()), 5);
    }

    #[test]
    fn timeout_defaults_when_unset_or_zero() {
        let scheduler = BatchScheduler::new(BatchConfig::default());
        let mut opts = options(3);
        assert_eq!(scheduler.timeout_for(&opts), Duration::from_millis(1000));
        opts.batch_timeout = Some(0);
        assert_eq!(scheduler.timeout_for(&opts), Duration::from_millis(1000));
        opts.batch_timeout = Some(250);
        assert_eq!(scheduler.timeout_for(&opts), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn stale_timer_generation_is_ignored() {
        let scheduler = BatchScheduler::new(BatchConfig::default());
        let mut queue = BatchQueue::default();
        let opts = options(2);

        let Enqueued::ArmTimer { generation, .. } = scheduler.enqueue(&mut queue, &opts, event(1))
        else {
            panic!("first event should arm a timer");
        };
        let timer = tokio::spawn(std::future::pending::<()>());
        scheduler.arm(&mut queue, generation, timer.abort_handle());
        assert!(queue.has_timer());

        // Size trigger wins the race and cancels the timer.
        assert!(matches!(scheduler.enqueue(&mut queue, &opts, event(2)), Enqueued::Flush(_)));
        assert!(!queue.has_timer());
        assert!(timer.await.unwrap_err().is_cancelled());

        // A late timer for the old generation must not flush the next batch.
        let _ = scheduler.enqueue(&mut queue, &opts, event(3));
        assert!(scheduler.take_expired(&mut queue, generation).is_none());
        assert_eq!(queue.len(), 1);

        let current = queue.generation();
        let flushed = scheduler.take_expired(&mut queue, current).expect("current timer flushes");
        assert_eq!(flushed.len(), 1);
    }

    #[tokio::test]
    async fn arming_a_stale_generation_aborts_the_timer() {
        let scheduler = BatchScheduler::new(BatchConfig::default());
        let mut queue = BatchQueue::default();
        let timer = tokio::spawn(std::future::pending::<()>());

        scheduler.arm(&mut queue, 7, timer.abort_handle());
        assert!(!queue.has_timer());
        assert!(timer.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn explicit_flush_on_empty_queue_is_none() {
        let scheduler = BatchScheduler::new(BatchConfig::default());
        let mut queue = BatchQueue::default();
        assert!(scheduler.flush(&mut queue).is_none());
    }

    #[test]
    fn batch_envelope_reports_size() {
        let envelope =
            BatchScheduler::batch_envelope("s1", vec![event(1), event(2)]).expect("envelope");
        let payload: BatchPayload = envelope.payload_as().expect("batch payload");
        assert_eq!(payload.batch_size, 2);
        assert_eq!(payload.subscription_id, "s1");
    }
}
