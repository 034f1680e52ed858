// External event bus boundary.
//
// Domain services publish through the bus; the gateway consumes its
// notification stream and fans events out to subscribers.

pub mod breaker;

use async_trait::async_trait;
use beacon_common::types::GatewayEvent;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

pub use breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};

const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Circuit name used for publishes from clients.
pub const PUBLISH_CIRCUIT: &str = "event-bus.publish";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,
    #[error("event bus rejected the event: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: GatewayEvent) -> Result<(), BusError>;

    /// Stream of every event published from now on.
    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent>;
}

/// Single-process bus over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: GatewayEvent) -> Result<(), BusError> {
        debug!(event_id = %event.id, event_type = %event.event_type, "publishing event");
        // No receivers is not a failure: nobody is listening yet.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }
}
