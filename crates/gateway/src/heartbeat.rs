// Liveness sweeps.

use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::registry::{CloseReason, ConnectionRegistry, RemovedConnection};

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Sweep and probe period.
    pub interval: Duration,
    /// Connections idle longer than this are evicted.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30), timeout: Duration::from_secs(60) }
    }
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub pinged: usize,
    pub evicted: Vec<RemovedConnection>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Evict every connection idle past the timeout, then probe the rest.
    ///
    /// Eviction and pinging happen in one pass under the caller's lock, so a
    /// connection is never both evicted and pinged in the same sweep.
    pub fn sweep(&self, registry: &mut ConnectionRegistry, now: Instant) -> SweepReport {
        let stale: Vec<String> = registry
            .connections()
            .filter(|connection| {
                now.saturating_duration_since(connection.stats.last_activity) > self.config.timeout
            })
            .map(|connection| connection.id.clone())
            .collect();

        let mut report = SweepReport::default();
        for connection_id in stale {
            if let Some(removed) = registry.remove(&connection_id, CloseReason::HeartbeatTimeout) {
                info!(
                    connection_id = %removed.id,
                    idle_ms = now.saturating_duration_since(removed.stats.last_activity).as_millis() as u64,
                    "evicting unresponsive connection"
                );
                report.evicted.push(removed);
            }
        }

        let mut dead = Vec::new();
        for connection in registry.connections_mut() {
            match connection.ping(now) {
                Ok(()) => report.pinged += 1,
                Err(_) => dead.push(connection.id.clone()),
            }
        }
        for connection_id in dead {
            if let Some(removed) = registry.remove(&connection_id, CloseReason::SocketError) {
                report.evicted.push(removed);
            }
        }

        report
    }
}
