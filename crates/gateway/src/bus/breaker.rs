// Per-upstream circuit breaking.
//
// Each named circuit counts consecutive failures. At the threshold it opens
// and calls fail fast until the reset timeout passes; then a single trial
// call is let through (half-open) and its outcome closes or reopens it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before a trial.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakerError<E> {
    #[error("circuit `{name}` is open")]
    Open { name: String },
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self { state: CircuitState::Closed, failures: 0, opened_at: None, trial_in_flight: false }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, circuits: Mutex::new(HashMap::new()) }
    }

    /// Run `operation` through the circuit called `name`.
    ///
    /// With a `fallback`, a rejected or failed call yields the fallback value
    /// instead of an error. The lock is never held across the await.
    pub async fn execute<T, E, F>(
        &self,
        name: &str,
        operation: F,
        fallback: Option<T>,
    ) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire(name, Instant::now()) {
            return match fallback {
                Some(value) => Ok(value),
                None => Err(BreakerError::Open { name: name.to_owned() }),
            };
        }

        match operation.await {
            Ok(value) => {
                self.record_success(name);
                Ok(value)
            }
            Err(error) => {
                self.record_failure(name, Instant::now());
                match fallback {
                    Some(value) => Ok(value),
                    None => Err(BreakerError::Inner(error)),
                }
            }
        }
    }

    /// Current state, reporting an open circuit past its timeout as half-open.
    pub fn state(&self, name: &str) -> CircuitState {
        let circuits = self.lock();
        match circuits.get(name) {
            None => CircuitState::Closed,
            Some(circuit)
                if circuit.state == CircuitState::Open && self.reset_due(circuit, Instant::now()) =>
            {
                CircuitState::HalfOpen
            }
            Some(circuit) => circuit.state,
        }
    }

    pub fn reset(&self, name: &str) {
        self.lock().remove(name);
    }

    fn try_acquire(&self, name: &str, now: Instant) -> bool {
        let mut circuits = self.lock();
        let circuit = circuits.entry(name.to_owned()).or_insert_with(Circuit::new);
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !self.reset_due(circuit, now) {
                    return false;
                }
                circuit.state = CircuitState::HalfOpen;
                circuit.opened_at = Some(now);
                circuit.trial_in_flight = true;
                info!(circuit = name, "circuit half-open, allowing trial call");
                true
            }
            CircuitState::HalfOpen => {
                // A trial whose caller went away never reports back; retry
                // after another timeout.
                if circuit.trial_in_flight && !self.reset_due(circuit, now) {
                    return false;
                }
                circuit.opened_at = Some(now);
                circuit.trial_in_flight = true;
                true
            }
        }
    }

    fn record_success(&self, name: &str) {
        let mut circuits = self.lock();
        let Some(circuit) = circuits.get_mut(name) else {
            return;
        };
        if circuit.state != CircuitState::Closed {
            info!(circuit = name, "circuit closed");
        }
        *circuit = Circuit::new();
    }

    fn record_failure(&self, name: &str, now: Instant) {
        let mut circuits = self.lock();
        let circuit = circuits.entry(name.to_owned()).or_insert_with(Circuit::new);
        circuit.failures = circuit.failures.saturating_add(1);
        circuit.trial_in_flight = false;

        let reopen = circuit.state == CircuitState::HalfOpen;
        if reopen || circuit.failures >= self.config.failure_threshold {
            if circuit.state != CircuitState::Open {
                warn!(circuit = name, failures = circuit.failures, "circuit opened");
            }
            circuit.state = CircuitState::Open;
            circuit.opened_at = Some(now);
        }
    }

    fn reset_due(&self, circuit: &Circuit, now: Instant) -> bool {
        circuit
            .opened_at
            .is_none_or(|opened| now.saturating_duration_since(opened) >= self.config.reset_timeout)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
        })
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        breaker.execute("bus", async { Err("boom") }, None).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        breaker.execute("bus", async { Ok(7) }, None).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let breaker = breaker(3, 1_000);
        for _ in 0..3 {
            assert_eq!(fail(&breaker).await, Err(BreakerError::Inner("boom")));
        }
        assert_eq!(breaker.state("bus"), CircuitState::Open);

        let mut called = false;
        let result: Result<u32, BreakerError<&str>> = breaker
            .execute(
                "bus",
                async {
                    called = true;
                    Ok(1)
                },
                None,
            )
            .await;
        assert_eq!(result, Err(BreakerError::Open { name: "bus".into() }));
        assert!(!called, "open circuit must not run the operation");
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let breaker = breaker(3, 1_000);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(succeed(&breaker).await, Ok(7));
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state("bus"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_closes_or_reopens() {
        let breaker = breaker(1, 1_000);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state("bus"), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(breaker.state("bus"), CircuitState::HalfOpen);

        // Failed trial reopens for another full timeout.
        assert_eq!(fail(&breaker).await, Err(BreakerError::Inner("boom")));
        assert_eq!(breaker.state("bus"), CircuitState::Open);
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open { .. })));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(succeed(&breaker).await, Ok(7));
        assert_eq!(breaker.state("bus"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_replaces_rejection_and_failure() {
        let breaker = breaker(1, 1_000);
        let failed: Result<u32, BreakerError<&str>> =
            breaker.execute("bus", async { Err("boom") }, Some(0)).await;
        assert_eq!(failed, Ok(0));

        let rejected: Result<u32, BreakerError<&str>> =
            breaker.execute("bus", async { Ok(9) }, Some(0)).await;
        assert_eq!(rejected, Ok(0));
    }

    #[tokio::test(start_paused = true)]
    async fn circuits_are_independent_by_name() {
        let breaker = breaker(1, 1_000);
        let _ = fail(&breaker).await;
        let other: Result<u32, BreakerError<&str>> =
            breaker.execute("other", async { Ok(1) }, None).await;
        assert_eq!(other, Ok(1));
        assert_eq!(breaker.state("other"), CircuitState::Closed);
    }
}
