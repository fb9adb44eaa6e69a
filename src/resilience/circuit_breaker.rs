//! # Circuit Breaker Implementation
//!
//! Classic three-state circuit breaker: Closed (normal operation), Open
//! (failing fast), and HalfOpen (testing recovery). One guarded resource
//! shares one breaker across all of its operations.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, all calls are allowed through.
    Closed,
    /// Failure mode, all calls fail fast without executing.
    Open,
    /// Testing recovery, the next call is allowed through as a probe.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker thresholds for one guarded resource.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures tolerated before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a recovery probe is allowed.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Errors that can occur during circuit breaker operation.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not attempted.
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation was executed and failed; the failure was recorded.
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// Point-in-time view of breaker bookkeeping, for stats surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    /// A half-open probe is in flight; further callers fail fast until its
    /// outcome is recorded.
    probe_in_flight: bool,
}

/// Circuit breaker guarding every operation of one backend resource.
///
/// State, failure count, and last-failure timestamp live under a single
/// mutex so the allow/record bookkeeping is atomic with the state check.
/// The lock is never held across the guarded operation itself.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_secs = config.recovery_timeout.as_secs(),
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// While the circuit is open and the recovery timeout has not elapsed,
    /// the operation is not invoked at all.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.before_call()?;

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Current circuit state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot of state and failure bookkeeping.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
        }
    }

    /// Component name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Force the circuit open (operator escape hatch).
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.last_failure_at = Some(Instant::now());
        inner.probe_in_flight = false;
    }

    /// Force the circuit closed and reset failure bookkeeping.
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
    }

    fn before_call<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            // Only one probe at a time; everyone else keeps failing fast
            // until its outcome is recorded.
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    debug!(component = %self.name, "Recovery probe in flight, failing fast");
                    Err(CircuitBreakerError::CircuitOpen {
                        component: self.name.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.recovery_timeout);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(component = %self.name, "🟡 Circuit breaker half-open (testing recovery)");
                    Ok(())
                } else {
                    debug!(component = %self.name, "Circuit open, failing fast");
                    Err(CircuitBreakerError::CircuitOpen {
                        component: self.name.clone(),
                    })
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.last_failure_at = None;
            info!(component = %self.name, "🟢 Circuit breaker closed (recovered)");
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                // Probe failed, back to failing fast.
                inner.state = CircuitState::Open;
                error!(
                    component = %self.name,
                    "🔴 Circuit breaker re-opened (recovery probe failed)"
                );
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                error!(
                    component = %self.name,
                    failure_count = inner.failure_count,
                    failure_threshold = self.config.failure_threshold,
                    "🔴 Circuit breaker opened (failing fast)"
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(recovery_ms),
            },
        )
    }

    #[tokio::test]
    async fn normal_operation_stays_closed() {
        let circuit = breaker(3, 100);
        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let circuit = breaker(3, 10_000);

        for _ in 0..2 {
            let _ = circuit.call(|| async { Err::<(), _>("boom") }).await;
            assert_eq!(circuit.state(), CircuitState::Closed);
        }
        let _ = circuit.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        // The fourth call must fail fast without invoking the operation.
        let invoked = AtomicU32::new(0);
        let result = circuit
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let circuit = breaker(1, 50);

        let _ = circuit.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;

        let result = circuit.call(|| async { Ok::<_, String>("ok") }).await;
        assert!(result.is_ok());

        let snapshot = circuit.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let circuit = breaker(1, 50);

        let _ = circuit.call(|| async { Err::<(), _>("boom") }).await;
        sleep(Duration::from_millis(60)).await;

        let _ = circuit.call(|| async { Err::<(), _>("still broken") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        // A call inside the fresh recovery window fails fast again.
        let result = circuit.call(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn half_open_admits_a_single_probe() {
        use std::sync::Arc;
        use tokio::sync::Notify;

        let circuit = Arc::new(breaker(1, 50));
        let _ = circuit.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;

        // First caller after the recovery timeout becomes the probe and
        // blocks on the gate.
        let gate = Arc::new(Notify::new());
        let probe_circuit = Arc::clone(&circuit);
        let probe_gate = Arc::clone(&gate);
        let probe = tokio::spawn(async move {
            probe_circuit
                .call(|| async move {
                    probe_gate.notified().await;
                    Ok::<_, String>("recovered")
                })
                .await
        });

        sleep(Duration::from_millis(20)).await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        // A second caller while the probe is in flight must fail fast
        // without running its operation.
        let invoked = AtomicU32::new(0);
        let result = circuit
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        gate.notify_one();
        assert!(probe.await.unwrap().is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn force_operations() {
        let circuit = breaker(5, 10_000);

        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);

        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }
}
