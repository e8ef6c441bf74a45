//! Circuit breaker guarding the distributed counter store.
//!
//! ```text
//! Closed → Open:      consecutive failures reach the threshold
//! Open → HalfOpen:    cooldown elapsed, next caller becomes the probe
//! HalfOpen → Closed:  probe succeeds
//! HalfOpen → Open:    probe fails, cooldown restarts
//! ```
//!
//! While open, calls are rejected without touching the dependency. While
//! half-open, only one probe is in flight; everyone else is rejected until it
//! resolves.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{saturating_add, Clock};
use crate::error::FloodgateError;

/// Why a guarded call did not produce a value.
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("Circuit breaker is open")]
    Open,
    #[error(transparent)]
    Failed(FloodgateError),
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

/// Tuning for a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed.
    pub cooldown: Duration,
    /// Upper bound on a single guarded call; exceeding it counts as a failure.
    pub call_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            call_timeout: Duration::from_secs(2),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: &'static str,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

enum Admission {
    Call,
    Probe,
}

/// A consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    name: &'static str,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: &'static str, settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            settings: BreakerSettings {
                failure_threshold: settings.failure_threshold.max(1),
                ..settings
            },
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            clock,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Current state. An open breaker whose cooldown has elapsed still
    /// reports `Open` until the next caller turns it into a probe.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns `BreakerError::Open` without invoking `operation` when the
    /// circuit is open or a probe is already in flight. A call that outlives
    /// `call_timeout` is abandoned and counted as a failure.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let admission = self.admit().ok_or(BreakerError::Open)?;
        let mut probe = ProbeSlot {
            breaker: self,
            held: matches!(admission, Admission::Probe),
        };

        let outcome = match tokio::time::timeout(self.settings.call_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(FloodgateError::BackendUnavailable(format!(
                "{} call timed out after {:?}",
                self.name, self.settings.call_timeout
            ))),
        };

        probe.held = false;
        match outcome {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) if err.is_backend_failure() => {
                self.on_failure(&err);
                Err(BreakerError::Failed(err))
            }
            Err(err) => {
                self.release_probe();
                Err(BreakerError::Failed(err))
            }
        }
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(Admission::Call),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| self.clock.now() >= saturating_add(at, self.settings.cooldown))
                    .unwrap_or(true);
                if !cooled {
                    return None;
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.probe_in_flight = true;
                info!(breaker = self.name, "Circuit breaker half-open, probing dependency");
                Some(Admission::Probe)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(Admission::Probe)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.opened_at = None;
            self.transition(&mut inner, CircuitState::Closed);
            info!(breaker = self.name, "Circuit breaker closed, dependency recovered");
        }
    }

    fn on_failure(&self, err: &FloodgateError) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;

        match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.settings.failure_threshold => {
                inner.opened_at = Some(now);
                self.transition(&mut inner, CircuitState::Open);
                warn!(
                    breaker = self.name,
                    failures = inner.consecutive_failures,
                    threshold = self.settings.failure_threshold,
                    error = %err,
                    "Circuit breaker opened after consecutive failures"
                );
            }
            CircuitState::Closed => {
                debug!(
                    breaker = self.name,
                    failures = inner.consecutive_failures,
                    error = %err,
                    "Guarded call failed"
                );
            }
            CircuitState::HalfOpen => {
                inner.opened_at = Some(now);
                self.transition(&mut inner, CircuitState::Open);
                warn!(breaker = self.name, error = %err, "Circuit breaker probe failed, reopening");
            }
            CircuitState::Open => {}
        }
    }

    fn release_probe(&self) {
        self.inner.lock().probe_in_flight = false;
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        counter!(
            "floodgate_breaker_transitions_total",
            "breaker" => self.name,
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        gauge!("floodgate_breaker_state", "breaker" => self.name).set(to.gauge_value());
    }
}

/// Releases the half-open probe slot if the guarded future is dropped
/// before it resolves.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.breaker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerSettings {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(30),
                call_timeout: Duration::from_millis(100),
            },
            clock,
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError> {
        b.execute(|| async { Err::<(), _>(FloodgateError::BackendUnavailable("down".into())) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, BreakerError> {
        b.execute(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let b = breaker(3, Arc::new(ManualClock::at_epoch()));

        for _ in 0..2 {
            assert!(matches!(fail(&b).await, Err(BreakerError::Failed(_))));
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(matches!(fail(&b).await, Err(BreakerError::Failed(_))));
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.consecutive_failures(), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = breaker(3, Arc::new(ManualClock::at_epoch()));

        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.consecutive_failures(), 0);

        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_short_circuits() {
        let b = breaker(1, Arc::new(ManualClock::at_epoch()));
        fail(&b).await.unwrap_err();

        let calls = AtomicU32::new(0);
        let result = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversized_cooldown_stays_open() {
        let b = CircuitBreaker::new(
            "test",
            BreakerSettings {
                failure_threshold: 1,
                cooldown: Duration::from_secs(10_000_000_000_000),
                call_timeout: Duration::from_millis(100),
            },
            Arc::new(ManualClock::at_epoch()),
        );
        fail(&b).await.unwrap_err();

        assert!(matches!(succeed(&b).await, Err(BreakerError::Open)));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_probe_success_closes() {
        let clock = Arc::new(ManualClock::at_epoch());
        let b = breaker(1, clock.clone());
        fail(&b).await.unwrap_err();

        clock.advance(Duration::from_secs(29));
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open)));

        clock.advance(Duration::from_secs(1));
        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.snapshot().opened_at.is_none());
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_and_restarts_cooldown() {
        let clock = Arc::new(ManualClock::at_epoch());
        let b = breaker(1, clock.clone());
        fail(&b).await.unwrap_err();

        clock.advance(Duration::from_secs(30));
        assert!(matches!(fail(&b).await, Err(BreakerError::Failed(_))));
        assert_eq!(b.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(10));
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn test_half_open_admits_single_probe() {
        let clock = Arc::new(ManualClock::at_epoch());
        let b = Arc::new(breaker(1, clock.clone()));
        fail(&b).await.unwrap_err();
        clock.advance(Duration::from_secs(30));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    release_rx.await.ok();
                    Ok(1)
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        while b.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        // A concurrent caller is turned away while the probe is in flight
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open)));

        release_tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap().unwrap(), 1);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let b = breaker(2, Arc::new(ManualClock::at_epoch()));

        let result = b
            .execute(|| async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;

        match result {
            Err(BreakerError::Failed(FloodgateError::BackendUnavailable(msg))) => {
                assert!(msg.contains("timed out"));
            }
            other => panic!("expected timeout failure, got {:?}", other),
        }
        assert_eq!(b.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_dropped_probe_releases_slot() {
        let clock = Arc::new(ManualClock::at_epoch());
        let b = breaker(1, clock.clone());
        fail(&b).await.unwrap_err();
        clock.advance(Duration::from_secs(30));

        {
            let fut = b.execute(|| async {
                std::future::pending::<()>().await;
                Ok(())
            });
            tokio::pin!(fut);
            assert!(futures::poll!(fut.as_mut()).is_pending());
        }

        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
