//! Circuit breaker gating fallible async operations.
//!
//! Each breaker guards exactly one upstream operation (one backend, one
//! channel's reconnect loop). Sustained failure opens the circuit and
//! [`CircuitBreaker::execute`] then fails fast without invoking the
//! operation. After the open timeout the breaker admits trial traffic in
//! *half-open* state: a single failure reopens it, `threshold` consecutive
//! successes close it again.
//!
//! The breaker performs no retries of its own; retry policy belongs to the
//! caller.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Position of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy. Calls pass through.
    Closed,
    /// Tripped. Calls fail fast until the timeout elapses.
    Open,
    /// Probing recovery with trial traffic.
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
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-instance breaker tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures to open; consecutive half-open successes to close.
    pub threshold: u32,
    /// How long an open circuit blocks calls before probing.
    pub timeout: Duration,
}

impl BreakerSettings {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self { threshold, timeout }
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Returned without invoking the operation while the circuit is open.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit open; next probe in {retry_in:?}")]
pub struct CircuitOpenError {
    /// Time remaining until the breaker admits a probe.
    pub retry_in: Duration,
}

/// Outcome of [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error> {
    /// The call was short-circuited; the operation never ran.
    #[error(transparent)]
    Open(#[from] CircuitOpenError),
    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E: std::error::Error> ExecuteError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, ExecuteError::Open(_))
    }
}

/// Read-only view of breaker state for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Remaining open time, if the circuit is open.
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
struct Core {
    state: CircuitState,
    failures: u32,
    successes: u32,
    next_attempt_at: Option<Instant>,
}

/// Three-state gate over one upstream operation.
///
/// State lives behind a mutex and every transition happens inside one locked
/// section, so concurrent callers reporting success and failure never observe
/// a torn state. The lock is never held across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    label: String,
    settings: BreakerSettings,
    core: Mutex<Core>,
}

impl CircuitBreaker {
    pub fn new(label: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            label: label.into(),
            settings,
            core: Mutex::new(Core {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                next_attempt_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gate admission. Open circuits fail fast until `timeout` has elapsed,
    /// then flip to half-open and admit the caller as a probe.
    fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut core = self.lock();
        match core.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let now = Instant::now();
                let next = core.next_attempt_at.unwrap_or(now);
                if now >= next {
                    core.state = CircuitState::HalfOpen;
                    core.successes = 0;
                    debug!(breaker = %self.label, "circuit half-open; admitting trial traffic");
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        retry_in: next - now,
                    })
                }
            }
        }
    }

    /// Run `operation` behind the gate.
    ///
    /// Fails with [`ExecuteError::Open`] without invoking the operation when
    /// the circuit is open and the timeout has not elapsed. Otherwise the
    /// operation runs once and its outcome is recorded.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(ExecuteError::Inner(err))
            }
        }
    }

    /// Record a success: failure count resets; in half-open state,
    /// `threshold` consecutive successes close the circuit.
    pub fn record_success(&self) {
        let mut core = self.lock();
        core.failures = 0;
        if core.state == CircuitState::HalfOpen {
            core.successes += 1;
            if core.successes >= self.settings.threshold {
                core.state = CircuitState::Closed;
                core.successes = 0;
                core.next_attempt_at = None;
                debug!(breaker = %self.label, "circuit closed after successful probes");
            }
        }
    }

    /// Record a failure: any half-open failure reopens immediately; a closed
    /// circuit opens once `threshold` consecutive failures accumulate.
    pub fn record_failure(&self) {
        let mut core = self.lock();
        core.failures += 1;
        match core.state {
            CircuitState::HalfOpen => self.trip(&mut core),
            CircuitState::Closed if core.failures >= self.settings.threshold => {
                self.trip(&mut core)
            }
            _ => {}
        }
    }

    fn trip(&self, core: &mut Core) {
        core.state = CircuitState::Open;
        core.failures = 0;
        core.successes = 0;
        core.next_attempt_at = Some(Instant::now() + self.settings.timeout);
        warn!(
            breaker = %self.label,
            timeout = ?self.settings.timeout,
            "circuit opened"
        );
    }

    /// Current state as last transitioned. The open-to-half-open flip happens
    /// on the next admitted call, not on the clock alone.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let core = self.lock();
        let retry_in = match core.state {
            CircuitState::Open => core
                .next_attempt_at
                .map(|next| next.saturating_duration_since(Instant::now())),
            _ => None,
        };
        BreakerSnapshot {
            state: core.state,
            consecutive_failures: core.failures,
            consecutive_successes: core.successes,
            retry_in,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    async fn fail(breaker: &CircuitBreaker, invoked: &AtomicUsize) -> Result<(), ExecuteError<Boom>> {
        breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Err::<(), Boom>(Boom)
            })
            .await
            .map(|_| ())
    }

    async fn succeed(
        breaker: &CircuitBreaker,
        invoked: &AtomicUsize,
    ) -> Result<(), ExecuteError<Boom>> {
        breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Boom>(())
            })
            .await
    }

    #[tokio::test]
    async fn test_starts_closed_and_passes_calls() {
        let breaker = CircuitBreaker::new("test", BreakerSettings::default());
        let invoked = AtomicUsize::new(0);
        assert!(succeed(&breaker, &invoked).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_short_circuits() {
        let settings = BreakerSettings::new(3, Duration::from_secs(60));
        let breaker = CircuitBreaker::new("test", settings);
        let invoked = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(fail(&breaker, &invoked).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(invoked.load(Ordering::SeqCst), 3);

        // Short-circuited: the operation must not run.
        let err = fail(&breaker, &invoked).await.unwrap_err();
        assert!(err.is_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_admitted_after_timeout() {
        let settings = BreakerSettings::new(2, Duration::from_secs(30));
        let breaker = CircuitBreaker::new("test", settings);
        let invoked = AtomicUsize::new(0);

        fail(&breaker, &invoked).await.unwrap_err();
        fail(&breaker, &invoked).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(fail(&breaker, &invoked).await.unwrap_err().is_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        // Probe runs; its failure reopens the circuit.
        let err = fail(&breaker, &invoked).await.unwrap_err();
        assert!(!err.is_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_successes_close_circuit() {
        let settings = BreakerSettings::new(2, Duration::from_secs(10));
        let breaker = CircuitBreaker::new("test", settings);
        let invoked = AtomicUsize::new(0);

        fail(&breaker, &invoked).await.unwrap_err();
        fail(&breaker, &invoked).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(11)).await;

        succeed(&breaker, &invoked).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker, &invoked).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_deadline() {
        let settings = BreakerSettings::new(1, Duration::from_secs(10));
        let breaker = CircuitBreaker::new("test", settings);
        let invoked = AtomicUsize::new(0);

        fail(&breaker, &invoked).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&breaker, &invoked).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Reopened with a new deadline: still blocked shortly after.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(fail(&breaker, &invoked).await.unwrap_err().is_open());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let settings = BreakerSettings::new(3, Duration::from_secs(60));
        let breaker = CircuitBreaker::new("test", settings);
        let invoked = AtomicUsize::new(0);

        fail(&breaker, &invoked).await.unwrap_err();
        fail(&breaker, &invoked).await.unwrap_err();
        succeed(&breaker, &invoked).await.unwrap();
        fail(&breaker, &invoked).await.unwrap_err();
        fail(&breaker, &invoked).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker, &invoked).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_snapshot_reports_counters() {
        let settings = BreakerSettings::new(3, Duration::from_secs(60));
        let breaker = CircuitBreaker::new("test", settings);
        let invoked = AtomicUsize::new(0);

        fail(&breaker, &invoked).await.unwrap_err();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 1);
        assert!(snapshot.retry_in.is_none());

        fail(&breaker, &invoked).await.unwrap_err();
        fail(&breaker, &invoked).await.unwrap_err();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert!(snapshot.retry_in.is_some());
    }
}
