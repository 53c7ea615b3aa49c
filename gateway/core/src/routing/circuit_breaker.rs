//! Per-Backend Circuit Breaker
//!
//! ```text
//! +--------+  failure_threshold  +------+    reset_timeout    +-----------+
//! | Closed | ------------------> | Open | ------------------> | Half-Open |
//! +--------+     failures        +------+                     +-----------+
//!     ^                             ^        any failure            |
//!     |                             +-------------------------------+
//!     |                   success_threshold successes               |
//!     +-------------------------------------------------------------+
//! ```
//!
//! - **Closed**: calls allowed; a success resets the failure counter
//! - **Open**: calls rejected without touching the backend
//! - **Half-Open**: at most `half_open_max_calls` trial calls in flight
//!
//! # Thread Safety
//!
//! The whole [`CircuitState`] sits behind one `parking_lot::Mutex` per
//! backend, so every transition is a single serialized mutation. Transitions
//! are published on a broadcast channel with `send`, which never waits for
//! subscribers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::clock::{elapsed_between, Clock};

/// Capacity of the transition broadcast channel
const TRANSITION_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// State
// ============================================================================

/// Breaker status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Normal operation
    #[default]
    Closed,
    /// Tripped; rejecting calls
    Open,
    /// Probing recovery with trial calls
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Full breaker state of one backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CircuitState {
    /// Current status
    pub status: CircuitStatus,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// Successful trials since entering half-open
    pub successes_in_half_open: u32,
}

/// Published on every status change
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitTransition {
    /// Backend name
    pub backend: String,
    /// Previous status
    pub from: CircuitStatus,
    /// New status
    pub to: CircuitStatus,
    /// When it happened
    pub at: DateTime<Utc>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Circuit breaker thresholds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before trials are allowed
    pub reset_timeout: Duration,
    /// Half-open successes that close the circuit
    pub success_threshold: u32,
    /// Concurrent trial calls allowed while half-open
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 3,
            half_open_max_calls: 3,
        }
    }
}

impl BreakerConfig {
    /// Set the failure threshold
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the reset timeout
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the success threshold
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the half-open trial limit
    #[must_use]
    pub fn with_half_open_max_calls(mut self, max: u32) -> Self {
        self.half_open_max_calls = max;
        self
    }
}

// ============================================================================
// Admission
// ============================================================================

/// Why the breaker refused a call
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BreakerRejection {
    /// Circuit is open
    #[error("circuit open for {backend} (retry in {retry_after:?})")]
    Open {
        /// Backend name
        backend: String,
        /// Time until trials are allowed
        retry_after: Duration,
    },

    /// Half-open trial slots are all taken
    #[error("circuit half-open for {backend}, trial slots busy")]
    TrialsBusy {
        /// Backend name
        backend: String,
    },
}

/// How a call was let through; hand it back when recording the outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Admitted while closed
    Normal,
    /// Admitted as a half-open trial
    Trial,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[derive(Debug, Default)]
struct Inner {
    state: CircuitState,
    trials_in_flight: u32,
}

/// Failure-driven gate in front of one backend
pub struct CircuitBreaker {
    backend: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    transitions: broadcast::Sender<CircuitTransition>,
}

impl CircuitBreaker {
    /// Create a closed breaker with its own transition channel
    pub fn new(backend: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self::with_channel(backend, config, clock, transitions)
    }

    /// Create a closed breaker publishing on a shared channel
    pub fn with_channel(
        backend: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
        transitions: broadcast::Sender<CircuitTransition>,
    ) -> Self {
        Self {
            backend: backend.into(),
            config,
            clock,
            inner: Mutex::new(Inner::default()),
            transitions,
        }
    }

    /// Backend name
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.transitions.subscribe()
    }

    /// Ask to make one call
    ///
    /// Moves OPEN to HALF_OPEN once `reset_timeout` has elapsed. A successful
    /// return must be followed by exactly one of [`Self::record_success`],
    /// [`Self::record_failure`] or [`Self::cancel`].
    pub fn try_acquire(&self) -> Result<Admission, BreakerRejection> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if inner.state.status == CircuitStatus::Open {
            let opened_at = inner.state.opened_at.unwrap_or(now);
            let open_for = elapsed_between(opened_at, now);
            if open_for < self.config.reset_timeout {
                return Err(BreakerRejection::Open {
                    backend: self.backend.clone(),
                    retry_after: self.config.reset_timeout - open_for,
                });
            }
            inner.state.successes_in_half_open = 0;
            inner.trials_in_flight = 0;
            self.transition(&mut inner, CircuitStatus::HalfOpen, now);
        }

        match inner.state.status {
            CircuitStatus::Closed => Ok(Admission::Normal),
            CircuitStatus::HalfOpen if inner.trials_in_flight < self.config.half_open_max_calls => {
                inner.trials_in_flight += 1;
                Ok(Admission::Trial)
            }
            _ => Err(BreakerRejection::TrialsBusy {
                backend: self.backend.clone(),
            }),
        }
    }

    /// Give back an admission whose call never produced an outcome
    pub fn cancel(&self, admission: Admission) {
        if admission == Admission::Trial {
            let mut inner = self.inner.lock();
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }

    /// Record a successful call
    pub fn record_success(&self, admission: Admission) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if admission == Admission::Trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }

        match inner.state.status {
            CircuitStatus::Closed => inner.state.consecutive_failures = 0,
            CircuitStatus::HalfOpen => {
                inner.state.successes_in_half_open += 1;
                if inner.state.successes_in_half_open >= self.config.success_threshold {
                    inner.state.consecutive_failures = 0;
                    inner.state.successes_in_half_open = 0;
                    inner.state.opened_at = None;
                    inner.trials_in_flight = 0;
                    self.transition(&mut inner, CircuitStatus::Closed, now);
                }
            }
            // late result from a call admitted before the circuit opened
            CircuitStatus::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, admission: Admission) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if admission == Admission::Trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
        inner.state.consecutive_failures = inner.state.consecutive_failures.saturating_add(1);

        match inner.state.status {
            CircuitStatus::Closed => {
                if inner.state.consecutive_failures >= self.config.failure_threshold {
                    inner.state.opened_at = Some(now);
                    self.transition(&mut inner, CircuitStatus::Open, now);
                }
            }
            CircuitStatus::HalfOpen => {
                inner.state.opened_at = Some(now);
                inner.state.successes_in_half_open = 0;
                self.transition(&mut inner, CircuitStatus::Open, now);
            }
            CircuitStatus::Open => {}
        }
    }

    /// Current status without side effects
    #[must_use]
    pub fn status(&self) -> CircuitStatus {
        self.inner.lock().state.status
    }

    /// Copy of the full state
    #[must_use]
    pub fn snapshot(&self) -> CircuitState {
        self.inner.lock().state.clone()
    }

    /// Force the breaker into a status (for testing/admin)
    pub fn force_state(&self, status: CircuitStatus) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.trials_in_flight = 0;
        inner.state.successes_in_half_open = 0;
        match status {
            CircuitStatus::Closed => {
                inner.state.consecutive_failures = 0;
                inner.state.opened_at = None;
            }
            CircuitStatus::Open => inner.state.opened_at = Some(now),
            CircuitStatus::HalfOpen => {}
        }
        self.transition(&mut inner, status, now);
    }

    fn transition(&self, inner: &mut Inner, to: CircuitStatus, at: DateTime<Utc>) {
        let from = inner.state.status;
        if from == to {
            return;
        }
        inner.state.status = to;

        match to {
            CircuitStatus::Open => tracing::warn!(
                backend = %self.backend,
                %from,
                consecutive_failures = inner.state.consecutive_failures,
                "Circuit breaker opened"
            ),
            CircuitStatus::HalfOpen => tracing::info!(
                backend = %self.backend,
                "Circuit breaker half-open, allowing trial calls"
            ),
            CircuitStatus::Closed => tracing::info!(
                backend = %self.backend,
                %from,
                "Circuit breaker closed, backend recovered"
            ),
        }

        // no subscribers is fine
        let _ = self.transitions.send(CircuitTransition {
            backend: self.backend.clone(),
            from,
            to,
            at,
        });
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("backend", &self.backend)
            .field("state", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(config: BreakerConfig) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::default();
        let breaker = CircuitBreaker::new("cloud", config, Arc::new(clock.clone()));
        (breaker, clock)
    }

    fn fail(breaker: &CircuitBreaker, times: u32) {
        for _ in 0..times {
            let admission = breaker.try_acquire().unwrap();
            breaker.record_failure(admission);
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let (breaker, _) = breaker(BreakerConfig::default());

        fail(&breaker, 4);
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        fail(&breaker, 1);
        assert_eq!(breaker.status(), CircuitStatus::Open);
        assert!(breaker.snapshot().opened_at.is_some());
        assert!(matches!(breaker.try_acquire(), Err(BreakerRejection::Open { .. })));
    }

    #[test]
    fn test_success_resets_failures_when_closed() {
        let (breaker, _) = breaker(BreakerConfig::default());

        fail(&breaker, 4);
        breaker.record_success(breaker.try_acquire().unwrap());
        fail(&breaker, 4);

        assert_eq!(breaker.status(), CircuitStatus::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 4);
    }

    #[test]
    fn test_stays_open_for_reset_timeout() {
        let (breaker, clock) = breaker(BreakerConfig::default());
        fail(&breaker, 5);

        clock.advance(Duration::from_secs(59));
        match breaker.try_acquire() {
            Err(BreakerRejection::Open { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(1));
            }
            other => panic!("expected open rejection, got {other:?}"),
        }

        clock.advance(Duration::from_secs(1));
        assert_eq!(breaker.try_acquire().unwrap(), Admission::Trial);
        assert_eq!(breaker.status(), CircuitStatus::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let (breaker, clock) = breaker(BreakerConfig::default());
        fail(&breaker, 5);
        clock.advance(Duration::from_secs(60));

        for _ in 0..3 {
            let admission = breaker.try_acquire().unwrap();
            assert_eq!(admission, Admission::Trial);
            breaker.record_success(admission);
        }

        let state = breaker.snapshot();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(breaker.try_acquire().unwrap(), Admission::Normal);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (breaker, clock) = breaker(BreakerConfig::default());
        fail(&breaker, 5);
        let first_open = breaker.snapshot().opened_at;
        clock.advance(Duration::from_secs(60));

        let admission = breaker.try_acquire().unwrap();
        breaker.record_success(admission);
        let admission = breaker.try_acquire().unwrap();
        breaker.record_failure(admission);

        let state = breaker.snapshot();
        assert_eq!(state.status, CircuitStatus::Open);
        assert!(state.opened_at > first_open);
        assert_eq!(state.successes_in_half_open, 0);
    }

    #[test]
    fn test_half_open_limits_trials() {
        let (breaker, clock) =
            breaker(BreakerConfig::default().with_half_open_max_calls(1));
        fail(&breaker, 5);
        clock.advance(Duration::from_secs(60));

        let trial = breaker.try_acquire().unwrap();
        assert!(matches!(
            breaker.try_acquire(),
            Err(BreakerRejection::TrialsBusy { .. })
        ));

        breaker.cancel(trial);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let (breaker, clock) = breaker(BreakerConfig::default().with_failure_threshold(1));
        let mut rx = breaker.subscribe();

        fail(&breaker, 1);
        clock.advance(Duration::from_secs(60));
        let _ = breaker.try_acquire().unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!((first.from, first.to), (CircuitStatus::Closed, CircuitStatus::Open));
        let second = rx.recv().await.unwrap();
        assert_eq!((second.from, second.to), (CircuitStatus::Open, CircuitStatus::HalfOpen));
        assert_eq!(second.backend, "cloud");
    }

    #[test]
    fn test_force_state() {
        let (breaker, _) = breaker(BreakerConfig::default());
        breaker.force_state(CircuitStatus::Open);
        assert!(breaker.try_acquire().is_err());
        breaker.force_state(CircuitStatus::Closed);
        assert_eq!(breaker.try_acquire().unwrap(), Admission::Normal);
    }
}
