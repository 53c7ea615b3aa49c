//! Backend Router
//!
//! Picks the first eligible backend in tier order (local, cloud primary,
//! cloud fallback; configuration order within a tier). For each candidate:
//!
//! 1. content must fit `max_content_size`
//! 2. the backend must not be marked budget-exhausted for today
//! 3. the circuit breaker must admit the call
//! 4. metered backends must get a budget reservation
//! 5. the rate limiter must hand out a permit
//!
//! A later refusal rolls back the earlier grants (breaker trial, budget
//! reservation), so a [`Selection`] is either fully admitted or nothing is
//! held. The selection owns the permit and reservation it was granted.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;

use super::budget::{BudgetLedger, Reservation};
use super::circuit_breaker::{
    Admission, BreakerConfig, BreakerRejection, CircuitBreaker, CircuitTransition,
};
use super::descriptor::{routing_order, BackendDescriptor};
use super::rate_limit::{Permit, RateLimitRejection, RateLimiter};
use crate::clock::Clock;
use crate::request::Request;

// ============================================================================
// Outcomes
// ============================================================================

/// Why a candidate was passed over
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SkipReason {
    /// Content larger than the backend accepts
    #[error("content too large ({size} > {max} bytes)")]
    ContentTooLarge {
        /// Content size
        size: usize,
        /// Backend limit
        max: usize,
    },

    /// Budget was denied earlier today
    #[error("daily budget exhausted")]
    BudgetExhausted,

    /// Breaker refused
    #[error(transparent)]
    Breaker(#[from] BreakerRejection),

    /// Rate limiter refused
    #[error(transparent)]
    RateLimited(#[from] RateLimitRejection),
}

impl SkipReason {
    /// Whether waiting could make this backend eligible
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::ContentTooLarge { .. })
    }
}

/// No candidate could take the request
#[derive(Clone, Debug, Error, PartialEq)]
#[error("no backend available: {}", summarize(.reasons))]
pub struct NoBackendAvailable {
    /// Skip reason per backend, in routing order
    pub reasons: Vec<(String, SkipReason)>,
}

fn summarize(reasons: &[(String, SkipReason)]) -> String {
    if reasons.is_empty() {
        return "no backends configured".to_string();
    }
    reasons
        .iter()
        .map(|(name, reason)| format!("{name} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl NoBackendAvailable {
    /// True when no amount of waiting can help
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.reasons.iter().all(|(_, reason)| !reason.is_transient())
    }
}

/// A fully admitted backend choice
pub struct Selection {
    /// Chosen backend
    pub descriptor: BackendDescriptor,
    /// Breaker admission to hand back with the outcome
    pub admission: Admission,
    /// Concurrency slot, released on drop
    pub permit: Permit,
    /// Budget hold for metered backends
    pub reservation: Option<Reservation>,
}

impl Selection {
    /// Name of the chosen backend
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.descriptor.name
    }
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("backend", &self.descriptor.name)
            .field("admission", &self.admission)
            .field("reservation", &self.reservation)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Chooses a backend for each request
pub struct Router {
    candidates: Vec<BackendDescriptor>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    limiter: Arc<RateLimiter>,
    ledger: Arc<BudgetLedger>,
    /// Backends denied budget, keyed to the day of denial
    exhausted: DashMap<String, NaiveDate>,
    transitions: broadcast::Sender<CircuitTransition>,
    clock: Arc<dyn Clock>,
}

impl Router {
    /// Build a router with one breaker per backend
    pub fn new(
        descriptors: Vec<BackendDescriptor>,
        breaker_config: &BreakerConfig,
        ledger: Arc<BudgetLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut candidates = descriptors;
        routing_order(&mut candidates);

        let limiter = Arc::new(RateLimiter::new(&candidates, Arc::clone(&clock)));
        let (transitions, _) = broadcast::channel(256);
        let breakers = candidates
            .iter()
            .map(|d| {
                let breaker = CircuitBreaker::with_channel(
                    d.name.clone(),
                    breaker_config.clone(),
                    Arc::clone(&clock),
                    transitions.clone(),
                );
                (d.name.clone(), Arc::new(breaker))
            })
            .collect();

        Self {
            candidates,
            breakers,
            limiter,
            ledger,
            exhausted: DashMap::new(),
            transitions,
            clock,
        }
    }

    /// Candidates in routing order
    #[must_use]
    pub fn candidates(&self) -> &[BackendDescriptor] {
        &self.candidates
    }

    /// Breaker of one backend
    #[must_use]
    pub fn breaker(&self, backend: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(backend)
    }

    /// Shared rate limiter
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Shared budget ledger
    #[must_use]
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// Subscribe to breaker transitions of every backend
    #[must_use]
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<CircuitTransition> {
        self.transitions.subscribe()
    }

    /// Whether the backend was denied budget today
    #[must_use]
    pub fn is_budget_exhausted(&self, backend: &str) -> bool {
        let today = self.clock.today();
        self.exhausted.get(backend).is_some_and(|day| *day == today)
    }

    /// Choose a backend for `request`
    pub fn select_backend(&self, request: &Request) -> Result<Selection, NoBackendAvailable> {
        let size = request.content_size();
        let mut reasons = Vec::new();

        for descriptor in &self.candidates {
            match self.try_candidate(descriptor, size) {
                Ok(selection) => {
                    tracing::debug!(
                        request_id = %request.id,
                        backend = %descriptor.name,
                        skipped = reasons.len(),
                        "Backend selected"
                    );
                    return Ok(selection);
                }
                Err(reason) => {
                    tracing::debug!(
                        request_id = %request.id,
                        backend = %descriptor.name,
                        %reason,
                        "Skipping backend"
                    );
                    reasons.push((descriptor.name.clone(), reason));
                }
            }
        }

        Err(NoBackendAvailable { reasons })
    }

    fn try_candidate(
        &self,
        descriptor: &BackendDescriptor,
        size: usize,
    ) -> Result<Selection, SkipReason> {
        if !descriptor.accepts(size) {
            return Err(SkipReason::ContentTooLarge {
                size,
                max: descriptor.max_content_size,
            });
        }
        if descriptor.is_metered() && self.is_budget_exhausted(&descriptor.name) {
            return Err(SkipReason::BudgetExhausted);
        }

        let breaker = self
            .breakers
            .get(&descriptor.name)
            .ok_or_else(|| RateLimitRejection::UnknownBackend(descriptor.name.clone()))?;
        let admission = breaker.try_acquire()?;

        let reservation = if descriptor.is_metered() {
            match self.ledger.check_and_reserve(descriptor.cost_per_request_usd) {
                Ok(reservation) => Some(reservation),
                Err(denied) => {
                    breaker.cancel(admission);
                    self.exhausted
                        .insert(descriptor.name.clone(), denied.day);
                    tracing::warn!(
                        backend = %descriptor.name,
                        %denied,
                        "Budget denied, backend unavailable for the rest of the day"
                    );
                    return Err(SkipReason::BudgetExhausted);
                }
            }
        } else {
            None
        };

        let permit = match self.limiter.try_admit(&descriptor.name) {
            Ok(permit) => permit,
            Err(rejection) => {
                breaker.cancel(admission);
                if let Some(reservation) = reservation {
                    self.ledger.release(reservation);
                }
                return Err(rejection.into());
            }
        };

        Ok(Selection {
            descriptor: descriptor.clone(),
            admission,
            permit,
            reservation,
        })
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field(
                "candidates",
                &self.candidates.iter().map(|d| &d.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::routing::budget::BudgetConfig;
    use crate::routing::circuit_breaker::CircuitStatus;
    use crate::routing::descriptor::BackendTier;
    use crate::request::Submission;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    struct Fixture {
        router: Router,
        clock: ManualClock,
    }

    fn fixture(descriptors: Vec<BackendDescriptor>, budget: f64) -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 9, 2, 14, 0, 0).unwrap());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let ledger = Arc::new(BudgetLedger::new(
            BudgetConfig {
                daily_budget_usd: budget,
                ..BudgetConfig::default()
            },
            Arc::clone(&shared),
        ));
        let router = Router::new(descriptors, &BreakerConfig::default(), ledger, shared);
        Fixture { router, clock }
    }

    fn standard() -> Vec<BackendDescriptor> {
        vec![
            BackendDescriptor::new("fallback", BackendTier::CloudFallback, 2, 8000).with_cost(0.01),
            BackendDescriptor::new("primary", BackendTier::CloudPrimary, 2, 8000).with_cost(0.01),
            BackendDescriptor::new("local", BackendTier::Local, 1, 100),
        ]
    }

    fn request(fixture: &Fixture, content: &str) -> Request {
        let now = fixture.clock.now();
        Request::new(
            Submission::new(content, "AAPL", now + chrono::Duration::seconds(30)),
            now,
        )
    }

    #[test]
    fn test_prefers_local_tier() {
        let fx = fixture(standard(), 1.0);
        let selection = fx.router.select_backend(&request(&fx, "short")).unwrap();
        assert_eq!(selection.backend(), "local");
        assert!(selection.reservation.is_none());
    }

    #[test]
    fn test_saturated_local_falls_through_to_primary() {
        let fx = fixture(standard(), 1.0);
        let _held = fx.router.select_backend(&request(&fx, "a")).unwrap();

        let selection = fx.router.select_backend(&request(&fx, "b")).unwrap();
        assert_eq!(selection.backend(), "primary");
        assert!(selection.reservation.is_some());
    }

    #[test]
    fn test_large_content_skips_small_backend() {
        let fx = fixture(standard(), 1.0);
        let big = "x".repeat(500);
        let selection = fx.router.select_backend(&request(&fx, &big)).unwrap();
        assert_eq!(selection.backend(), "primary");
    }

    #[test]
    fn test_too_large_everywhere_is_terminal() {
        let fx = fixture(standard(), 1.0);
        let huge = "x".repeat(10_000);
        let err = fx.router.select_backend(&request(&fx, &huge)).unwrap_err();

        assert_eq!(err.reasons.len(), 3);
        assert!(err.is_terminal());
    }

    #[test]
    fn test_open_breaker_is_skipped() {
        let fx = fixture(standard(), 1.0);
        fx.router
            .breaker("local")
            .unwrap()
            .force_state(CircuitStatus::Open);

        let selection = fx.router.select_backend(&request(&fx, "a")).unwrap();
        assert_eq!(selection.backend(), "primary");
    }

    #[test]
    fn test_budget_denial_marks_backend_for_the_day() {
        let fx = fixture(standard(), 0.01);
        fx.router
            .breaker("local")
            .unwrap()
            .force_state(CircuitStatus::Open);

        let first = fx.router.select_backend(&request(&fx, "a")).unwrap();
        assert_eq!(first.backend(), "primary");

        let err = fx.router.select_backend(&request(&fx, "b")).unwrap_err();
        assert!(!err.is_terminal());
        assert!(fx.router.is_budget_exhausted("primary"));
        assert!(fx.router.is_budget_exhausted("fallback"));

        // releasing headroom does not revive the backend today
        drop(first);
        assert!(fx.router.select_backend(&request(&fx, "c")).is_err());

        fx.clock.advance(Duration::from_secs(12 * 3600));
        assert!(!fx.router.is_budget_exhausted("primary"));
    }

    #[test]
    fn test_rate_rejection_rolls_back_reservation_and_trial() {
        let fx = fixture(
            vec![BackendDescriptor::new("primary", BackendTier::CloudPrimary, 1, 8000).with_cost(0.5)],
            1.0,
        );
        let breaker = Arc::clone(fx.router.breaker("primary").unwrap());
        breaker.force_state(CircuitStatus::HalfOpen);

        let held = fx.router.select_backend(&request(&fx, "a")).unwrap();
        assert_eq!(held.admission, Admission::Trial);

        let err = fx.router.select_backend(&request(&fx, "b")).unwrap_err();
        assert!(matches!(
            err.reasons[0].1,
            SkipReason::RateLimited(RateLimitRejection::Saturated { .. })
        ));
        assert!((fx.router.ledger().reserved_today() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_error_message_lists_backends() {
        let fx = fixture(
            vec![BackendDescriptor::new("local", BackendTier::Local, 1, 4)],
            1.0,
        );
        let err = fx.router.select_backend(&request(&fx, "too long")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "no backend available: local (content too large (8 > 4 bytes))"
        );
    }
}
