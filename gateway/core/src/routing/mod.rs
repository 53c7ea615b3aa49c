#![allow(missing_docs)]
//! Backend Routing and Resilience
//!
//! Admission, health and spend controls consulted before every backend call.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |      Router      |  <-- select_backend(request)
//! +--------+---------+
//!          |  for each candidate, in tier order
//!          v
//! +------------------+   +------------------+   +------------------+
//! |  CircuitBreaker  |-->|   BudgetLedger   |-->|   RateLimiter    |
//! |  (per backend)   |   | (metered, daily) |   |  (per backend)   |
//! +------------------+   +------------------+   +------------------+
//!          |
//!          v
//!     Selection { descriptor, admission, permit, reservation }
//! ```
//!
//! # Design Principles
//!
//! 1. **No global lock**: every backend has its own breaker and rate window,
//!    every day its own ledger row
//! 2. **Non-blocking admission**: every check fails fast; waiting is the
//!    dispatcher's business
//! 3. **All or nothing**: a refused candidate never keeps a trial slot,
//!    reservation or permit

pub mod budget;
pub mod circuit_breaker;
pub mod descriptor;
pub mod metrics;
pub mod rate_limit;
pub mod retry;
pub mod router;

#[cfg(test)]
pub mod test_utils;

pub use budget::{BudgetConfig, BudgetDenied, BudgetLedger, BudgetStatus, DaySpend, Reservation};
pub use circuit_breaker::{
    Admission, BreakerConfig, BreakerRejection, CircuitBreaker, CircuitState, CircuitStatus,
    CircuitTransition,
};
pub use descriptor::{BackendDescriptor, BackendTier};
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use rate_limit::{Permit, RateLimitRejection, RateLimiter, RateSnapshot};
pub use retry::{RetryDecision, RetryPolicy};
pub use router::{NoBackendAvailable, Router, Selection, SkipReason};
