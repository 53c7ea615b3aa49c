//! Dispatch Events
//!
//! Every state change of every request is published as a [`DispatchEvent`]
//! and written to the `gateway::audit` tracing target. Subscribers that lag
//! behind lose events; the audit log does not.
//!
//! ```text
//! QUEUED -> CACHE_CHECK -+-> CACHE_HIT -> DONE
//!                        |
//!                        +-> ROUTING -> ADMITTED -> IN_FLIGHT -+-> SUCCESS -> CACHE_STORE -> DONE
//!                              ^                               |
//!                              |                               +-> FAILURE -+-> RETRY_WAIT
//!                              +-------------------------------------------+    |
//!                                                                          +-> RETRIES_EXHAUSTED -> DEAD_LETTERED
//! ```
//!
//! `CANCELLED` (deadline) and `FAILED` (no usable backend) are terminal as
//! well.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::{elapsed_between, Clock};
use crate::request::{Request, RequestId};

/// Lifecycle state of one request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    /// Waiting for a worker
    Queued,
    /// Looking for a cached or in-flight answer
    CacheCheck,
    /// Served from the cache
    CacheHit,
    /// Looking for an eligible backend
    Routing,
    /// Backend chosen, permit held
    Admitted,
    /// Backend call running
    InFlight,
    /// Backend answered
    Success,
    /// Storing the answer
    CacheStore,
    /// Backend call failed
    Failure,
    /// Backing off before routing again
    RetryWait,
    /// No attempts left
    RetriesExhausted,
    /// Recorded for manual review
    DeadLettered,
    /// Result delivered
    Done,
    /// Deadline reached
    Cancelled,
    /// No backend can take the request
    Failed,
}

impl RequestState {
    /// Stable uppercase label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::CacheCheck => "CACHE_CHECK",
            Self::CacheHit => "CACHE_HIT",
            Self::Routing => "ROUTING",
            Self::Admitted => "ADMITTED",
            Self::InFlight => "IN_FLIGHT",
            Self::Success => "SUCCESS",
            Self::CacheStore => "CACHE_STORE",
            Self::Failure => "FAILURE",
            Self::RetryWait => "RETRY_WAIT",
            Self::RetriesExhausted => "RETRIES_EXHAUSTED",
            Self::DeadLettered => "DEAD_LETTERED",
            Self::Done => "DONE",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }

    /// No further transitions
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::DeadLettered | Self::Cancelled | Self::Failed
        )
    }

    /// Whether `next` may follow `self`
    #[must_use]
    pub fn allows(self, next: Self) -> bool {
        use RequestState::{
            Admitted, CacheCheck, CacheHit, CacheStore, Cancelled, DeadLettered, Done, Failed,
            Failure, InFlight, Queued, RetriesExhausted, RetryWait, Routing, Success,
        };
        matches!(
            (self, next),
            (Queued, CacheCheck | Cancelled | Failed)
                | (CacheCheck, CacheHit | Routing | Cancelled)
                | (CacheHit, Done)
                | (Routing, Admitted | Cancelled | Failed)
                | (Admitted, InFlight)
                | (InFlight, Success | Failure | Cancelled)
                | (Success, CacheStore)
                | (CacheStore, Done)
                | (Failure, RetryWait | RetriesExhausted | DeadLettered)
                | (RetryWait, Routing | Cancelled)
                | (RetriesExhausted, DeadLettered)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state transition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// Request that moved
    pub request_id: RequestId,
    /// Backend involved, once one was chosen
    pub backend: Option<String>,
    /// Previous state; `None` for the initial `QUEUED`
    pub from: Option<RequestState>,
    /// New state
    pub to: RequestState,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Time since submission
    pub latency_ms: u64,
    /// Spend attributed to this transition
    pub cost_usd: Option<f64>,
    /// Backend attempts so far
    pub attempt: u32,
}

/// Fan-out of dispatch events
#[derive(Debug)]
pub struct EventLog {
    sender: broadcast::Sender<DispatchEvent>,
}

impl EventLog {
    /// Create a log buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    /// Publish an event
    pub fn emit(&self, event: DispatchEvent) {
        tracing::info!(
            target: "gateway::audit",
            request_id = %event.request_id,
            backend = event.backend.as_deref().unwrap_or("-"),
            from = event.from.map_or("-", RequestState::as_str),
            to = %event.to,
            latency_ms = event.latency_ms,
            cost_usd = event.cost_usd,
            attempt = event.attempt,
            "Request transition"
        );
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

/// Per-request state tracker
///
/// Owned by whichever task currently drives the request, so transitions of
/// one request are totally ordered.
pub(crate) struct RequestTrace {
    log: Arc<EventLog>,
    clock: Arc<dyn Clock>,
    request_id: RequestId,
    submitted_at: DateTime<Utc>,
    state: Option<RequestState>,
    backend: Option<String>,
    attempt: u32,
}

impl RequestTrace {
    pub(crate) fn new(log: Arc<EventLog>, clock: Arc<dyn Clock>, request: &Request) -> Self {
        Self {
            log,
            clock,
            request_id: request.id,
            submitted_at: request.submitted_at,
            state: None,
            backend: None,
            attempt: 0,
        }
    }

    pub(crate) fn state(&self) -> Option<RequestState> {
        self.state
    }

    pub(crate) fn set_backend(&mut self, backend: &str) {
        self.backend = Some(backend.to_string());
    }

    pub(crate) fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    pub(crate) fn advance(&mut self, to: RequestState) {
        self.advance_with_cost(to, None);
    }

    pub(crate) fn advance_with_cost(&mut self, to: RequestState, cost_usd: Option<f64>) {
        let legal = match self.state {
            None => to == RequestState::Queued,
            Some(from) => from.allows(to),
        };
        if !legal {
            tracing::error!(
                request_id = %self.request_id,
                from = ?self.state,
                to = %to,
                "Illegal request transition ignored"
            );
            return;
        }

        let now = self.clock.now();
        let latency = elapsed_between(self.submitted_at, now);
        self.log.emit(DispatchEvent {
            request_id: self.request_id,
            backend: self.backend.clone(),
            from: self.state,
            to,
            timestamp: now,
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            cost_usd,
            attempt: self.attempt,
        });
        self.state = Some(to);
    }
}
