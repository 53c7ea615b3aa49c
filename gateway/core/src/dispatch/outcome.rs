//! Request Outcomes
//!
//! What the producer gets back from `submit`: a [`Verdict`] or a terminal
//! [`DispatchFailure`] carrying the last backend error kind and the attempt
//! count.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendErrorKind, BackendResponse};
use crate::request::RequestId;

/// Where a verdict came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// A backend call made for this request
    Backend,
    /// A cached response to similar content
    Cache,
    /// The response of an identical request that was in flight
    Coalesced,
}

/// Successful result
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Verdict {
    /// Request identifier
    pub request_id: RequestId,
    /// Backend output, unparsed
    pub response: BackendResponse,
    /// Origin of the response
    pub source: VerdictSource,
    /// Backend that answered; `None` for cache hits
    pub backend: Option<String>,
    /// Backend calls made for this request
    pub attempts: u32,
    /// Time from submission to result
    pub latency_ms: u64,
    /// Spend committed for this request
    pub cost_usd: f64,
    /// Similarity of the cached entry, for cache hits
    pub similarity: Option<f32>,
}

/// Terminal failure category
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Deadline passed before a result
    DeadlineExceeded,
    /// No backend can ever take the request
    NoBackendAvailable,
    /// Every allowed attempt failed with a retryable error
    RetriesExhausted,
    /// A non-retryable backend error
    Fatal,
    /// Inbound queue at capacity
    QueueFull,
    /// Dispatcher is shutting down
    ShuttingDown,
}

impl FailureKind {
    /// Stable lowercase label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NoBackendAvailable => "no_backend_available",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Fatal => "fatal",
            Self::QueueFull => "queue_full",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// Whether this failure can end in a dead-letter entry
    ///
    /// `NoBackendAvailable` is only dead-lettered after a backend was tried.
    #[must_use]
    pub fn is_dead_lettered(self) -> bool {
        matches!(
            self,
            Self::NoBackendAvailable | Self::RetriesExhausted | Self::Fatal
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure returned to the producer
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[error("request {request_id} failed ({kind}) after {attempts} attempt(s): {message}")]
pub struct DispatchFailure {
    /// Request identifier
    pub request_id: RequestId,
    /// Failure category
    pub kind: FailureKind,
    /// Kind of the last backend error, if a backend was called
    pub last_error: Option<BackendErrorKind>,
    /// Backend calls made
    pub attempts: u32,
    /// Human-readable detail
    pub message: String,
}

impl DispatchFailure {
    pub(crate) fn new(
        request_id: RequestId,
        kind: FailureKind,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            kind,
            last_error: None,
            attempts,
            message: message.into(),
        }
    }

    pub(crate) fn with_last_error(mut self, kind: Option<BackendErrorKind>) -> Self {
        self.last_error = kind;
        self
    }
}
