//! Inference Backend Traits
//!
//! Every provider (local model server, metered cloud API) implements
//! [`InferenceBackend`]. The gateway only ever sees opaque response text and a
//! machine-readable [`BackendErrorKind`]; prompt construction and response
//! parsing live with the caller.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Machine-readable failure category reported by a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// No (first) response within the allotted time
    Timeout,
    /// Provider signalled a quota or rate limit
    RateLimited,
    /// Credentials rejected
    AuthFailed,
    /// Provider rejected the request itself
    Malformed,
    /// Connection refused/reset or server-side failure
    Unavailable,
}

impl BackendErrorKind {
    /// Stable lowercase label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::AuthFailed => "auth_failed",
            Self::Malformed => "malformed",
            Self::Unavailable => "unavailable",
        }
    }

    /// Whether the failure says something about the backend's health
    ///
    /// Malformed requests are the caller's fault and do not count against the
    /// backend's circuit breaker.
    #[must_use]
    pub fn reflects_backend_health(self) -> bool {
        !matches!(self, Self::Malformed)
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed backend call
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct BackendError {
    /// Failure category
    pub kind: BackendErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl BackendError {
    /// Create an error of the given kind
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Timeout, message)
    }

    /// Shorthand for an unavailable backend
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unavailable, message)
    }

    /// Map an HTTP status code to an error kind
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            429 => BackendErrorKind::RateLimited,
            401 | 403 => BackendErrorKind::AuthFailed,
            400 | 404 | 413 | 422 => BackendErrorKind::Malformed,
            408 | 504 => BackendErrorKind::Timeout,
            _ => BackendErrorKind::Unavailable,
        };
        Self::new(kind, format!("HTTP {status}: {body}"))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::timeout(error.to_string())
        } else if let Some(status) = error.status() {
            Self::from_status(status.as_u16(), &error.to_string())
        } else if error.is_decode() || error.is_body() {
            Self::unavailable(format!("invalid response body: {error}"))
        } else {
            Self::unavailable(error.to_string())
        }
    }
}

/// Successful backend response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    /// Raw judgment text, parsed by the consumer
    pub text: String,
    /// Model that produced it, if the provider reports one
    pub model: Option<String>,
    /// Actual cost reported by the provider (falls back to the descriptor cost)
    pub cost_usd: Option<f64>,
}

impl BackendResponse {
    /// Response with only text
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
            cost_usd: None,
        }
    }
}

/// Incremental output from a streaming call
#[derive(Clone, Debug)]
pub enum ResponseChunk {
    /// Partial text
    Text(String),
    /// Call finished; `text` may be empty if it was streamed as [`Self::Text`]
    Complete(BackendResponse),
    /// Call failed mid-stream
    Error(BackendError),
}

/// Inference backend
///
/// Implement this trait to plug a provider into the gateway.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend name, matching its descriptor
    fn name(&self) -> &str;

    /// Run one classification call, giving up after `timeout`
    async fn invoke(&self, content: &str, timeout: Duration)
        -> Result<BackendResponse, BackendError>;

    /// Streaming form of [`Self::invoke`]
    ///
    /// Resolves as soon as the provider starts answering. The default adapter
    /// waits for the whole response, so for non-streaming providers the first
    /// response and the complete response coincide.
    async fn invoke_streaming(
        &self,
        content: &str,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<ResponseChunk>, BackendError> {
        let response = self.invoke(content, timeout).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(ResponseChunk::Complete(response));
        Ok(rx)
    }

    /// Cheap reachability probe
    async fn health_check(&self) -> bool {
        true
    }
}
