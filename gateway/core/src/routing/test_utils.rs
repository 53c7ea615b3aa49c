//! Scripted Backend Test Utilities
//!
//! Mock infrastructure for exercising routing and dispatch without a real
//! provider. A [`ScriptedBackend`] replays a queue of outcomes, then repeats
//! its default outcome, while recording call counts and peak concurrency.
//!
//! # Usage
//!
//! ```ignore
//! let backend = ScriptedBackend::new("cloud")
//!     .then_fail(BackendErrorKind::RateLimited)
//!     .with_latency(Duration::from_millis(20));
//!
//! assert_eq!(backend.calls(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{BackendError, BackendErrorKind, BackendResponse, InferenceBackend};

/// One scripted call result
#[derive(Clone, Debug)]
pub enum Outcome {
    /// Succeed with this text
    Respond(String),
    /// Fail with this kind
    Fail(BackendErrorKind),
    /// Never answer within any sane timeout
    Hang,
}

/// Mock backend replaying scripted outcomes
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Outcome>>,
    default: Outcome,
    latency: Duration,
    calls: AtomicU32,
    in_flight: AtomicU32,
    peak: AtomicU32,
    contents: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    /// Backend that always answers `"neutral"`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            default: Outcome::Respond("neutral".to_string()),
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            peak: AtomicU32::new(0),
            contents: Mutex::new(Vec::new()),
        }
    }

    /// Outcome once the script is used up
    #[must_use]
    pub fn with_default(mut self, outcome: Outcome) -> Self {
        self.default = outcome;
        self
    }

    /// Always fail with `kind`
    #[must_use]
    pub fn always_failing(self, kind: BackendErrorKind) -> Self {
        self.with_default(Outcome::Fail(kind))
    }

    /// Queue a failure
    #[must_use]
    pub fn then_fail(self, kind: BackendErrorKind) -> Self {
        self.script.lock().push_back(Outcome::Fail(kind));
        self
    }

    /// Queue a success
    #[must_use]
    pub fn then_respond(self, text: impl Into<String>) -> Self {
        self.script.lock().push_back(Outcome::Respond(text.into()));
        self
    }

    /// Delay before every answer
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Wrap in an `Arc`
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Number of invocations so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous invocations seen
    pub fn peak_concurrency(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }

    /// Content of every invocation, in order
    pub fn contents(&self) -> Vec<String> {
        self.contents.lock().clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        content: &str,
        timeout: Duration,
    ) -> Result<BackendResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contents.lock().push(content.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        match outcome {
            Outcome::Hang => {
                tokio::time::sleep(timeout + Duration::from_secs(3600)).await;
                Err(BackendError::timeout("hung"))
            }
            Outcome::Respond(text) => {
                tokio::time::sleep(self.latency).await;
                Ok(BackendResponse::text(text))
            }
            Outcome::Fail(kind) => {
                tokio::time::sleep(self.latency).await;
                Err(BackendError::new(kind, "scripted failure"))
            }
        }
    }
}

/// Decrements the in-flight count even when the call is dropped mid-way
struct InFlightGuard<'a>(&'a AtomicU32);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_default() {
        let backend = ScriptedBackend::new("mock")
            .then_fail(BackendErrorKind::Timeout)
            .then_respond("positive");

        let timeout = Duration::from_secs(1);
        assert_eq!(
            backend.invoke("a", timeout).await.unwrap_err().kind,
            BackendErrorKind::Timeout
        );
        assert_eq!(backend.invoke("b", timeout).await.unwrap().text, "positive");
        assert_eq!(backend.invoke("c", timeout).await.unwrap().text, "neutral");
        assert_eq!(backend.calls(), 3);
        assert_eq!(backend.contents(), ["a", "b", "c"]);
    }
}
