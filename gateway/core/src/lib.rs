//! Gateway Core - Routing and Resilience for Sentiment Inference
//!
//! Every document in the stream needs one classification judgment from one of
//! several interchangeable inference backends: a local, zero-cost model with
//! little capacity, and metered cloud APIs with quotas. This crate decides
//! which backend serves each request and keeps the pipeline moving when
//! backends fail, throttle, or cost too much.
//!
//! # Architecture
//!
//! ```text
//! Producer
//!    |  submit(content, subject_key, priority, deadline)
//!    v
//! +---------------------------------------------------------------+
//! |                         Dispatcher                            |
//! |  queue -> cache check -> routing -> backend call -> retries   |
//! +------+-------------+---------------+----------------+---------+
//!        |             |               |                |
//!        v             v               v                v
//!  SemanticCache     Router      InferenceBackend   DeadLetterSink
//!                      |
//!     +----------------+----------------+
//!     v                v                v
//! CircuitBreaker  BudgetLedger    RateLimiter
//! ```
//!
//! # Key Types
//!
//! - [`Dispatcher`]: request lifecycle, the only writer of breaker outcomes
//!   and budget commits
//! - [`Router`]: tiered backend selection with per-backend admission
//! - [`SemanticCache`]: near-duplicate reuse, partitioned by subject
//! - [`InferenceBackend`]: provider abstraction (Ollama, OpenAI-compatible)
//! - [`GatewayConfig`]: TOML + environment configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use gateway_core::{config, Gateway, Submission};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = config::load_config()?;
//!     let gateway = Gateway::from_config(&config)?;
//!
//!     let deadline = chrono::Utc::now() + chrono::Duration::seconds(30);
//!     let verdict = gateway
//!         .dispatcher
//!         .submit(Submission::new("Acme beats estimates", "ACME", deadline))
//!         .await?;
//!     println!("{}", verdict.response.text);
//!
//!     gateway.dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: backend trait and HTTP clients
//! - [`cache`]: semantic cache and embeddings
//! - [`clock`]: injectable time source
//! - [`config`]: configuration loading
//! - [`dispatch`]: dispatcher, events, dead letters
//! - [`request`]: request and fingerprint types
//! - [`routing`]: rate limiter, breaker, retry, budget, router, metrics

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod request;
pub mod routing;

mod gateway;

// Re-exports for convenience
pub use backend::{
    build_backend, BackendError, BackendErrorKind, BackendProvider, BackendResponse,
    InferenceBackend, OllamaBackend, OpenAiBackend, ResponseChunk,
};
pub use cache::{CacheConfig, CachedResponse, Embedder, HashingEmbedder, SemanticCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ConfigOverrides, ConfigSource, GatewayConfig};
pub use dispatch::{
    DeadLetterEntry, DeadLetterSink, DispatchEvent, DispatchFailure, Dispatcher,
    DispatcherConfig, FailureKind, InMemoryDeadLetterSink, JsonlDeadLetterSink, RequestState,
    Verdict, VerdictSource,
};
pub use gateway::{Gateway, GatewayError};
pub use request::{Fingerprint, Priority, Request, RequestId, Submission, DEFAULT_PRIORITY};
pub use routing::{
    BackendDescriptor, BackendTier, BreakerConfig, BudgetConfig, BudgetLedger, CircuitBreaker,
    CircuitStatus, GatewayMetrics, MetricsSnapshot, RateLimiter, RetryPolicy, Router,
};
