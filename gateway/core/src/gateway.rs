//! Gateway Assembly
//!
//! Builds every component from a [`GatewayConfig`] and wires them into a
//! [`Dispatcher`]. Components stay explicit instances; nothing is global.

use std::sync::Arc;

use thiserror::Error;

use crate::backend::{build_backend, BackendError, InferenceBackend};
use crate::cache::{HashingEmbedder, SemanticCache};
use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::dispatch::{dead_letter::DeadLetterSink, BuildError, Dispatcher};
use crate::routing::{BudgetLedger, GatewayMetrics, MetricsSnapshot, Router};

/// Failure to assemble a gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Backend client could not be created
    #[error("backend '{name}': {source}")]
    Backend {
        /// Backend name
        name: String,
        /// Underlying error
        source: BackendError,
    },

    /// Dispatcher could not be built
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Fully wired gateway
pub struct Gateway {
    /// Request entry point
    pub dispatcher: Arc<Dispatcher>,
    /// Backend selection
    pub router: Arc<Router>,
    /// Response cache
    pub cache: Arc<SemanticCache>,
    /// Spend ledger
    pub ledger: Arc<BudgetLedger>,
    /// Shared metrics
    pub metrics: Arc<GatewayMetrics>,
    backends: Vec<Arc<dyn InferenceBackend>>,
}

impl Gateway {
    /// Build from configuration with an in-memory dead-letter sink
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        Self::assemble(config, None)
    }

    /// Build from configuration with the given dead-letter sink
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_config_with_sink(
        config: &GatewayConfig,
        sink: Arc<dyn DeadLetterSink>,
    ) -> Result<Self, GatewayError> {
        Self::assemble(config, Some(sink))
    }

    fn assemble(
        config: &GatewayConfig,
        sink: Option<Arc<dyn DeadLetterSink>>,
    ) -> Result<Self, GatewayError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let backends = config
            .backends
            .iter()
            .map(|b| {
                build_backend(&b.descriptor.name, &b.provider).map_err(|source| {
                    GatewayError::Backend {
                        name: b.descriptor.name.clone(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ledger = Arc::new(BudgetLedger::new(config.budget.clone(), Arc::clone(&clock)));
        let router = Arc::new(Router::new(
            config.descriptors(),
            &config.breaker,
            Arc::clone(&ledger),
            Arc::clone(&clock),
        ));
        let cache = Arc::new(SemanticCache::new(
            config.cache.clone(),
            Arc::new(HashingEmbedder::new(config.embedding_dimensions)),
            Arc::clone(&clock),
        ));
        let metrics = Arc::new(GatewayMetrics::new(
            config.backends.iter().map(|b| b.descriptor.name.as_str()),
        ));

        let mut builder = Dispatcher::builder(Arc::clone(&router), Arc::clone(&cache))
            .with_config(config.dispatcher.clone())
            .with_retry_policy(config.retry.clone())
            .with_metrics(Arc::clone(&metrics))
            .with_clock(clock);
        for backend in &backends {
            builder = builder.with_backend(Arc::clone(backend));
        }
        if let Some(sink) = sink {
            builder = builder.with_dead_letter_sink(sink);
        }
        let dispatcher = Arc::new(builder.build()?);

        tracing::info!(
            backends = backends.len(),
            daily_budget_usd = config.budget.daily_budget_usd,
            "Gateway assembled"
        );

        Ok(Self {
            dispatcher,
            router,
            cache,
            ledger,
            metrics,
            backends,
        })
    }

    /// Probe every backend once, logging unreachable ones
    pub async fn check_health(&self) -> Vec<(String, bool)> {
        let mut results = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let healthy = backend.health_check().await;
            if healthy {
                tracing::info!(backend = backend.name(), "Backend reachable");
            } else {
                tracing::warn!(backend = backend.name(), "Backend unreachable at startup");
            }
            results.push((backend.name().to_string(), healthy));
        }
        results
    }

    /// Point-in-time metrics
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
