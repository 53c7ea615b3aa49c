//! TOML Configuration File Support
//!
//! Centralized configuration loading for the gateway, from a TOML file at
//! `~/.config/inference-gateway/gateway.toml` by default.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables (`GATEWAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [breaker]
//! failure_threshold = 5
//! reset_timeout_secs = 60
//!
//! [cache]
//! similarity_threshold = 0.95
//! ttl_secs = 86400
//!
//! [retry]
//! base_delay_ms = 1000
//! max_attempts = 3
//!
//! [budget]
//! daily_budget_usd = 10.0
//!
//! [[backends]]
//! name = "local"
//! tier = "local"
//! max_concurrent = 2
//! max_content_size = 16384
//! kind = "ollama"
//! base_url = "http://localhost:11434"
//! model = "llama3.2"
//!
//! [[backends]]
//! name = "cloud"
//! tier = "cloud_primary"
//! max_concurrent = 4
//! requests_per_minute = 60
//! requests_per_day = 5000
//! cost_per_request_usd = 0.002
//! max_content_size = 65536
//! kind = "openai"
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! api_key_env = "OPENAI_API_KEY"
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendProvider;
use crate::cache::{CacheConfig, HashingEmbedder};
use crate::dispatch::DispatcherConfig;
use crate::routing::{BackendDescriptor, BreakerConfig, BudgetConfig, RetryPolicy};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Where the effective configuration last came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Built-in defaults
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[breaker]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerToml {
    /// Consecutive failures that open the circuit
    pub failure_threshold: Option<u32>,
    /// Seconds spent open before trials
    pub reset_timeout_secs: Option<u64>,
    /// Half-open successes that close the circuit
    pub success_threshold: Option<u32>,
    /// Concurrent half-open trials
    pub half_open_max_calls: Option<u32>,
}

/// `[cache]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Minimum similarity for a hit
    pub similarity_threshold: Option<f32>,
    /// Entry lifetime in seconds
    pub ttl_secs: Option<u64>,
    /// Entries kept per subject
    pub max_entries_per_subject: Option<usize>,
    /// Width of the hashing embedder
    pub embedding_dimensions: Option<usize>,
}

/// `[retry]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: Option<u64>,
    /// Backoff cap, in milliseconds
    pub max_delay_ms: Option<u64>,
    /// Total tries including the first
    pub max_attempts: Option<u32>,
    /// Random extra as a fraction of the delay
    pub jitter_ratio: Option<f64>,
}

/// `[budget]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetToml {
    /// Spend cap per UTC day
    pub daily_budget_usd: Option<f64>,
    /// Alert threshold in percent of the cap
    pub alert_threshold_pct: Option<u8>,
    /// Days of spend history kept
    pub retain_days: Option<u32>,
}

/// `[dispatcher]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherToml {
    /// First-response timeout in milliseconds
    pub first_response_timeout_ms: Option<u64>,
    /// Total call timeout in milliseconds
    pub total_timeout_ms: Option<u64>,
    /// Router re-poll interval in milliseconds
    pub routing_poll_interval_ms: Option<u64>,
    /// Inbound queue capacity
    pub queue_capacity: Option<usize>,
    /// Extra worker slots
    pub bookkeeping_slots: Option<usize>,
}

/// One `[[backends]]` entry: routing limits plus connection settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Routing limits
    #[serde(flatten)]
    pub descriptor: BackendDescriptor,
    /// How to reach it
    #[serde(flatten)]
    pub provider: BackendProvider,
}

/// Top-level TOML structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Breaker section
    pub breaker: BreakerToml,
    /// Cache section
    pub cache: CacheToml,
    /// Retry section
    pub retry: RetryToml,
    /// Budget section
    pub budget: BudgetToml,
    /// Dispatcher section
    pub dispatcher: DispatcherToml,
    /// Backend list
    pub backends: Vec<BackendConfig>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Effective gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Backends in configuration order
    pub backends: Vec<BackendConfig>,
    /// Breaker thresholds, shared by every backend
    pub breaker: BreakerConfig,
    /// Cache tuning
    pub cache: CacheConfig,
    /// Hashing embedder width
    pub embedding_dimensions: usize,
    /// Retry policy
    pub retry: RetryPolicy,
    /// Budget limits
    pub budget: BudgetConfig,
    /// Dispatcher tuning
    pub dispatcher: DispatcherConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            embedding_dimensions: HashingEmbedder::DEFAULT_DIMENSIONS,
            retry: RetryPolicy::default(),
            budget: BudgetConfig::default(),
            dispatcher: DispatcherConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Routing descriptors in configuration order
    #[must_use]
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.backends.iter().map(|b| b.descriptor.clone()).collect()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid =
            |msg: String| -> Result<(), ConfigError> { Err(ConfigError::ValidationError(msg)) };

        let mut names = HashSet::new();
        for backend in &self.backends {
            let d = &backend.descriptor;
            if d.name.trim().is_empty() {
                return invalid("backend name must not be empty".to_string());
            }
            if !names.insert(d.name.as_str()) {
                return invalid(format!("duplicate backend name '{}'", d.name));
            }
            if d.max_concurrent == 0 {
                return invalid(format!("backend '{}': max_concurrent must be > 0", d.name));
            }
            if !(d.cost_per_request_usd.is_finite() && d.cost_per_request_usd >= 0.0) {
                return invalid(format!(
                    "backend '{}': cost_per_request_usd must be a non-negative number",
                    d.name
                ));
            }
        }

        let threshold = self.cache.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return invalid(format!(
                "similarity_threshold must be in (0, 1], got {threshold}"
            ));
        }
        if self.retry.max_attempts == 0 {
            return invalid("max_attempts must be at least 1".to_string());
        }
        if !(self.retry.jitter_ratio.is_finite() && self.retry.jitter_ratio >= 0.0) {
            return invalid("jitter_ratio must be a non-negative number".to_string());
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return invalid("breaker thresholds must be at least 1".to_string());
        }
        if self.breaker.half_open_max_calls == 0 {
            return invalid("half_open_max_calls must be at least 1".to_string());
        }
        if !(self.budget.daily_budget_usd.is_finite() && self.budget.daily_budget_usd >= 0.0) {
            return invalid("daily_budget_usd must be a non-negative number".to_string());
        }
        if self.budget.alert_threshold_pct > 100 {
            return invalid("alert_threshold_pct must be at most 100".to_string());
        }
        if self.dispatcher.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1".to_string());
        }
        if self.dispatcher.first_response_timeout > self.dispatcher.total_timeout {
            return invalid("first_response_timeout must not exceed total_timeout".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/inference-gateway/gateway.toml`, usually
/// `~/.config/inference-gateway/gateway.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("inference-gateway").join("gateway.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result is invalid. A missing config file is not an error.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the result is
/// invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                backends = config.backends.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Parse configuration from TOML text (no environment overrides)
///
/// # Errors
///
/// Returns an error if the text cannot be parsed or the result is invalid.
pub fn parse_config(toml_content: &str) -> Result<GatewayConfig, ConfigError> {
    let toml_config: GatewayToml = toml::from_str(toml_content)?;
    let mut config = GatewayConfig::default();
    apply_toml_config(&mut config, toml_config);
    config.source = ConfigSource::File;
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut GatewayConfig, toml: GatewayToml) {
    // Breaker
    if let Some(threshold) = toml.breaker.failure_threshold {
        config.breaker.failure_threshold = threshold;
    }
    if let Some(secs) = toml.breaker.reset_timeout_secs {
        config.breaker.reset_timeout = Duration::from_secs(secs);
    }
    if let Some(threshold) = toml.breaker.success_threshold {
        config.breaker.success_threshold = threshold;
    }
    if let Some(max) = toml.breaker.half_open_max_calls {
        config.breaker.half_open_max_calls = max;
    }

    // Cache
    if let Some(threshold) = toml.cache.similarity_threshold {
        config.cache.similarity_threshold = threshold;
    }
    if let Some(secs) = toml.cache.ttl_secs {
        config.cache.ttl = Duration::from_secs(secs);
    }
    if let Some(max) = toml.cache.max_entries_per_subject {
        config.cache.max_entries_per_subject = max;
    }
    if let Some(dimensions) = toml.cache.embedding_dimensions {
        config.embedding_dimensions = dimensions;
    }

    // Retry
    if let Some(ms) = toml.retry.base_delay_ms {
        config.retry.base_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.retry.max_delay_ms {
        config.retry.max_delay = Duration::from_millis(ms);
    }
    if let Some(attempts) = toml.retry.max_attempts {
        config.retry.max_attempts = attempts;
    }
    if let Some(ratio) = toml.retry.jitter_ratio {
        config.retry.jitter_ratio = ratio;
    }

    // Budget
    if let Some(usd) = toml.budget.daily_budget_usd {
        config.budget.daily_budget_usd = usd;
    }
    if let Some(pct) = toml.budget.alert_threshold_pct {
        config.budget.alert_threshold_pct = pct;
    }
    if let Some(days) = toml.budget.retain_days {
        config.budget.retain_days = days;
    }

    // Dispatcher
    if let Some(ms) = toml.dispatcher.first_response_timeout_ms {
        config.dispatcher.first_response_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.dispatcher.total_timeout_ms {
        config.dispatcher.total_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.dispatcher.routing_poll_interval_ms {
        config.dispatcher.routing_poll_interval = Duration::from_millis(ms);
    }
    if let Some(capacity) = toml.dispatcher.queue_capacity {
        config.dispatcher.queue_capacity = capacity;
    }
    if let Some(slots) = toml.dispatcher.bookkeeping_slots {
        config.dispatcher.bookkeeping_slots = slots;
    }

    config.backends = toml.backends;
}

/// Apply `GATEWAY_*` overrides read through `lookup`
fn apply_env_config(config: &mut GatewayConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(usd) = parse_env::<f64>(&lookup, "GATEWAY_DAILY_BUDGET_USD") {
        config.budget.daily_budget_usd = usd;
        config.source = ConfigSource::Env;
    }
    if let Some(attempts) = parse_env::<u32>(&lookup, "GATEWAY_MAX_ATTEMPTS") {
        config.retry.max_attempts = attempts;
        config.source = ConfigSource::Env;
    }
    if let Some(threshold) = parse_env::<f32>(&lookup, "GATEWAY_SIMILARITY_THRESHOLD") {
        config.cache.similarity_threshold = threshold;
        config.source = ConfigSource::Env;
    }
    if let Some(threshold) = parse_env::<u32>(&lookup, "GATEWAY_FAILURE_THRESHOLD") {
        config.breaker.failure_threshold = threshold;
        config.source = ConfigSource::Env;
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// CLI overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Daily budget override
    pub daily_budget_usd: Option<f64>,
    /// Attempt limit override
    pub max_attempts: Option<u32>,
    /// Similarity threshold override
    pub similarity_threshold: Option<f32>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the daily budget
    #[must_use]
    pub fn with_daily_budget_usd(mut self, usd: f64) -> Self {
        self.daily_budget_usd = Some(usd);
        self
    }

    /// Override the attempt limit
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Override the similarity threshold
    #[must_use]
    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    /// Apply to a configuration and re-validate it
    ///
    /// # Errors
    ///
    /// Returns an error if an override makes the configuration invalid.
    pub fn apply(&self, config: &mut GatewayConfig) -> Result<(), ConfigError> {
        if self.daily_budget_usd.is_some()
            || self.max_attempts.is_some()
            || self.similarity_threshold.is_some()
        {
            config.source = ConfigSource::Cli;
        }
        if let Some(usd) = self.daily_budget_usd {
            config.budget.daily_budget_usd = usd;
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.max_attempts = attempts;
        }
        if let Some(threshold) = self.similarity_threshold {
            config.cache.similarity_threshold = threshold;
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
