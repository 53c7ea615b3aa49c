//! Gateway Metrics
//!
//! Lock-free counters, gauges and latency histograms:
//! - Per-backend calls, outcomes, latency, in-flight and spend
//! - Global cache, coalescing, retry, cancellation and dead-letter counts
//!
//! The backend set is fixed at startup, so the per-backend map is built once
//! and never locked afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket upper bounds (milliseconds)
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket boundaries
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Default latency buckets (milliseconds)
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        if self.buckets.is_empty() {
            return;
        }
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value as u64, Ordering::Relaxed);
        self.max.fetch_max(value as u64, Ordering::Relaxed);
    }

    /// Record a duration in milliseconds
    pub fn record_duration(&self, duration: Duration) {
        self.record(duration.as_secs_f64() * 1000.0);
    }

    /// Get histogram snapshot
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 { sum as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub max: u64,
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        *self.buckets.last().unwrap_or(&0.0)
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter / Gauge
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // never wraps below zero
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Backend Metrics
// ============================================================================

/// Metrics for a single backend
#[derive(Debug)]
pub struct BackendMetrics {
    pub backend: String,
    pub calls: Counter,
    pub successes: Counter,
    pub failures: Counter,
    pub timeouts: Counter,
    /// Calls cut short by the request deadline
    pub cancelled: Counter,
    pub in_flight: Gauge,
    pub peak_in_flight: AtomicU64,
    pub latency: Histogram,
    spend_micros: Counter,
}

impl BackendMetrics {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            calls: Counter::new(),
            successes: Counter::new(),
            failures: Counter::new(),
            timeouts: Counter::new(),
            cancelled: Counter::new(),
            in_flight: Gauge::new(),
            peak_in_flight: AtomicU64::new(0),
            latency: Histogram::latency_default(),
            spend_micros: Counter::new(),
        }
    }

    /// A call started
    pub fn call_started(&self) {
        self.calls.inc();
        self.in_flight.inc();
        self.peak_in_flight
            .fetch_max(self.in_flight.get(), Ordering::Relaxed);
    }

    /// A call ended, whatever the outcome
    pub fn call_finished(&self, started: Instant) {
        self.in_flight.dec();
        self.latency.record_duration(started.elapsed());
    }

    /// Add spend
    pub fn add_spend(&self, usd: f64) {
        if usd.is_finite() && usd > 0.0 {
            self.spend_micros.add((usd * 1_000_000.0).round() as u64);
        }
    }

    pub fn summary(&self) -> BackendMetricsSummary {
        let latency = self.latency.snapshot();
        BackendMetricsSummary {
            backend: self.backend.clone(),
            calls: self.calls.get(),
            successes: self.successes.get(),
            failures: self.failures.get(),
            timeouts: self.timeouts.get(),
            cancelled: self.cancelled.get(),
            in_flight: self.in_flight.get(),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            latency_p50_ms: latency.p50(),
            latency_p99_ms: latency.p99(),
            spend_usd: self.spend_micros.get() as f64 / 1_000_000.0,
        }
    }
}

/// Summary of backend metrics
#[derive(Clone, Debug, Serialize)]
pub struct BackendMetricsSummary {
    pub backend: String,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub spend_usd: f64,
}

// ============================================================================
// Gateway Metrics
// ============================================================================

/// Centralized metrics for the gateway
#[derive(Debug)]
pub struct GatewayMetrics {
    backends: HashMap<String, Arc<BackendMetrics>>,

    pub submitted: Counter,
    pub completed: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    /// Requests served by waiting on an identical in-flight request
    pub coalesced: Counter,
    pub retries: Counter,
    pub dead_lettered: Counter,
    pub cancelled: Counter,
    pub failed: Counter,
    pub queue_depth: Gauge,
    pub end_to_end: Histogram,

    started_at: Instant,
}

impl GatewayMetrics {
    /// Create metrics for a fixed set of backends
    pub fn new<'a>(backends: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            backends: backends
                .into_iter()
                .map(|name| (name.to_string(), Arc::new(BackendMetrics::new(name))))
                .collect(),
            submitted: Counter::new(),
            completed: Counter::new(),
            cache_hits: Counter::new(),
            cache_misses: Counter::new(),
            coalesced: Counter::new(),
            retries: Counter::new(),
            dead_lettered: Counter::new(),
            cancelled: Counter::new(),
            failed: Counter::new(),
            queue_depth: Gauge::new(),
            end_to_end: Histogram::latency_default(),
            started_at: Instant::now(),
        }
    }

    /// Metrics of one backend
    pub fn backend(&self, name: &str) -> Option<&Arc<BackendMetrics>> {
        self.backends.get(name)
    }

    /// Cache hit ratio observed by the dispatcher
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.get();
        let total = hits + self.cache_misses.get();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Point-in-time copy of everything
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut backends: Vec<_> = self.backends.values().map(|m| m.summary()).collect();
        backends.sort_by(|a, b| a.backend.cmp(&b.backend));
        let end_to_end = self.end_to_end.snapshot();

        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            submitted: self.submitted.get(),
            completed: self.completed.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            cache_hit_rate: self.cache_hit_rate(),
            coalesced: self.coalesced.get(),
            retries: self.retries.get(),
            dead_lettered: self.dead_lettered.get(),
            cancelled: self.cancelled.get(),
            failed: self.failed.get(),
            queue_depth: self.queue_depth.get(),
            end_to_end_p50_ms: end_to_end.p50(),
            end_to_end_p99_ms: end_to_end.p99(),
            backends,
        }
    }
}

/// Serializable view of [`GatewayMetrics`]
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub submitted: u64,
    pub completed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub coalesced: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub queue_depth: u64,
    pub end_to_end_p50_ms: f64,
    pub end_to_end_p99_ms: f64,
    pub backends: Vec<BackendMetricsSummary>,
}
