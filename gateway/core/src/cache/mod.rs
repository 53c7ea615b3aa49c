//! Semantic Response Cache
//!
//! Near-duplicate documents about the same subject reuse an earlier backend
//! response instead of paying for another call.
//!
//! # Partitioning
//!
//! Entries live in one FIFO partition per `subject_key`. A lookup only ever
//! scans its own partition, so identical text filed under two subjects never
//! shares an entry.
//!
//! # Lookup
//!
//! 1. An unexpired entry with the same normalized fingerprint is an exact hit
//!    (similarity 1.0, no embedding needed)
//! 2. Otherwise the content is embedded and the most similar unexpired entry
//!    at or above `similarity_threshold` wins
//!
//! Storing is best-effort: an embedding failure is logged and dropped.

pub mod embedding;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

pub use embedding::{cosine, Embedder, EmbeddingError, HashingEmbedder};

use crate::backend::BackendResponse;
use crate::clock::{elapsed_between, Clock};
use crate::request::Fingerprint;

// ============================================================================
// Configuration
// ============================================================================

/// Cache tuning
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Minimum similarity for a hit
    pub similarity_threshold: f32,
    /// Entry lifetime
    pub ttl: Duration,
    /// Partition capacity; the oldest entry is evicted on overflow
    pub max_entries_per_subject: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.95,
            ttl: Duration::from_secs(24 * 60 * 60),
            max_entries_per_subject: 100,
        }
    }
}

// ============================================================================
// Entries
// ============================================================================

/// One cached response
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Normalized content fingerprint
    pub fingerprint: Fingerprint,
    /// Content embedding
    pub embedding: Vec<f32>,
    /// Partition key
    pub subject_key: String,
    /// Backend response
    pub response: BackendResponse,
    /// Insertion time
    pub cached_at: DateTime<Utc>,
    /// Lifetime from `cached_at`
    pub ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        elapsed_between(self.cached_at, now) < self.ttl
    }
}

/// A cache hit
#[derive(Clone, Debug, PartialEq)]
pub struct CachedResponse {
    /// Stored response
    pub response: BackendResponse,
    /// Similarity of the matched entry
    pub similarity: f32,
    /// When the matched entry was stored
    pub cached_at: DateTime<Utc>,
}

/// Counters since startup
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Live entries across all partitions
    pub entries: usize,
    /// Partitions
    pub subjects: usize,
    /// Lookups that hit
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Entries dropped for capacity
    pub evictions: u64,
    /// Stores skipped because embedding failed
    pub store_failures: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ============================================================================
// Semantic Cache
// ============================================================================

/// Subject-partitioned similarity cache
pub struct SemanticCache {
    config: CacheConfig,
    embedder: Arc<dyn Embedder>,
    clock: Arc<dyn Clock>,
    partitions: DashMap<String, VecDeque<CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    store_failures: AtomicU64,
}

impl SemanticCache {
    /// Create an empty cache
    pub fn new(config: CacheConfig, embedder: Arc<dyn Embedder>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            embedder,
            clock,
            partitions: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
        }
    }

    /// Cache configuration
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Find a cached response for `content` under `subject_key`
    pub fn lookup(&self, subject_key: &str, content: &str) -> Option<CachedResponse> {
        let result = self.find(subject_key, content);
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn find(&self, subject_key: &str, content: &str) -> Option<CachedResponse> {
        let now = self.clock.now();
        let fingerprint = Fingerprint::of(content);

        {
            let partition = self.partitions.get(subject_key)?;
            if let Some(entry) = partition
                .iter()
                .rev()
                .find(|e| e.fingerprint == fingerprint && e.is_fresh(now))
            {
                return Some(CachedResponse {
                    response: entry.response.clone(),
                    similarity: 1.0,
                    cached_at: entry.cached_at,
                });
            }
        }

        let embedding = match self.embedder.embed(content) {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::debug!(subject_key, error = %e, "Embedding failed, treating as miss");
                return None;
            }
        };

        let partition = self.partitions.get(subject_key)?;
        partition
            .iter()
            .filter(|e| e.is_fresh(now))
            .map(|e| (e, self.embedder.similarity(&embedding, &e.embedding)))
            .filter(|(_, similarity)| *similarity >= self.config.similarity_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(entry, similarity)| CachedResponse {
                response: entry.response.clone(),
                similarity,
                cached_at: entry.cached_at,
            })
    }

    /// Remember `response` for `content` under `subject_key`
    pub fn store(&self, subject_key: &str, content: &str, response: &BackendResponse) {
        let embedding = match self.embedder.embed(content) {
            Ok(embedding) => embedding,
            Err(e) => {
                self.store_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(subject_key, error = %e, "Cache store skipped");
                return;
            }
        };

        let now = self.clock.now();
        let fingerprint = Fingerprint::of(content);
        let entry = CacheEntry {
            fingerprint,
            embedding,
            subject_key: subject_key.to_string(),
            response: response.clone(),
            cached_at: now,
            ttl: self.config.ttl,
        };

        let mut partition = self.partitions.entry(subject_key.to_string()).or_default();
        partition.retain(|e| e.is_fresh(now) && e.fingerprint != fingerprint);
        partition.push_back(entry);

        while partition.len() > self.config.max_entries_per_subject {
            partition.pop_front();
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop expired entries and empty partitions
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.partitions.retain(|_, partition| {
            let before = partition.len();
            partition.retain(|e| e.is_fresh(now));
            removed += before - partition.len();
            !partition.is_empty()
        });
        removed
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.partitions.iter().map(|p| p.len()).sum(),
            subjects: self.partitions.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }

    /// Fraction of lookups that hit
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }
}

impl fmt::Debug for SemanticCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemanticCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
