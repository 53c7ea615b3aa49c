//! Inbound Requests
//!
//! A [`Request`] is created once by [`Request::new`] when the producer submits
//! a document and is never mutated afterwards. It is dropped after its result
//! or dead-letter entry has been recorded.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::elapsed_between;

/// Unique request identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalized content fingerprint
///
/// Low 32 bits: CRC32 of the normalized text. High 32 bits: normalized length.
/// Two documents that differ only in case or whitespace share a fingerprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprint a piece of content
    #[must_use]
    pub fn of(content: &str) -> Self {
        let normalized = normalize(content);
        let crc = crc32fast::hash(normalized.as_bytes());
        let len = u32::try_from(normalized.len()).unwrap_or(u32::MAX);
        Self((u64::from(len) << 32) | u64::from(crc))
    }

    /// Raw value
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Lowercase and collapse runs of whitespace
fn normalize(content: &str) -> String {
    content
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Scheduling priority (higher is served first)
pub type Priority = u8;

/// Default priority for submissions that do not specify one
pub const DEFAULT_PRIORITY: Priority = 50;

/// What the producer hands to the dispatcher
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Submission {
    /// Document text
    pub content: String,
    /// Partition key, e.g. a ticker symbol
    pub subject_key: String,
    /// Scheduling priority
    #[serde(default = "default_priority")]
    pub priority: Priority,
    /// Absolute deadline
    pub deadline: DateTime<Utc>,
}

fn default_priority() -> Priority {
    DEFAULT_PRIORITY
}

impl Submission {
    /// Build a submission with the default priority
    pub fn new(
        content: impl Into<String>,
        subject_key: impl Into<String>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            content: content.into(),
            subject_key: subject_key.into(),
            priority: DEFAULT_PRIORITY,
            deadline,
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// An accepted request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    /// Identifier
    pub id: RequestId,
    /// Document text
    pub content: String,
    /// Normalized fingerprint of `content`
    pub content_fingerprint: Fingerprint,
    /// Partition key for caching
    pub subject_key: String,
    /// Scheduling priority
    pub priority: Priority,
    /// When the producer submitted it
    pub submitted_at: DateTime<Utc>,
    /// Hard deadline for a result
    pub deadline: DateTime<Utc>,
}

impl Request {
    /// Accept a submission at `now`
    #[must_use]
    pub fn new(submission: Submission, now: DateTime<Utc>) -> Self {
        let content_fingerprint = Fingerprint::of(&submission.content);
        Self {
            id: RequestId::new(),
            content: submission.content,
            content_fingerprint,
            subject_key: submission.subject_key,
            priority: submission.priority,
            submitted_at: now,
            deadline: submission.deadline,
        }
    }

    /// Content size in bytes, compared against `max_content_size`
    #[must_use]
    pub fn content_size(&self) -> usize {
        self.content.len()
    }

    /// Whether the deadline has passed at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Time left until the deadline
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(now, self.deadline)
    }
}
