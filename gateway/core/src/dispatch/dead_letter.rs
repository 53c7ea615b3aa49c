//! Dead-Letter Sinks
//!
//! Requests that exhausted their retries, hit a fatal backend error, or can
//! never be routed are written here for manual review. Entries are
//! append-only and never retried automatically.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::outcome::FailureKind;
use crate::backend::BackendError;
use crate::request::Request;

/// One failed request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The request as submitted
    pub request: Request,
    /// Last backend error, if any backend was called
    pub last_error: Option<BackendError>,
    /// Backend calls made
    pub attempts: u32,
    /// When the request was given up
    pub failed_at: DateTime<Utc>,
    /// Why it was given up
    pub reason: FailureKind,
}

/// Dead-letter write failure
#[derive(Debug, Error)]
pub enum DeadLetterError {
    /// File could not be opened or written
    #[error("dead-letter I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be encoded or decoded
    #[error("dead-letter encoding error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Destination for dead-lettered requests
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Append one entry
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError>;
}

// ============================================================================
// In-Memory Sink
// ============================================================================

/// Sink keeping entries in memory
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry recorded so far
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().clone()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        self.entries.lock().push(entry);
        Ok(())
    }
}

// ============================================================================
// JSON Lines Sink
// ============================================================================

/// Sink appending one JSON object per line to a file
#[derive(Debug)]
pub struct JsonlDeadLetterSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlDeadLetterSink {
    /// Open `path` for appending, creating it and its parent directory
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, DeadLetterError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        tracing::info!(path = %path.display(), "Dead-letter file opened");
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    /// File being written
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every entry of a dead-letter file
    pub async fn read(path: impl AsRef<Path>) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let text = tokio::fs::read_to_string(path).await?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(DeadLetterError::from))
            .collect()
    }
}

#[async_trait]
impl DeadLetterSink for JsonlDeadLetterSink {
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
