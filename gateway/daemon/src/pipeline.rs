//! JSONL Request Pipeline
//!
//! Reads one submission per input line, dispatches every submission
//! concurrently, and writes one result line per request.
//!
//! # Wire Format
//!
//! Input:
//!
//! ```text
//! {"content": "...", "subject_key": "ACME", "priority": 80, "deadline_ms": 5000}
//! ```
//!
//! `priority` and `deadline_ms` are optional; `deadline_ms` is relative to
//! the moment the line is read.
//!
//! Output (one of):
//!
//! ```text
//! {"status":"ok","line":1,"request_id":"...","response":{...},"source":"backend",...}
//! {"status":"failed","line":2,"request_id":"...","kind":"retries_exhausted",...}
//! {"status":"invalid","line":3,"error":"missing field `subject_key`"}
//! ```
//!
//! Results are written in completion order; `line` ties them to the input.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use gateway_core::{DispatchFailure, Dispatcher, Priority, Submission, Verdict};

/// One input line
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputLine {
    content: String,
    subject_key: String,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    deadline_ms: Option<u64>,
}

impl InputLine {
    fn into_submission(self, default_deadline: Duration) -> Submission {
        let budget = self
            .deadline_ms
            .map_or(default_deadline, Duration::from_millis);
        let budget = chrono::Duration::from_std(budget).unwrap_or(chrono::Duration::MAX);
        let deadline = chrono::Utc::now()
            .checked_add_signed(budget)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);

        let submission = Submission::new(self.content, self.subject_key, deadline);
        match self.priority {
            Some(priority) => submission.with_priority(priority),
            None => submission,
        }
    }
}

/// One output line
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutputLine {
    /// Request produced a verdict
    Ok {
        line: u64,
        #[serde(flatten)]
        verdict: Verdict,
    },
    /// Request reached a terminal failure
    Failed {
        line: u64,
        #[serde(flatten)]
        failure: DispatchFailure,
    },
    /// Line could not be parsed
    Invalid { line: u64, error: String },
}

/// Counts reported when the pipeline stops
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Non-empty lines read
    pub lines: u64,
    /// Lines submitted to the dispatcher
    pub submitted: u64,
    /// Lines rejected as malformed
    pub invalid: u64,
    /// Verdicts written
    pub succeeded: u64,
    /// Failures written
    pub failed: u64,
}

/// Stdin-to-stdout driver around a [`Dispatcher`]
pub struct Pipeline {
    dispatcher: Arc<Dispatcher>,
    default_deadline: Duration,
}

impl Pipeline {
    /// Create a pipeline; lines without `deadline_ms` get `default_deadline`
    pub fn new(dispatcher: Arc<Dispatcher>, default_deadline: Duration) -> Self {
        Self {
            dispatcher,
            default_deadline,
        }
    }

    /// Run until `input` ends or `stop` resolves, then wait for every
    /// accepted request and flush its result
    pub async fn run<R, W>(
        &self,
        input: R,
        output: W,
        stop: impl Future<Output = ()>,
    ) -> Result<PipelineSummary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_results(output, results_rx));

        let mut summary = PipelineSummary::default();
        let mut in_flight = JoinSet::new();
        let mut lines = input.lines();
        let mut line_number = 0u64;
        tokio::pin!(stop);

        loop {
            let next = tokio::select! {
                biased;
                () = &mut stop => {
                    info!("Stop requested, no further input accepted");
                    break;
                }
                next = lines.next_line() => next.context("Failed to read input line")?,
            };
            let Some(raw) = next else {
                debug!("Input closed");
                break;
            };
            line_number += 1;
            if raw.trim().is_empty() {
                continue;
            }
            summary.lines += 1;

            let input: InputLine = match serde_json::from_str(&raw) {
                Ok(input) => input,
                Err(e) => {
                    warn!(line = line_number, error = %e, "Malformed input line");
                    summary.invalid += 1;
                    let _ = results_tx.send(OutputLine::Invalid {
                        line: line_number,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            summary.submitted += 1;
            let submission = input.into_submission(self.default_deadline);
            let dispatcher = Arc::clone(&self.dispatcher);
            let results = results_tx.clone();
            let line = line_number;
            in_flight.spawn(async move {
                let output = match dispatcher.submit(submission).await {
                    Ok(verdict) => OutputLine::Ok { line, verdict },
                    Err(failure) => OutputLine::Failed { line, failure },
                };
                let _ = results.send(output);
            });
        }

        info!(pending = in_flight.len(), "Draining in-flight requests");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Request task failed");
            }
        }
        drop(results_tx);

        let (succeeded, failed) = writer.await.context("Result writer panicked")??;
        summary.succeeded = succeeded;
        summary.failed = failed;
        Ok(summary)
    }
}

/// Serialize results as they arrive; returns (verdicts, failures) written
async fn write_results<W>(
    mut output: W,
    mut results: mpsc::UnboundedReceiver<OutputLine>,
) -> Result<(u64, u64)>
where
    W: AsyncWrite + Unpin,
{
    let mut succeeded = 0;
    let mut failed = 0;
    while let Some(result) = results.recv().await {
        match &result {
            OutputLine::Ok { .. } => succeeded += 1,
            OutputLine::Failed { .. } => failed += 1,
            OutputLine::Invalid { .. } => {}
        }
        let mut line = serde_json::to_vec(&result).context("Failed to encode result")?;
        line.push(b'\n');
        output
            .write_all(&line)
            .await
            .context("Failed to write result")?;
        output.flush().await.context("Failed to flush output")?;
    }
    Ok((succeeded, failed))
}
