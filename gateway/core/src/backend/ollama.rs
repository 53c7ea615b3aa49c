//! Ollama Backend Implementation
//!
//! Local, zero-cost backend talking to an Ollama server.
//!
//! # Ollama API
//!
//! - `/api/generate` - Generate completions (streaming NDJSON or batch)
//! - `/api/tags` - List available models (used as the health probe)
//!
//! The content is sent verbatim as the prompt; prompt templates belong to the
//! caller.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::traits::{BackendError, BackendResponse, InferenceBackend, ResponseChunk};

/// One NDJSON line from `/api/generate`
#[derive(Debug, Deserialize)]
struct GenerateLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Ollama backend client
#[derive(Clone)]
pub struct OllamaBackend {
    /// Descriptor name
    name: String,
    /// Base URL, e.g. `http://localhost:11434`
    base_url: String,
    /// Model tag
    model: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BackendError::unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http_client,
        })
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    async fn post_generate(
        &self,
        content: &str,
        stream: bool,
        timeout: Duration,
    ) -> Result<reqwest::Response, BackendError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": content,
            "stream": stream,
        });

        let response = self
            .http_client
            .post(self.generate_url())
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &body));
        }

        Ok(response)
    }
}

/// Drain complete lines from `buffer`, forwarding text to `tx`
///
/// Returns `Some(final)` once a `done` line arrives, `None` if more input is
/// needed. `Err(())` means the receiver went away.
async fn drain_lines(
    buffer: &mut String,
    full_response: &mut String,
    model: &mut Option<String>,
    tx: &mpsc::Sender<ResponseChunk>,
) -> Result<Option<ResponseChunk>, ()> {
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Ok(data) = serde_json::from_str::<GenerateLine>(line) else {
            tracing::debug!(line, "Skipping unparsable Ollama stream line");
            continue;
        };

        if let Some(error) = data.error {
            return Ok(Some(ResponseChunk::Error(BackendError::unavailable(error))));
        }
        if data.model.is_some() {
            *model = data.model;
        }
        if !data.response.is_empty() {
            full_response.push_str(&data.response);
            tx.send(ResponseChunk::Text(data.response))
                .await
                .map_err(|_| ())?;
        }
        if data.done {
            return Ok(Some(ResponseChunk::Complete(BackendResponse {
                text: std::mem::take(full_response),
                model: model.take(),
                cost_usd: None,
            })));
        }
    }
    Ok(None)
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        content: &str,
        timeout: Duration,
    ) -> Result<BackendResponse, BackendError> {
        let response = self.post_generate(content, false, timeout).await?;
        let line: GenerateLine = response.json().await?;

        if let Some(error) = line.error {
            return Err(BackendError::unavailable(error));
        }

        Ok(BackendResponse {
            text: line.response,
            model: line.model,
            cost_usd: None,
        })
    }

    async fn invoke_streaming(
        &self,
        content: &str,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<ResponseChunk>, BackendError> {
        let response = self.post_generate(content, true, timeout).await?;
        let (tx, rx) = mpsc::channel(100);
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut full_response = String::new();
            let mut model = None;

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        match drain_lines(&mut buffer, &mut full_response, &mut model, &tx).await {
                            Ok(Some(last)) => {
                                let _ = tx.send(last).await;
                                return;
                            }
                            Ok(None) => {}
                            Err(()) => return,
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(ResponseChunk::Error(BackendError::from(e))).await;
                        return;
                    }
                }
            }

            // Stream ended without a done line
            let last = if full_response.is_empty() {
                ResponseChunk::Error(BackendError::unavailable("stream closed before completion"))
            } else {
                ResponseChunk::Complete(BackendResponse {
                    text: full_response,
                    model,
                    cost_usd: None,
                })
            };
            let _ = tx.send(last).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
