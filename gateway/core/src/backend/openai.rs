//! OpenAI-Compatible Backend
//!
//! Metered remote backend speaking the `/v1/chat/completions` protocol. Works
//! with any provider exposing that endpoint. Responses are requested in batch
//! mode, so the default streaming adapter applies.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::traits::{BackendError, BackendErrorKind, BackendResponse, InferenceBackend};

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions client
#[derive(Clone)]
pub struct OpenAiBackend {
    name: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl OpenAiBackend {
    /// Create a new client
    ///
    /// `api_key` is sent as a bearer token when present.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BackendError::unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            http_client,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

fn extract_text(completion: ChatCompletion) -> Result<BackendResponse, BackendError> {
    let text = completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| {
            BackendError::new(BackendErrorKind::Unavailable, "completion contained no choices")
        })?;

    Ok(BackendResponse {
        text,
        model: completion.model,
        cost_usd: None,
    })
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        content: &str,
        timeout: Duration,
    ) -> Result<BackendResponse, BackendError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "stream": false,
        });

        let response = self
            .authorize(self.http_client.post(self.completions_url()))
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &body));
        }

        let completion: ChatCompletion = response.json().await?;
        extract_text(completion)
    }

    async fn health_check(&self) -> bool {
        self.authorize(self.http_client.get(self.models_url()))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
