//! Inference Backend Integration
//!
//! Abstracted access to classification backends through a common trait.
//!
//! # Available Backends
//!
//! - **Ollama**: local model server (zero marginal cost)
//! - **OpenAI-compatible**: metered chat completions API
//!
//! # Usage
//!
//! ```ignore
//! use gateway_core::backend::{build_backend, BackendProvider};
//!
//! let provider = BackendProvider::Ollama {
//!     base_url: "http://localhost:11434".into(),
//!     model: "llama3".into(),
//! };
//! let backend = build_backend("local", &provider)?;
//! let response = backend.invoke("Fed holds rates", Duration::from_secs(30)).await?;
//! ```

mod ollama;
mod openai;
mod traits;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;
pub use traits::{BackendError, BackendErrorKind, BackendResponse, InferenceBackend, ResponseChunk};

/// How to reach a backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendProvider {
    /// Ollama generate endpoint
    Ollama {
        /// Base URL
        base_url: String,
        /// Model tag
        model: String,
    },
    /// OpenAI-compatible chat completions
    #[serde(rename = "openai")]
    OpenAi {
        /// Base URL including the version prefix, e.g. `https://api.openai.com/v1`
        base_url: String,
        /// Model name
        model: String,
        /// Environment variable holding the API key
        #[serde(default)]
        api_key_env: Option<String>,
    },
}

/// Construct a backend client from its provider settings
pub fn build_backend(
    name: &str,
    provider: &BackendProvider,
) -> Result<Arc<dyn InferenceBackend>, BackendError> {
    match provider {
        BackendProvider::Ollama { base_url, model } => {
            Ok(Arc::new(OllamaBackend::new(name, base_url, model)?))
        }
        BackendProvider::OpenAi {
            base_url,
            model,
            api_key_env,
        } => {
            let api_key = match api_key_env {
                Some(var) => Some(std::env::var(var).map_err(|_| {
                    BackendError::new(
                        BackendErrorKind::AuthFailed,
                        format!("environment variable {var} is not set"),
                    )
                })?),
                None => None,
            };
            Ok(Arc::new(OpenAiBackend::new(name, base_url, model, api_key)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_toml() {
        let provider: BackendProvider = toml::from_str(
            r#"
            kind = "openai"
            base_url = "https://api.example.com/v1"
            model = "gpt-4o-mini"
            "#,
        )
        .unwrap();

        assert_eq!(
            provider,
            BackendProvider::OpenAi {
                base_url: "https://api.example.com/v1".into(),
                model: "gpt-4o-mini".into(),
                api_key_env: None,
            }
        );
    }

    #[test]
    fn test_build_backend_names_client() {
        let provider = BackendProvider::Ollama {
            base_url: "http://localhost:11434".into(),
            model: "llama3".into(),
        };
        let backend = build_backend("local", &provider).unwrap();
        assert_eq!(backend.name(), "local");
    }

    #[test]
    fn test_missing_api_key_is_auth_failure() {
        let provider = BackendProvider::OpenAi {
            base_url: "https://api.example.com/v1".into(),
            model: "m".into(),
            api_key_env: Some("GATEWAY_TEST_KEY_THAT_IS_NOT_SET".into()),
        };
        let err = build_backend("cloud", &provider).err().unwrap();
        assert_eq!(err.kind, BackendErrorKind::AuthFailed);
    }
}
