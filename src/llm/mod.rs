//! Generation backends used by dispatch.
//!
//! Two capability contracts:
//! - [`LlmProvider`]: prompt in, text out
//! - [`ImageProvider`]: prompt in, image (URL or inline data) out
//!
//! Each has a `local` and a `remote` variant, chosen once when the config is
//! built by [`create_llm_provider`] / [`create_image_provider`].

mod local;
mod remote;

pub use local::{LocalImageProvider, OllamaProvider};
pub use remote::{OpenAiImageProvider, OpenAiProvider};

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Text generation capability.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name used in logs and errors (e.g. `ollama`).
    fn name(&self) -> &str;
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Image generation capability.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<GeneratedImage, ProviderError>;
}

/// Output of an image provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratedImage {
    Url { url: String },
    Base64 { mime_type: String, data: String },
}

impl GeneratedImage {
    /// String stored as the job result: the URL, or a `data:` URI.
    pub fn into_result(self) -> String {
        match self {
            Self::Url { url } => url,
            Self::Base64 { mime_type, data } => format!("data:{mime_type};base64,{data}"),
        }
    }
}

/// Where a provider runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderBackend {
    /// Self-hosted server on the local network.
    Local,
    /// Hosted API reached with an API key.
    Remote,
}

impl std::fmt::Display for ProviderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for ProviderBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown backend '{other}', expected local or remote")),
        }
    }
}

/// Configuration for creating an LLM provider.
///
/// The API key is never serialized; it only travels in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub backend: ProviderBackend,
    pub base_url: String,
    pub model: String,
    #[serde(skip)]
    pub api_key: Option<secrecy::SecretString>,
    pub request_timeout: Duration,
}

/// Configuration for creating an image provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub backend: ProviderBackend,
    pub base_url: String,
    pub model: String,
    #[serde(skip)]
    pub api_key: Option<secrecy::SecretString>,
    /// Delay between status polls of a queued local image job.
    pub poll_interval: Duration,
    /// Bound on a whole image job.
    pub job_timeout: Duration,
}

/// Create an LLM provider from configuration.
pub fn create_llm_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    let client = http_client(config.request_timeout, "llm")?;
    match config.backend {
        ProviderBackend::Local => {
            tracing::info!("Using local LLM (model: {})", config.model);
            Ok(Arc::new(OllamaProvider::new(
                client,
                &config.base_url,
                &config.model,
            )))
        }
        ProviderBackend::Remote => {
            let api_key = config
                .api_key
                .clone()
                .ok_or_else(|| ProviderError::NotConfigured {
                    provider: "openai".to_string(),
                    reason: "AULE_LLM_API_KEY is required for the remote backend".to_string(),
                })?;
            tracing::info!("Using remote LLM (model: {})", config.model);
            Ok(Arc::new(OpenAiProvider::new(
                client,
                &config.base_url,
                &config.model,
                api_key,
            )))
        }
    }
}

/// Create an image provider from configuration.
pub fn create_image_provider(
    config: &ImageConfig,
) -> Result<Arc<dyn ImageProvider>, ProviderError> {
    match config.backend {
        ProviderBackend::Local => {
            // Individual requests are short; the whole job is bounded by job_timeout.
            let client = http_client(Duration::from_secs(30), "image")?;
            tracing::info!("Using local image backend (model: {})", config.model);
            Ok(Arc::new(LocalImageProvider::new(
                client,
                &config.base_url,
                &config.model,
                config.poll_interval,
                config.job_timeout,
            )))
        }
        ProviderBackend::Remote => {
            let client = http_client(config.job_timeout, "image")?;
            let api_key = config
                .api_key
                .clone()
                .ok_or_else(|| ProviderError::NotConfigured {
                    provider: "openai-images".to_string(),
                    reason: "AULE_IMAGE_API_KEY is required for the remote backend".to_string(),
                })?;
            tracing::info!("Using remote image backend (model: {})", config.model);
            Ok(Arc::new(OpenAiImageProvider::new(
                client,
                &config.base_url,
                &config.model,
                api_key,
            )))
        }
    }
}

fn http_client(timeout: Duration, kind: &str) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::RequestFailed {
            provider: kind.to_string(),
            reason: format!("Failed to build HTTP client: {e}"),
        })
}

/// Read a failed response body for the error message. Body read failures are ignored.
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(300).collect();
    format!("HTTP {status}: {body}")
}
