//! Self-hosted backends: an Ollama-style text server and a queue-and-poll
//! image server.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Instant;

use super::{GeneratedImage, ImageProvider, LlmProvider, error_body};
use crate::error::ProviderError;

/// Text generation through `POST /api/generate`.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(client: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
            }))
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                provider: self.name().to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ProviderError::RequestFailed {
                provider: self.name().to_string(),
                reason: error_body(response).await,
            });
        }

        let body: GenerateResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    provider: self.name().to_string(),
                    reason: e.to_string(),
                })?;
        Ok(body.response)
    }
}

/// Image generation against a server that queues jobs: `POST /prompt`
/// returns a `prompt_id`, then `GET /history/{prompt_id}` is polled until
/// the outputs appear.
pub struct LocalImageProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    poll_interval: Duration,
    job_timeout: Duration,
}

impl LocalImageProvider {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        model: &str,
        poll_interval: Duration,
        job_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            poll_interval,
            job_timeout,
        }
    }

    fn request_failed(&self, reason: impl Into<String>) -> ProviderError {
        ProviderError::RequestFailed {
            provider: self.name().to_string(),
            reason: reason.into(),
        }
    }

    async fn queue(&self, prompt: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/prompt", self.base_url))
            .json(&json!({ "prompt": prompt, "model": self.model }))
            .send()
            .await
            .map_err(|e| self.request_failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(self.request_failed(error_body(response).await));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                provider: self.name().to_string(),
                reason: e.to_string(),
            })?;
        body.get("prompt_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: self.name().to_string(),
                reason: "missing prompt_id".to_string(),
            })
    }

    /// One poll. `Ok(None)` means the job is still running.
    async fn poll(&self, prompt_id: &str) -> Result<Option<GeneratedImage>, ProviderError> {
        let response = self
            .client
            .get(format!("{}/history/{prompt_id}", self.base_url))
            .send()
            .await
            .map_err(|e| self.request_failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(self.request_failed(error_body(response).await));
        }
        let history: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                provider: self.name().to_string(),
                reason: e.to_string(),
            })?;
        Ok(first_output_image(&history, prompt_id)
            .map(|image| GeneratedImage::Url {
                url: self.view_url(&image),
            }))
    }

    fn view_url(&self, image: &OutputImage) -> String {
        let base = format!("{}/view", self.base_url);
        reqwest::Url::parse_with_params(
            &base,
            &[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ],
        )
        .map(|url| url.to_string())
        .unwrap_or(base)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct OutputImage {
    filename: String,
    subfolder: String,
    kind: String,
}

/// Find the first image in a `/history/{id}` payload.
fn first_output_image(history: &Value, prompt_id: &str) -> Option<OutputImage> {
    let outputs = history.get(prompt_id)?.get("outputs")?.as_object()?;
    outputs.values().find_map(|node| {
        let image = node.get("images")?.as_array()?.first()?;
        Some(OutputImage {
            filename: image.get("filename")?.as_str()?.to_string(),
            subfolder: image
                .get("subfolder")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            kind: image
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("output")
                .to_string(),
        })
    })
}

#[async_trait]
impl ImageProvider for LocalImageProvider {
    fn name(&self) -> &str {
        "local-image"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<GeneratedImage, ProviderError> {
        let prompt_id = self.queue(prompt).await?;
        let deadline = Instant::now() + self.job_timeout;
        tracing::debug!(prompt_id = %prompt_id, "Image job queued");

        loop {
            if let Some(image) = self.poll(&prompt_id).await? {
                return Ok(image);
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(ProviderError::Timeout {
                    provider: self.name().to_string(),
                    timeout: self.job_timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
