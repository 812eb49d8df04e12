//! Hosted backends speaking the OpenAI-compatible HTTP API.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use super::{GeneratedImage, ImageProvider, LlmProvider, error_body};
use crate::error::ProviderError;

/// Text generation through `POST /v1/chat/completions`.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, base_url: &str, model: &str, api_key: SecretString) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
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

        let body: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    provider: self.name().to_string(),
                    reason: e.to_string(),
                })?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: self.name().to_string(),
                reason: "response contained no message content".to_string(),
            })
    }
}

/// Image generation through `POST /v1/images/generations`.
pub struct OpenAiImageProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

impl OpenAiImageProvider {
    pub fn new(client: reqwest::Client, base_url: &str, model: &str, api_key: SecretString) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
}

fn datum_to_image(datum: ImageDatum) -> Option<GeneratedImage> {
    match (datum.url, datum.b64_json) {
        (Some(url), _) => Some(GeneratedImage::Url { url }),
        (None, Some(data)) => Some(GeneratedImage::Base64 {
            mime_type: "image/png".to_string(),
            data,
        }),
        (None, None) => None,
    }
}

#[async_trait]
impl ImageProvider for OpenAiImageProvider {
    fn name(&self) -> &str {
        "openai-images"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<GeneratedImage, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/images/generations", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "n": 1,
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

        let body: ImagesResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    provider: self.name().to_string(),
                    reason: e.to_string(),
                })?;

        body.data
            .into_iter()
            .next()
            .and_then(datum_to_image)
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: self.name().to_string(),
                reason: "response contained no image".to_string(),
            })
    }
}
