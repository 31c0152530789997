//! Anthropic Messages API generator (non-streaming)

use crate::provider::{GenerateError, GenerateResult, Generator};
use playbook_core::config::LlmConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicGenerator {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicGenerator {
    pub fn new(api_key: impl Into<String>, config: &LlmConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    /// Build from config, reading the key from `config.api_key_env`.
    /// Returns None when the provider is disabled or the key is missing.
    pub fn from_config(config: &LlmConfig) -> Option<Self> {
        if config.provider != "anthropic" {
            return None;
        }
        let key = std::env::var(&config.api_key_env).ok()?;
        Some(Self::new(key, config))
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<RequestMessage<'a>>,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[async_trait::async_trait]
impl Generator for AnthropicGenerator {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, prompt: &str) -> GenerateResult<String> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![RequestMessage { role: "user", content: prompt }],
        };

        debug!("Anthropic request: model={} prompt_chars={}", self.model, prompt.len());

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Anthropic error {}: {}", status, error_text);
            return Err(match status.as_u16() {
                401 => GenerateError::AuthFailed(error_text),
                429 => GenerateError::RateLimited { retry_after_ms: 60_000 },
                _ => GenerateError::RequestFailed(format!("{}: {}", status, error_text)),
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| GenerateError::InvalidResponse(e.to_string()))?;
        let text: String = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            return Err(GenerateError::InvalidResponse("no text blocks in response".into()));
        }
        Ok(text)
    }
}
