//! LLM client for decomposition.
//!
//! The trait is object-safe so the decomposer can hold `Arc<dyn
//! LlmClient>`; tests substitute canned implementations. The production
//! implementation speaks a messages-style HTTP API.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// A completion backend: system prompt plus user prompt in, text out.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Configuration for [`HttpLlmClient`].
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub model: String,
    pub max_tokens: u32,
    /// Transport-level timeout; the decomposer applies its own wall-clock
    /// budget on top.
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com/v1/messages".to_owned(),
            api_key_env: "ANTHROPIC_API_KEY".to_owned(),
            model: "claude-3-5-haiku-latest".to_owned(),
            max_tokens: 4096,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Messages-API client over HTTP.
pub struct HttpLlmClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl HttpLlmClient {
    /// Build a client from configuration, reading the API key from the
    /// configured environment variable.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("environment variable {} not set", config.api_key_env))?;

        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": [{ "role": "user", "content": user }],
        });

        let response = self
            .http
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("LLM request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("LLM returned {status}: {text}");
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("failed to parse LLM response")?;

        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();

        if text.is_empty() {
            bail!("LLM response contained no text content");
        }

        Ok(text)
    }
}
