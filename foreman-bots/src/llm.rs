//! Language-model access.
//!
//! Agents only see the [`ModelService`] trait: one call taking a model id,
//! a system context and a user prompt, returning text. [`LlmClient`] is the
//! production implementation against the Claude Messages API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmSettings;

/// A request/response text completion service. Calls may fail for any
/// reason; callers wrap them in a [`crate::retry::RetryPolicy`].
#[async_trait]
pub trait ModelService: Send + Sync {
    async fn complete(&self, model: &str, system: &str, prompt: &str) -> Result<String>;
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Response from the Messages API.
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl ApiResponse {
    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Claude API client.
pub struct LlmClient {
    api_key: String,
    endpoint: String,
    max_tokens: u32,
    temperature: f32,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String) -> Self {
        let defaults = LlmSettings::default();
        Self {
            api_key,
            endpoint: defaults.endpoint,
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_settings(api_key: String, settings: &LlmSettings) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            ..Self::new(api_key)
        }
    }

    /// Send a conversation and get the raw response.
    pub async fn chat(
        &self,
        model: &str,
        system: &str,
        messages: &[ChatMessage],
    ) -> Result<ApiResponse> {
        let body = serde_json::json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "system": system,
            "messages": messages,
        });

        let resp = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to call Claude API")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Claude API error {status}: {body}");
        }

        resp.json::<ApiResponse>()
            .await
            .context("Failed to parse Claude response")
    }
}

#[async_trait]
impl ModelService for LlmClient {
    async fn complete(&self, model: &str, system: &str, prompt: &str) -> Result<String> {
        let messages = [ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        }];
        let resp = self.chat(model, system, &messages).await?;
        Ok(resp.text())
    }
}
