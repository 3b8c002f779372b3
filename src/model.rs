//! Hosted language-model call.
//!
//! The pipeline only depends on the `ModelInvoker` trait: a system
//! instruction and a user message in, one text completion out.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MODEL_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response could not be parsed: {0}")]
    Malformed(String),
    #[error("model response contained no text")]
    Empty,
}

#[async_trait::async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Identifier reported by the diagnostics endpoint.
    fn model_id(&self) -> &str;
    async fn complete(&self, system: &str, user: &str) -> Result<String, ModelError>;
}

#[derive(Clone, Debug)]
pub struct ModelSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub url: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "claude-3-5-haiku-latest".into(),
            url: DEFAULT_MODEL_URL.into(),
            max_tokens: 800,
            temperature: 0.2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Calls the Anthropic Messages API.
pub struct AnthropicInvoker {
    settings: ModelSettings,
    client: reqwest::Client,
}

impl AnthropicInvoker {
    pub fn new(settings: ModelSettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self { settings, client })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[async_trait::async_trait]
impl ModelInvoker for AnthropicInvoker {
    fn model_id(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, ModelError> {
        let body = MessagesRequest {
            model: &self.settings.model,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            system,
            messages: vec![Message {
                role: "user",
                content: user,
            }],
        };
        let mut rb = self
            .client
            .post(&self.settings.url)
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        if let Some(key) = &self.settings.api_key {
            rb = rb.header("x-api-key", key.trim());
        }
        let resp = rb
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| ModelError::Malformed(e.to_string()))?;
        let answer = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if answer.trim().is_empty() {
            return Err(ModelError::Empty);
        }
        Ok(answer)
    }
}
