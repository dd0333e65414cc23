use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::transcript::{Role, Turn};

/// Substituted for the reply when the fallback request fails
pub const APOLOGY: &str =
    "I apologize, but I'm having trouble connecting to our systems right now.";

/// Single-shot request/response used while speech mode is off
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send the full conversation and wait for one reply
    async fn complete(&self, turns: &[Turn]) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Chat completions over HTTP
pub struct ChatCompletions {
    client: reqwest::Client,
    config: ChatCompletionsConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletions {
    pub fn new(config: ChatCompletionsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ChatBackend for ChatCompletions {
    async fn complete(&self, turns: &[Turn]) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: turns
                .iter()
                .map(|t| ChatMessage {
                    role: t.role,
                    content: &t.content,
                })
                .collect(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        info!(
            "Requesting chat completion ({} turns, model {})",
            turns.len(),
            self.config.model
        );

        let response: ChatResponse = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send chat completion request")?
            .error_for_status()
            .context("Chat completion request rejected")?
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .context("Chat completion returned no content")
    }
}
