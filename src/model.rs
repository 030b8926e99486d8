//! Model boundary: one chat completion per call, failures classified as
//! transient or fatal.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// One completion request. `messages` starts with the system message.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub api_key: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub stop: Vec<String>,
    pub max_tokens: u32,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// A failed model call. Only `transient` failures are worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ModelError {
    pub transient: bool,
    pub message: String,
}

impl ModelError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

/// Whether a provider failure is a passing server condition.
///
/// 5xx and 429 statuses are retryable, as is any message naming a server
/// error or an overloaded provider.
pub fn is_retryable(status: Option<u16>, message: &str) -> bool {
    if let Some(code) = status {
        if code == 429 || (500..600).contains(&code) {
            return true;
        }
    }
    let message = message.to_ascii_lowercase();
    message.contains("server error") || message.contains("overloaded")
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiClient {
    api_base: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_base: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

fn request_body(request: &CompletionRequest) -> serde_json::Value {
    serde_json::json!({
        "model": request.model,
        "messages": request.messages,
        "temperature": request.temperature,
        "stop": request.stop,
        "max_tokens": request.max_tokens,
    })
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn parse_completion(body: &str) -> Result<Completion, ModelError> {
    let resp: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ModelError::fatal(format!("malformed completion response: {}", e)))?;
    let text = resp
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    Ok(Completion {
        text,
        usage: resp.usage,
    })
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
        debug!(model = %request.model, messages = request.messages.len(), "sending completion request");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&request.api_key)
            .json(&request_body(request))
            .send()
            .await
            .map_err(|e| ModelError {
                transient: e.is_timeout() || e.is_connect(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| ModelError {
            transient: e.is_timeout(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(ModelError {
                transient: is_retryable(Some(status.as_u16()), &body),
                message: format!("{}: {}", status, body),
            });
        }

        parse_completion(&body)
    }
}
