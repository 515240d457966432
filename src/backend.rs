//! OpenAI-compatible backend endpoints.
//!
//! A backend is anything exposing the chat-completion surface over HTTP:
//! a local worker process or the external provider. Both satisfy the same
//! small capability set, `{health, chat}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::ChatMessage;
use crate::utils::{estimate_prompt_tokens, estimate_tokens, timestamp_now};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Response shape mirroring the OpenAI chat completion object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    #[serde(default = "default_object")]
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

fn default_object() -> String {
    "chat.completion".to_string()
}

impl ChatResponse {
    /// Build a well-formed completion from a single assistant message.
    pub fn assistant(model: &str, content: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", crate::utils::generate_id()),
            object: default_object(),
            created: timestamp_now(),
            model: model.to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::new("assistant", content),
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
        }
    }

    /// Fill in estimated usage when the upstream omitted it.
    pub fn ensure_usage(&mut self, prompt: &[ChatMessage]) {
        if self.usage.is_none() {
            let completion = self
                .choices
                .first()
                .map(|choice| choice.message.content.as_str())
                .unwrap_or("");
            self.usage = Some(estimate_usage(prompt, completion));
        }
    }
}

/// Rough usage accounting from message text.
pub fn estimate_usage(prompt: &[ChatMessage], completion: &str) -> Usage {
    let prompt_tokens = estimate_prompt_tokens(prompt);
    let completion_tokens = estimate_tokens(completion);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("upstream returned HTTP {0}")]
    HttpStatus(u16),

    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    #[error("request timed out")]
    Timeout,

    #[error("request was cancelled")]
    Cancelled,
}

/// Capability set over an OpenAI-compatible endpoint.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Cheap readiness check; `Ok` means the endpoint answered 200.
    async fn health(&self) -> Result<(), BackendError>;

    /// One chat completion with a hard deadline.
    async fn chat(&self, request: &ChatRequest, timeout: Duration)
        -> Result<ChatResponse, BackendError>;
}

/// reqwest-backed implementation used for workers and the provider alike.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) if !key.is_empty() => request.bearer_auth(key),
            _ => request,
        }
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn health(&self) -> Result<(), BackendError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(map_transport_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::HttpStatus(response.status().as_u16()))
        }
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, BackendError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .authorize(self.client.post(&url))
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::HttpStatus(status.as_u16()));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }
}

fn map_transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Network(err.to_string())
    }
}
