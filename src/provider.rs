//! External provider client
//!
//! Optional OpenAI-compatible remote endpoint tried before local dispatch.
//! No retries live here; the failover policy sits at the call site, and a
//! `Disabled` result means "skip, and do not count this as a failure".

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendError, ChatBackend, ChatRequest, ChatResponse, HttpBackend};
use crate::config::ExternalProviderSettings;
use crate::types::ChatMessage;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("external provider is disabled")]
    Disabled,

    #[error("provider network error: {0}")]
    Network(String),

    #[error("provider returned HTTP {0}")]
    HttpStatus(u16),

    #[error("provider response could not be decoded: {0}")]
    Decode(String),

    #[error("provider request timed out")]
    Timeout,

    #[error("provider request was cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Disabled => "disabled",
            ProviderError::Network(_) => "network",
            ProviderError::HttpStatus(_) => "http_status",
            ProviderError::Decode(_) => "decode",
            ProviderError::Timeout => "timeout",
            ProviderError::Cancelled => "cancelled",
        }
    }
}

impl From<BackendError> for ProviderError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Network(msg) => ProviderError::Network(msg),
            BackendError::HttpStatus(code) => ProviderError::HttpStatus(code),
            BackendError::Decode(msg) => ProviderError::Decode(msg),
            BackendError::Timeout => ProviderError::Timeout,
            BackendError::Cancelled => ProviderError::Cancelled,
        }
    }
}

pub struct ExternalProvider {
    settings: ExternalProviderSettings,
    backend: Option<Arc<dyn ChatBackend>>,
    timeout: Duration,
}

impl ExternalProvider {
    pub fn new(settings: ExternalProviderSettings, client: reqwest::Client) -> Self {
        let backend: Option<Arc<dyn ChatBackend>> = if settings.enabled {
            Some(Arc::new(HttpBackend::new(
                client,
                &settings.base_url,
                Some(settings.api_key.clone()),
            )))
        } else {
            None
        };
        let timeout = Duration::from_millis(settings.timeout_ms);

        Self {
            settings,
            backend,
            timeout,
        }
    }

    /// Same wiring with an injected backend; used by tests.
    pub fn with_backend(settings: ExternalProviderSettings, backend: Arc<dyn ChatBackend>) -> Self {
        let timeout = Duration::from_millis(settings.timeout_ms);
        Self {
            settings,
            backend: Some(backend),
            timeout,
        }
    }

    pub fn enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Model name reported to clients when a response was served remotely.
    pub fn reported_model(&self) -> String {
        format!("{}:{}", self.settings.provider_name, self.settings.model)
    }

    /// One attempt against the remote endpoint.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<ChatResponse, ProviderError> {
        let backend = self.backend.as_ref().ok_or(ProviderError::Disabled)?;

        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages: messages.to_vec(),
            temperature,
            max_tokens,
        };

        let mut response = backend.chat(&request, self.timeout).await?;
        if response.choices.is_empty() {
            return Err(ProviderError::Decode("response carried no choices".to_string()));
        }

        response.model = self.reported_model();
        response.ensure_usage(messages);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn settings(enabled: bool) -> ExternalProviderSettings {
        ExternalProviderSettings {
            enabled,
            provider_name: "openai".to_string(),
            base_url: "http://provider.example".to_string(),
            api_key: "key".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 1000,
        }
    }

    struct CannedBackend {
        result: Result<ChatResponse, BackendError>,
    }

    #[async_trait]
    impl ChatBackend for CannedBackend {
        async fn health(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn chat(
            &self,
            _request: &ChatRequest,
            _timeout: Duration,
        ) -> Result<ChatResponse, BackendError> {
            self.result.clone()
        }
    }

    #[tokio::test]
    async fn test_disabled_provider_signals_skip() {
        let provider = ExternalProvider::new(settings(false), reqwest::Client::new());
        assert!(!provider.enabled());

        let err = provider
            .complete(&[ChatMessage::new("user", "hi")], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Disabled));
    }

    #[tokio::test]
    async fn test_success_reports_namespaced_model() {
        let backend = Arc::new(CannedBackend {
            result: Ok(ChatResponse::assistant("gpt-4o-mini", "hello")),
        });
        let provider = ExternalProvider::with_backend(settings(true), backend);

        let response = provider
            .complete(&[ChatMessage::new("user", "hi")], Some(0.2), Some(64))
            .await
            .unwrap();
        assert_eq!(response.model, "openai:gpt-4o-mini");
        assert!(response.usage.unwrap().total_tokens > 0);
    }

    #[tokio::test]
    async fn test_http_failure_maps_to_status_kind() {
        let backend = Arc::new(CannedBackend {
            result: Err(BackendError::HttpStatus(500)),
        });
        let provider = ExternalProvider::with_backend(settings(true), backend);

        let err = provider
            .complete(&[ChatMessage::new("user", "hi")], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::HttpStatus(500)));
        assert_eq!(err.kind(), "http_status");
    }
}
