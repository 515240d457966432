//! Admission control
//!
//! Policy stages applied before a request reaches the routing core:
//! request-id attachment, agent-kind validation, per-agent max-token
//! clamping, sliding-window rate limiting, and the audit ticket carried
//! through to dispatch.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;

use crate::audit_logging::{message_digest, AuditLogger};
use crate::config::GatewayConfig;
use crate::metrics;
use crate::rate_limiting::RateLimiter;
use crate::types::{AgentKind, ChatMessage, GatewayError};
use crate::utils::generate_id;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id attached by the middleware, readable from extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Attach a generated request id when the client did not send one, and
/// echo it on the response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(generate_id);

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Everything admission learned about an accepted request.
#[derive(Debug, Clone)]
pub struct AdmissionTicket {
    pub request_id: String,
    pub client: String,
    pub agent_kind: AgentKind,
    pub message_digest: String,
    /// Requested max_tokens clamped to the agent's ceiling.
    pub max_tokens: Option<u32>,
}

pub struct AdmissionControl {
    limiter: RateLimiter,
    per_agent_max_tokens: HashMap<AgentKind, u32>,
    audit: AuditLogger,
}

impl AdmissionControl {
    pub fn new(config: &GatewayConfig, audit: AuditLogger) -> Self {
        let per_agent_max_tokens = config
            .per_agent_max_tokens
            .iter()
            .filter_map(|(kind, ceiling)| {
                kind.parse::<AgentKind>().ok().map(|kind| (kind, *ceiling))
            })
            .collect();

        Self {
            limiter: RateLimiter::from_settings(&config.rate_limit),
            per_agent_max_tokens,
            audit,
        }
    }

    /// Run stages 2-5 for one request. Rejections are audited here;
    /// accepted requests get their dispatch record written downstream
    /// once the model is known.
    pub fn admit(
        &self,
        request_id: &str,
        client: &str,
        agent_kind: Option<&str>,
        messages: &[ChatMessage],
        requested_max_tokens: Option<u32>,
    ) -> Result<AdmissionTicket, GatewayError> {
        let raw_kind = agent_kind.unwrap_or(AgentKind::Chat.as_str());
        let kind = match raw_kind.parse::<AgentKind>() {
            Ok(kind) => kind,
            Err(err) => {
                let _ = self.audit.log_rejection(
                    request_id,
                    Some(client.to_string()),
                    Some(raw_kind.to_string()),
                    err.kind(),
                );
                return Err(err);
            }
        };

        // Ceiling clamps; it never rejects. An absent request inherits the
        // ceiling as its cap.
        let ceiling = self.per_agent_max_tokens.get(&kind).copied();
        let max_tokens = match (requested_max_tokens, ceiling) {
            (Some(requested), Some(ceiling)) => Some(requested.min(ceiling)),
            (Some(requested), None) => Some(requested),
            (None, ceiling) => ceiling,
        };

        if let Err(err) = self.limiter.check(client, kind) {
            metrics::record_rate_limited();
            let rejection = GatewayError::RateLimited {
                retry_after_secs: err.retry_after.as_secs().max(1),
            };
            let _ = self.audit.log_rejection(
                request_id,
                Some(client.to_string()),
                Some(kind.as_str().to_string()),
                rejection.kind(),
            );
            return Err(rejection);
        }

        Ok(AdmissionTicket {
            request_id: request_id.to_string(),
            client: client.to_string(),
            agent_kind: kind,
            message_digest: message_digest(messages),
            max_tokens,
        })
    }

    pub fn prune_rate_buckets(&self) {
        self.limiter.prune();
    }
}
