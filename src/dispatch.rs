//! Dispatch core
//!
//! Turns an admitted request into one upstream call: external provider
//! first when enabled (with silent fallback), otherwise agent routing plus
//! balancer selection, with a small alternate-candidate retry budget.
//! Outcome statistics flow back into the registry from here and nowhere
//! else.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::agent_router::AgentRouter;
use crate::audit_logging::AuditLogger;
use crate::backend::{BackendError, ChatBackend, ChatRequest, ChatResponse};
use crate::balancer::{RoutingDecision, SmartBalancer};
use crate::metrics;
use crate::provider::{ExternalProvider, ProviderError};
use crate::registry::WorkerRegistry;
use crate::types::{AgentKind, ChatMessage, GatewayError};
use crate::utils::estimate_prompt_tokens;

/// Completion budget assumed when the client did not cap `max_tokens`.
const DEFAULT_COMPLETION_BUDGET: u32 = 256;

/// Retry-after hinted to clients when the balancer has no viable target.
const BACKPRESSURE_RETRY_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedBy {
    External,
    Local,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub response: ChatResponse,
    pub model_used: String,
    pub served_by: ServedBy,
}

pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    balancer: SmartBalancer,
    router: AgentRouter,
    backends: Arc<HashMap<String, Arc<dyn ChatBackend>>>,
    provider: ExternalProvider,
    audit: AuditLogger,
    default_timeout: Duration,
    retry_budget: u32,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        balancer: SmartBalancer,
        router: AgentRouter,
        backends: Arc<HashMap<String, Arc<dyn ChatBackend>>>,
        provider: ExternalProvider,
        audit: AuditLogger,
        default_timeout: Duration,
        retry_budget: u32,
    ) -> Self {
        Self {
            registry,
            balancer,
            router,
            backends,
            provider,
            audit,
            default_timeout,
            retry_budget,
        }
    }

    pub fn backends(&self) -> Arc<HashMap<String, Arc<dyn ChatBackend>>> {
        Arc::clone(&self.backends)
    }

    /// Context requirement for a request: estimated prompt plus the
    /// completion budget.
    pub fn min_context_tokens(messages: &[ChatMessage], max_tokens: Option<u32>) -> u32 {
        estimate_prompt_tokens(messages) + max_tokens.unwrap_or(DEFAULT_COMPLETION_BUDGET)
    }

    /// One routing decision for an agent kind, excluding nothing.
    pub fn route(
        &self,
        agent_kind: AgentKind,
        min_context_tokens: u32,
    ) -> Result<RoutingDecision, GatewayError> {
        self.route_excluding(agent_kind, min_context_tokens, &HashSet::new())
    }

    fn route_excluding(
        &self,
        agent_kind: AgentKind,
        min_context_tokens: u32,
        excluded: &HashSet<String>,
    ) -> Result<RoutingDecision, GatewayError> {
        let candidates: Vec<String> = self
            .router
            .candidates(agent_kind)
            .into_iter()
            .filter(|name| !excluded.contains(name))
            .collect();

        self.balancer
            .decide(&candidates, min_context_tokens)
            .map_err(|no_target| {
                debug!(agent_kind = %agent_kind, reason = %no_target.reason, "routing found no target");
                GatewayError::BackpressureRetry {
                    retry_after_secs: BACKPRESSURE_RETRY_SECS,
                }
            })
    }

    /// Synchronous chat path: provider first when enabled, local dispatch
    /// otherwise or on any non-`Disabled` provider failure. The provider
    /// failure itself is never surfaced.
    pub async fn chat(
        &self,
        agent_kind: AgentKind,
        messages: &[ChatMessage],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        deadline: Option<Instant>,
        request_id: &str,
    ) -> Result<DispatchOutcome, GatewayError> {
        if self.provider.enabled() {
            match self.provider.complete(messages, temperature, max_tokens).await {
                Ok(response) => {
                    return Ok(DispatchOutcome {
                        model_used: response.model.clone(),
                        response,
                        served_by: ServedBy::External,
                    });
                }
                Err(ProviderError::Disabled) => {}
                Err(err) => {
                    info!(
                        request_id,
                        kind = err.kind(),
                        "external provider failed, falling back to local dispatch"
                    );
                    metrics::record_external_fallback();
                    let _ = self.audit.log_external_failure(request_id, err.kind());
                }
            }
        }

        let (response, model_used) = self
            .dispatch_local(
                agent_kind,
                messages,
                temperature,
                max_tokens,
                deadline,
                request_id,
                None,
            )
            .await?;

        Ok(DispatchOutcome {
            response,
            model_used,
            served_by: ServedBy::Local,
        })
    }

    /// Local dispatch with the alternate-candidate retry budget.
    ///
    /// `initial` carries a pre-made decision (the batch path makes one per
    /// batch); on upstream failure the next-ranked candidate is chosen with
    /// the failed ones excluded, up to `retry_budget` extra attempts.
    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch_local(
        &self,
        agent_kind: AgentKind,
        messages: &[ChatMessage],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        deadline: Option<Instant>,
        request_id: &str,
        initial: Option<RoutingDecision>,
    ) -> Result<(ChatResponse, String), GatewayError> {
        let min_context = Self::min_context_tokens(messages, max_tokens);
        let mut excluded: HashSet<String> = HashSet::new();

        let mut decision = match initial {
            Some(decision) => decision,
            None => self.route_excluding(agent_kind, min_context, &excluded)?,
        };

        let mut last_error = GatewayError::UpstreamUnavailable;
        let max_attempts = self.retry_budget + 1;

        for attempt in 0..max_attempts {
            let model_name = decision.model.logical_name.clone();
            debug!(
                request_id,
                model = %model_name,
                attempt,
                rationale = %decision.rationale,
                "dispatching"
            );

            match self
                .attempt(&model_name, messages, temperature, max_tokens, deadline)
                .await
            {
                Ok(mut response) => {
                    response.model = model_name.clone();
                    response.ensure_usage(messages);
                    return Ok((response, model_name));
                }
                Err(AttemptError::Terminal(err)) => return Err(err),
                Err(AttemptError::Retryable(err)) => {
                    warn!(
                        request_id,
                        model = %model_name,
                        error = %err,
                        "upstream attempt failed"
                    );
                    last_error = err;
                    excluded.insert(model_name);
                }
            }

            if attempt + 1 < max_attempts {
                match self.route_excluding(agent_kind, min_context, &excluded) {
                    Ok(next) => decision = next,
                    // Nothing left to try; surface the upstream failure,
                    // not backpressure.
                    Err(_) => break,
                }
            }
        }

        Err(last_error)
    }

    /// One upstream call with inflight and outcome accounting.
    async fn attempt(
        &self,
        model_name: &str,
        messages: &[ChatMessage],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        deadline: Option<Instant>,
    ) -> Result<ChatResponse, AttemptError> {
        let timeout = match remaining_budget(deadline, self.default_timeout) {
            Some(timeout) => timeout,
            None => return Err(AttemptError::Retryable(GatewayError::UpstreamTimeout)),
        };

        let backend = self.backends.get(model_name).cloned().ok_or_else(|| {
            AttemptError::Terminal(GatewayError::InternalInvariantViolation(format!(
                "no backend wired for model {model_name}"
            )))
        })?;

        let request = ChatRequest {
            model: model_name.to_string(),
            messages: messages.to_vec(),
            temperature,
            max_tokens,
        };

        self.registry.mark_inflight(model_name, 1);
        let started = Instant::now();
        let result = backend.chat(&request, timeout).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.registry.mark_inflight(model_name, -1);

        match result {
            Ok(response) => {
                if response.choices.is_empty() {
                    self.registry.record_outcome(model_name, false, latency_ms);
                    metrics::record_dispatch(model_name, false, latency_ms / 1000.0);
                    return Err(AttemptError::Terminal(GatewayError::UpstreamBadResponse(
                        "response carried no choices".to_string(),
                    )));
                }
                self.registry.record_outcome(model_name, true, latency_ms);
                metrics::record_dispatch(model_name, true, latency_ms / 1000.0);
                Ok(response)
            }
            Err(err) => {
                self.registry.record_outcome(model_name, false, latency_ms);
                metrics::record_dispatch(model_name, false, latency_ms / 1000.0);
                Err(classify_backend_error(err))
            }
        }
    }
}

enum AttemptError {
    /// Worth trying the next-ranked candidate.
    Retryable(GatewayError),
    /// Retrying the same payload cannot succeed.
    Terminal(GatewayError),
}

fn classify_backend_error(err: BackendError) -> AttemptError {
    match err {
        BackendError::Timeout => AttemptError::Retryable(GatewayError::UpstreamTimeout),
        BackendError::Network(_) => AttemptError::Retryable(GatewayError::UpstreamUnavailable),
        BackendError::HttpStatus(status) if status >= 500 => {
            AttemptError::Retryable(GatewayError::UpstreamUnavailable)
        }
        BackendError::HttpStatus(status) => AttemptError::Terminal(
            GatewayError::UpstreamBadResponse(format!("upstream returned HTTP {status}")),
        ),
        BackendError::Decode(msg) => {
            AttemptError::Terminal(GatewayError::UpstreamBadResponse(msg))
        }
        BackendError::Cancelled => AttemptError::Terminal(GatewayError::Cancelled),
    }
}

/// Deadline-aware timeout: `min(deadline - now, default)`. `None` means
/// the deadline already passed.
fn remaining_budget(deadline: Option<Instant>, default_timeout: Duration) -> Option<Duration> {
    match deadline {
        None => Some(default_timeout),
        Some(deadline) => {
            let now = Instant::now();
            if deadline <= now {
                None
            } else {
                Some(default_timeout.min(deadline - now))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExternalProviderSettings, GatewayConfig, WorkerSettings};
    use crate::gpu_probe::{DeviceSample, GpuProbe, StaticDeviceQuery};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    const GIB: u64 = 1024 * 1024 * 1024;

    struct CannedBackend {
        result: Result<ChatResponse, BackendError>,
        calls: AtomicU32,
    }

    impl CannedBackend {
        fn ok(content: &str) -> Arc<Self> {
            Arc::new(Self {
                result: Ok(ChatResponse::assistant("upstream", content)),
                calls: AtomicU32::new(0),
            })
        }

        fn err(err: BackendError) -> Arc<Self> {
            Arc::new(Self {
                result: Err(err),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn worker(name: &str, vram: f64) -> WorkerSettings {
        WorkerSettings {
            logical_name: name.to_string(),
            endpoint_url: format!("http://127.0.0.1/{name}"),
            device_id: 0,
            declared_vram_gb: vram,
            max_context_tokens: 8192,
            preferred_for: vec!["chat".to_string()],
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        registry: Arc<WorkerRegistry>,
        audit_path: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    async fn fixture(
        backends: Vec<(&str, Arc<CannedBackend>)>,
        provider: Option<Arc<CannedBackend>>,
    ) -> Fixture {
        let mut config = GatewayConfig::default();
        config.workers = backends
            .iter()
            .map(|&(name, _)| worker(name, 2.0))
            .collect();

        let registry = Arc::new(WorkerRegistry::from_settings(&config.workers));
        let probe = Arc::new(GpuProbe::new(
            Arc::new(StaticDeviceQuery::new(vec![DeviceSample {
                device_id: 0,
                used_bytes: 2 * GIB,
                total_bytes: 24 * GIB,
                utilization_pct: 20.0,
                temperature_c: 50.0,
                power_w: 150.0,
            }])),
            vec![0],
            Duration::from_millis(10),
        ));
        probe.tick().await;

        let balancer = SmartBalancer::new(Arc::clone(&registry), Arc::clone(&probe), 3.0);
        let router = AgentRouter::from_config(&config, Arc::clone(&registry));

        let mut backend_map: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
        for (name, backend) in backends {
            backend_map.insert(name.to_string(), backend);
        }

        let provider_settings = ExternalProviderSettings {
            enabled: provider.is_some(),
            provider_name: "openai".to_string(),
            base_url: "http://provider.example".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 1000,
        };
        let provider = match provider {
            Some(backend) => ExternalProvider::with_backend(provider_settings, backend),
            None => ExternalProvider::new(provider_settings, reqwest::Client::new()),
        };

        let dir = tempdir().unwrap();
        let audit_path = dir.path().join("audit.log");
        let audit = AuditLogger::new(audit_path.to_str().unwrap(), 30).unwrap();

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            balancer,
            router,
            Arc::new(backend_map),
            provider,
            audit,
            Duration::from_secs(5),
            2,
        );

        Fixture {
            dispatcher,
            registry,
            audit_path,
            _dir: dir,
        }
    }

    fn user_message() -> Vec<ChatMessage> {
        vec![ChatMessage::new("user", "hello")]
    }

    #[tokio::test]
    async fn test_local_dispatch_happy_path() {
        let backend = CannedBackend::ok("hi there");
        let fx = fixture(vec![("m1", backend)], None).await;

        let outcome = fx
            .dispatcher
            .chat(AgentKind::Chat, &user_message(), None, Some(64), None, "req-1")
            .await
            .unwrap();

        assert_eq!(outcome.served_by, ServedBy::Local);
        assert_eq!(outcome.model_used, "m1");
        assert_eq!(outcome.response.model, "m1");
        assert!(outcome.response.usage.unwrap().total_tokens > 0);
        assert_eq!(fx.registry.get("m1").unwrap().inflight_count, 0);
    }

    #[tokio::test]
    async fn test_failover_to_next_candidate() {
        let bad = CannedBackend::err(BackendError::HttpStatus(500));
        let good = CannedBackend::ok("recovered");
        let fx = fixture(
            vec![("a-bad", Arc::clone(&bad)), ("b-good", Arc::clone(&good))],
            None,
        )
        .await;

        let outcome = fx
            .dispatcher
            .chat(AgentKind::Chat, &user_message(), None, Some(64), None, "req-2")
            .await
            .unwrap();

        assert_eq!(outcome.model_used, "b-good");
        assert_eq!(bad.calls(), 1);
        assert_eq!(good.calls(), 1);
        assert_eq!(fx.registry.get("a-bad").unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let bad = CannedBackend::err(BackendError::HttpStatus(503));
        let fx = fixture(vec![("m1", Arc::clone(&bad))], None).await;

        let err = fx
            .dispatcher
            .chat(AgentKind::Chat, &user_message(), None, Some(64), None, "req-3")
            .await
            .unwrap_err();

        assert_eq!(err, GatewayError::UpstreamUnavailable);
        // Single candidate: one attempt, then nothing left to route to.
        assert_eq!(bad.calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_kind_survives_budget() {
        let slow = CannedBackend::err(BackendError::Timeout);
        let fx = fixture(vec![("m1", slow)], None).await;

        let err = fx
            .dispatcher
            .chat(AgentKind::Chat, &user_message(), None, Some(64), None, "req-4")
            .await
            .unwrap_err();

        assert_eq!(err, GatewayError::UpstreamTimeout);
    }

    #[tokio::test]
    async fn test_bad_response_is_terminal() {
        let bad = CannedBackend::err(BackendError::HttpStatus(422));
        let good = CannedBackend::ok("never reached");
        let fx = fixture(
            vec![("a-bad", Arc::clone(&bad)), ("b-good", Arc::clone(&good))],
            None,
        )
        .await;

        let err = fx
            .dispatcher
            .chat(AgentKind::Chat, &user_message(), None, Some(64), None, "req-5")
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UpstreamBadResponse(_)));
        assert_eq!(good.calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_before_dispatch() {
        let backend = CannedBackend::ok("unused");
        let fx = fixture(vec![("m1", Arc::clone(&backend))], None).await;

        let err = fx
            .dispatcher
            .chat(
                AgentKind::Chat,
                &user_message(),
                None,
                Some(64),
                Some(Instant::now() - Duration::from_secs(1)),
                "req-6",
            )
            .await
            .unwrap_err();

        assert_eq!(err, GatewayError::UpstreamTimeout);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_external_provider_serves_when_healthy() {
        let local = CannedBackend::ok("local");
        let remote = CannedBackend::ok("remote");
        let fx = fixture(vec![("m1", Arc::clone(&local))], Some(remote)).await;

        let outcome = fx
            .dispatcher
            .chat(AgentKind::Chat, &user_message(), None, Some(64), None, "req-7")
            .await
            .unwrap();

        assert_eq!(outcome.served_by, ServedBy::External);
        assert_eq!(outcome.model_used, "openai:gpt-4o-mini");
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn test_external_failure_falls_back_silently() {
        let local = CannedBackend::ok("local answer");
        let remote = CannedBackend::err(BackendError::HttpStatus(500));
        let fx = fixture(vec![("m1", Arc::clone(&local))], Some(remote)).await;

        let outcome = fx
            .dispatcher
            .chat(AgentKind::Chat, &user_message(), None, Some(64), None, "req-8")
            .await
            .unwrap();

        assert_eq!(outcome.served_by, ServedBy::Local);
        assert_eq!(outcome.model_used, "m1");

        let audit = std::fs::read_to_string(&fx.audit_path).unwrap();
        let failures: Vec<&str> = audit
            .lines()
            .filter(|line| line.contains("external_failure"))
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("req-8"));
    }
}
