//! Runtime composition root
//!
//! Builds every long-lived component from configuration, wires them
//! together, and runs the background services (GPU probe, registry health
//! probe, queue workers, result sweeper, HTTP server) as named cancellable
//! tasks under one root token.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admission::AdmissionControl;
use crate::agent_router::AgentRouter;
use crate::audit_logging::AuditLogger;
use crate::backend::{ChatBackend, HttpBackend};
use crate::balancer::SmartBalancer;
use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::gpu_probe::{DeviceQuery, GpuProbe, NvidiaSmiQuery};
use crate::http::{self, AppState};
use crate::provider::ExternalProvider;
use crate::queue::TaskQueue;
use crate::registry::WorkerRegistry;

pub type ServiceSpawner =
    Arc<dyn Fn(CancellationToken) -> JoinHandle<Result<()>> + Send + Sync + 'static>;

pub struct ServiceRegistration {
    name: String,
    spawner: ServiceSpawner,
}

impl ServiceRegistration {
    pub fn new<N: Into<String>>(name: N, spawner: ServiceSpawner) -> Self {
        Self {
            name: name.into(),
            spawner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spawn(&self, token: CancellationToken) -> JoinHandle<Result<()>> {
        (self.spawner)(token)
    }
}

pub struct Gateway {
    config: Arc<GatewayConfig>,
    state: AppState,
    backends: Arc<HashMap<String, Arc<dyn ChatBackend>>>,
    services: Vec<ServiceRegistration>,
}

impl Gateway {
    /// Production wiring: reqwest-backed workers and the nvidia-smi probe.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::new();

        let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
        for worker in &config.workers {
            backends.insert(
                worker.logical_name.clone(),
                Arc::new(HttpBackend::new(
                    client.clone(),
                    &worker.endpoint_url,
                    config.worker_api_key.clone(),
                )),
            );
        }

        let provider = ExternalProvider::new(config.external.clone(), client);
        Self::with_collaborators(config, backends, Arc::new(NvidiaSmiQuery::new()), provider)
    }

    /// Wiring with injected collaborators; used by tests and local setups
    /// without NVIDIA tooling.
    pub fn with_collaborators(
        config: GatewayConfig,
        backends: HashMap<String, Arc<dyn ChatBackend>>,
        device_query: Arc<dyn DeviceQuery>,
        provider: ExternalProvider,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let audit = AuditLogger::new(&config.audit.log_path, config.audit.retention_days)
            .context("failed to open audit log")?;

        let registry = Arc::new(WorkerRegistry::from_settings(&config.workers));
        let devices: Vec<u32> = config.workers.iter().map(|w| w.device_id).collect();
        let probe = Arc::new(GpuProbe::new(
            device_query,
            devices,
            Duration::from_millis(config.probe.interval_ms),
        ));

        let balancer = SmartBalancer::new(
            Arc::clone(&registry),
            Arc::clone(&probe),
            config.probe.safety_reserve_gb,
        );
        let router = AgentRouter::from_config(&config, Arc::clone(&registry));

        let backends = Arc::new(backends);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            balancer,
            router,
            Arc::clone(&backends),
            provider,
            audit.clone(),
            Duration::from_millis(config.default_request_timeout_ms),
            config.dispatch_retry_budget,
        ));

        let queue = Arc::new(TaskQueue::new(config.queue.clone()));
        let admission = Arc::new(AdmissionControl::new(&config, audit.clone()));

        let state = AppState {
            config: Arc::clone(&config),
            dispatcher: Arc::clone(&dispatcher),
            queue: Arc::clone(&queue),
            probe: Arc::clone(&probe),
            registry: Arc::clone(&registry),
            admission,
            audit,
        };

        let mut gateway = Self {
            config,
            state,
            backends,
            services: Vec::new(),
        };
        gateway.register_core_services(dispatcher, queue, probe, registry);
        Ok(gateway)
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn register_service(&mut self, service: ServiceRegistration) {
        self.services.push(service);
    }

    fn register_core_services(
        &mut self,
        dispatcher: Arc<Dispatcher>,
        queue: Arc<TaskQueue>,
        probe: Arc<GpuProbe>,
        registry: Arc<WorkerRegistry>,
    ) {
        {
            let probe = Arc::clone(&probe);
            self.services.push(ServiceRegistration::new(
                "gpu-probe",
                Arc::new(move |token| {
                    let probe = Arc::clone(&probe);
                    tokio::spawn(async move {
                        probe.run(token).await;
                        Ok(())
                    })
                }),
            ));
        }

        {
            let registry = Arc::clone(&registry);
            let backends = Arc::clone(&self.backends);
            let period = Duration::from_secs(self.config.registry.health_interval_s);
            self.services.push(ServiceRegistration::new(
                "registry-health",
                Arc::new(move |token| {
                    let registry = Arc::clone(&registry);
                    let backends = Arc::clone(&backends);
                    tokio::spawn(async move {
                        registry.run_health_probe(backends, period, token).await;
                        Ok(())
                    })
                }),
            ));
        }

        for index in 0..self.config.queue.workers.max(1) {
            let queue = Arc::clone(&queue);
            let dispatcher = Arc::clone(&dispatcher);
            self.services.push(ServiceRegistration::new(
                format!("queue-worker-{index}"),
                Arc::new(move |token| {
                    let queue = Arc::clone(&queue);
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        queue.run_worker(dispatcher, token).await;
                        Ok(())
                    })
                }),
            ));
        }

        {
            let queue = Arc::clone(&queue);
            self.services.push(ServiceRegistration::new(
                "result-sweeper",
                Arc::new(move |token| {
                    let queue = Arc::clone(&queue);
                    tokio::spawn(async move {
                        queue.run_sweeper(token).await;
                        Ok(())
                    })
                }),
            ));
        }
    }

    /// Bind the HTTP listener, spawn every registered service, and hand
    /// back the running gateway.
    pub async fn start(self) -> Result<GatewayRuntime> {
        let root_token = CancellationToken::new();
        let mut tasks = Vec::new();

        for service in &self.services {
            let handle = service.spawn(root_token.child_token());
            tasks.push((service.name().to_string(), handle));
        }

        let bind_addr: SocketAddr = format!("{}:{}", self.config.server.bind, self.config.server.port)
            .parse()
            .context("invalid server bind address")?;
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .context("failed to bind HTTP listener")?;
        let local_addr = listener.local_addr()?;

        let app = http::router(self.state.clone())
            .into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = root_token.child_token();
        let http_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                    info!("shutting down http server");
                })
                .await?;
            Ok(())
        });
        tasks.push(("http-server".to_string(), http_handle));

        info!(addr = %local_addr, "gateway boot completed");

        Ok(GatewayRuntime {
            state: self.state,
            local_addr,
            cancel_token: root_token,
            tasks,
        })
    }
}

pub struct GatewayRuntime {
    state: AppState,
    local_addr: SocketAddr,
    cancel_token: CancellationToken,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
}

impl GatewayRuntime {
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) -> Result<()> {
        self.cancel_token.cancel();

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(Ok(())) => info!(service = %name, "service shutdown cleanly"),
                Ok(Err(err)) => return Err(err),
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}

/// Install the global tracing subscriber from configuration. Safe to call
/// more than once; later calls are no-ops.
pub fn initialize_logging(config: &GatewayConfig) {
    let filter = &config.observability.log_level;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter.as_str())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, ChatRequest, ChatResponse};
    use crate::config::WorkerSettings;
    use crate::gpu_probe::{DeviceSample, StaticDeviceQuery};
    use async_trait::async_trait;

    struct EchoBackend;

    #[async_trait]
    impl ChatBackend for EchoBackend {
        async fn health(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn chat(
            &self,
            request: &ChatRequest,
            _timeout: Duration,
        ) -> Result<ChatResponse, BackendError> {
            let content = request
                .messages
                .first()
                .map(|m| m.content.as_str())
                .unwrap_or("");
            Ok(ChatResponse::assistant(&request.model, content))
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = 0;
        config.audit.log_path = dir
            .path()
            .join("audit.log")
            .to_str()
            .unwrap()
            .to_string();
        config.workers = vec![WorkerSettings {
            logical_name: "m1".to_string(),
            endpoint_url: "http://127.0.0.1:9001".to_string(),
            device_id: 0,
            declared_vram_gb: 2.3,
            max_context_tokens: 8192,
            preferred_for: vec![],
        }];
        config
    }

    #[tokio::test]
    async fn test_boot_serve_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
        backends.insert("m1".to_string(), Arc::new(EchoBackend));

        let query = Arc::new(StaticDeviceQuery::new(vec![DeviceSample {
            device_id: 0,
            used_bytes: 2 * 1024 * 1024 * 1024,
            total_bytes: 24 * 1024 * 1024 * 1024,
            utilization_pct: 10.0,
            temperature_c: 45.0,
            power_w: 120.0,
        }]));
        let provider = ExternalProvider::new(Default::default(), reqwest::Client::new());

        let gateway =
            Gateway::with_collaborators(config, backends, query, provider).unwrap();
        let runtime = gateway.start().await.unwrap();
        let base = format!("http://{}", runtime.local_addr());

        let client = reqwest::Client::new();
        let response = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(response.status(), 200);

        let response = client.get(format!("{base}/models")).send().await.unwrap();
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["data"][0]["logical_name"], "m1");

        runtime.shutdown().await.unwrap();
    }
}
