//! End-to-end gateway tests.
//!
//! Each test boots a full gateway on an ephemeral port with fake worker
//! backends and a scripted device query, then drives it over HTTP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use gateway_core::backend::{BackendError, ChatBackend, ChatRequest, ChatResponse};
use gateway_core::config::{GatewayConfig, WorkerSettings};
use gateway_core::gpu_probe::{DeviceQuery, DeviceSample, StaticDeviceQuery};
use gateway_core::provider::ExternalProvider;
use gateway_core::runtime::{Gateway, GatewayRuntime};

const GIB: u64 = 1024 * 1024 * 1024;

struct CountingBackend {
    calls: AtomicU32,
    fail_with: Option<u16>,
}

impl CountingBackend {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_with: None,
        })
    }

    fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_with: Some(status),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for CountingBackend {
    async fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        _timeout: Duration,
    ) -> Result<ChatResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.fail_with {
            return Err(BackendError::HttpStatus(status));
        }
        let content = request
            .messages
            .first()
            .map(|m| m.content.as_str())
            .unwrap_or("");
        Ok(ChatResponse::assistant(
            &request.model,
            &format!("echo: {content}"),
        ))
    }
}

fn worker(name: &str, device: u32, vram: f64, preferred: &[&str]) -> WorkerSettings {
    WorkerSettings {
        logical_name: name.to_string(),
        endpoint_url: format!("http://127.0.0.1/{name}"),
        device_id: device,
        declared_vram_gb: vram,
        max_context_tokens: 8192,
        preferred_for: preferred.iter().map(|s| s.to_string()).collect(),
    }
}

fn device(device_id: u32, used_gb: u64, total_gb: u64) -> DeviceSample {
    DeviceSample {
        device_id,
        used_bytes: used_gb * GIB,
        total_bytes: total_gb * GIB,
        utilization_pct: 30.0,
        temperature_c: 55.0,
        power_w: 180.0,
    }
}

struct TestGateway {
    runtime: GatewayRuntime,
    base: String,
    audit_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn boot(
    mut config: GatewayConfig,
    backends: Vec<(&str, Arc<CountingBackend>)>,
    samples: Vec<DeviceSample>,
    provider: Option<Arc<CountingBackend>>,
) -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.log");

    config.server.bind = "127.0.0.1".to_string();
    config.server.port = 0;
    config.audit.log_path = audit_path.to_str().unwrap().to_string();
    config.probe.interval_ms = 20;
    config.queue.batch_window_ms = 10;

    let mut backend_map: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
    for (name, backend) in backends {
        backend_map.insert(name.to_string(), backend);
    }

    let query: Arc<dyn DeviceQuery> = Arc::new(StaticDeviceQuery::new(samples));

    let provider = match provider {
        Some(backend) => {
            config.external.enabled = true;
            config.external.provider_name = "openai".to_string();
            config.external.base_url = "http://provider.example".to_string();
            config.external.model = "gpt-4o-mini".to_string();
            ExternalProvider::with_backend(config.external.clone(), backend)
        }
        None => ExternalProvider::new(config.external.clone(), reqwest::Client::new()),
    };

    let gateway = Gateway::with_collaborators(config, backend_map, query, provider).unwrap();
    let runtime = gateway.start().await.unwrap();
    let base = format!("http://{}", runtime.local_addr());

    // Let the probe complete its first sampling round.
    tokio::time::sleep(Duration::from_millis(60)).await;

    TestGateway {
        runtime,
        base,
        audit_path,
        _dir: dir,
    }
}

async fn poll_terminal(
    client: &reqwest::Client,
    base: &str,
    task_id: &str,
) -> serde_json::Value {
    for _ in 0..300 {
        let view: serde_json::Value = client
            .get(format!("{base}/v1/async/status/{task_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let status = view["status"].as_str().unwrap_or("");
        if matches!(status, "completed" | "failed" | "cancelled") {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached a terminal status");
}

#[tokio::test]
async fn happy_path_local_dispatch() {
    let mut config = GatewayConfig::default();
    config.workers = vec![worker("m1", 0, 2.3, &["chat"])];

    let backend = CountingBackend::ok();
    let gw = boot(
        config,
        vec![("m1", Arc::clone(&backend))],
        vec![device(0, 2, 24)],
        None,
    )
    .await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/v1/chat/completions", gw.base))
        .json(&json!({
            "agent_kind": "chat",
            "messages": [{"role": "user", "content": "hello"}],
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-request-id"));

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["model"], "m1");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert!(body["usage"]["total_tokens"].as_u64().unwrap() > 0);
    assert_eq!(backend.calls(), 1);

    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn external_provider_failover_is_invisible() {
    let mut config = GatewayConfig::default();
    config.workers = vec![worker("m1", 0, 2.3, &["chat"])];

    let local = CountingBackend::ok();
    let remote = CountingBackend::failing(500);
    let gw = boot(
        config,
        vec![("m1", Arc::clone(&local))],
        vec![device(0, 2, 24)],
        Some(Arc::clone(&remote)),
    )
    .await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/v1/chat/completions", gw.base))
        .json(&json!({
            "agent_kind": "chat",
            "messages": [{"role": "user", "content": "hello"}],
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    // Served locally, not by the provider.
    assert_eq!(body["model"], "m1");
    assert_eq!(remote.calls(), 1);
    assert_eq!(local.calls(), 1);

    let audit = std::fs::read_to_string(&gw.audit_path).unwrap();
    let failures = audit
        .lines()
        .filter(|line| line.contains("external_failure"))
        .count();
    assert_eq!(failures, 1);

    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn async_submit_status_result_cancel_flow() {
    let mut config = GatewayConfig::default();
    config.workers = vec![worker("m1", 0, 2.3, &[])];

    let backend = CountingBackend::ok();
    let gw = boot(
        config,
        vec![("m1", Arc::clone(&backend))],
        vec![device(0, 2, 24)],
        None,
    )
    .await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/async/submit", gw.base))
        .json(&json!({
            "agent_kind": "chat",
            "messages": [{"role": "user", "content": "summarize the visit"}],
            "priority": "high",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let receipt: serde_json::Value = response.json().await.unwrap();
    let task_id = receipt["task_id"].as_str().unwrap().to_string();
    assert_eq!(receipt["status"], "queued");

    let view = poll_terminal(&client, &gw.base, &task_id).await;
    assert_eq!(view["status"], "completed");
    assert_eq!(view["model_used"], "m1");

    let response = client
        .get(format!("{}/v1/async/result/{task_id}", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["result"]["choices"][0]["message"]["content"]
        .as_str()
        .unwrap()
        .contains("summarize"));

    // Too late to cancel a completed task.
    let response = client
        .delete(format!("{}/v1/async/cancel/{task_id}", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    // Unknown ids are 404 on every async surface.
    for path in ["status", "result"] {
        let response = client
            .get(format!("{}/v1/async/{path}/nope", gw.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn critical_pressure_sheds_to_smallest_model() {
    let mut config = GatewayConfig::default();
    config.workers = vec![
        worker("m1", 0, 2.3, &[]),
        worker("m2", 0, 7.8, &[]),
    ];
    config
        .agent_map
        .insert("claims".to_string(), vec!["m2".to_string(), "m1".to_string()]);
    config.queue.workers = 2;

    let small = CountingBackend::ok();
    let large = CountingBackend::ok();
    // 22 of 24 GB in use: critical pressure on device 0.
    let gw = boot(
        config,
        vec![("m1", Arc::clone(&small)), ("m2", Arc::clone(&large))],
        vec![device(0, 22, 24)],
        None,
    )
    .await;
    let client = reqwest::Client::new();

    let mut task_ids = Vec::new();
    for i in 0..5 {
        let response = client
            .post(format!("{}/v1/async/submit", gw.base))
            .json(&json!({
                "agent_kind": "claims",
                "messages": [{"role": "user", "content": format!("claim {i}")}],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let receipt: serde_json::Value = response.json().await.unwrap();
        task_ids.push(receipt["task_id"].as_str().unwrap().to_string());
    }

    for task_id in &task_ids {
        let view = poll_terminal(&client, &gw.base, task_id).await;
        assert_eq!(view["status"], "completed", "task {task_id} failed");
        assert_eq!(view["model_used"], "m1");
    }

    assert_eq!(large.calls(), 0);
    assert_eq!(small.calls(), 5);

    let stats: serde_json::Value = client
        .get(format!("{}/v1/async/stats", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["failed"], 0);
    assert_eq!(stats["completed"], 5);

    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn rate_limit_rejects_with_retry_after() {
    let mut config = GatewayConfig::default();
    config.workers = vec![worker("m1", 0, 2.3, &[])];
    config.rate_limit.max_requests = 3;
    config.rate_limit.window_seconds = 60;

    let backend = CountingBackend::ok();
    let gw = boot(
        config,
        vec![("m1", backend)],
        vec![device(0, 2, 24)],
        None,
    )
    .await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let response = client
            .post(format!("{}/v1/chat/completions", gw.base))
            .json(&json!({
                "agent_kind": "chat",
                "messages": [{"role": "user", "content": "hi"}],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let response = client
        .post(format!("{}/v1/chat/completions", gw.base))
        .json(&json!({
            "agent_kind": "chat",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 429);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 60);

    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn batch_submit_is_all_or_nothing() {
    let mut config = GatewayConfig::default();
    config.workers = vec![worker("m1", 0, 2.3, &[])];
    config.queue.capacity = 2;
    config.queue.workers = 1;

    let backend = CountingBackend::ok();
    let gw = boot(
        config,
        vec![("m1", backend)],
        vec![device(0, 2, 24)],
        None,
    )
    .await;
    let client = reqwest::Client::new();

    let task = |content: &str| {
        json!({
            "agent_kind": "chat",
            "messages": [{"role": "user", "content": content}],
        })
    };

    let response = client
        .post(format!("{}/v1/async/submit-batch", gw.base))
        .json(&json!({"tasks": [task("a"), task("b"), task("c")]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "rejected_full");
    assert!(body.get("tasks").is_none());

    // Nothing entered the queue: no task ever becomes visible.
    let stats: serde_json::Value = client
        .get(format!("{}/v1/async/stats", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["queued"].as_u64().unwrap() + stats["completed"].as_u64().unwrap(), 0);

    let response = client
        .post(format!("{}/v1/async/submit-batch", gw.base))
        .json(&json!({"tasks": [task("a"), task("b")]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let receipt: serde_json::Value = response.json().await.unwrap();
    assert_eq!(receipt["tasks"].as_array().unwrap().len(), 2);

    let batch_id = receipt["batch_id"].as_str().unwrap();
    let view: serde_json::Value = client
        .get(format!("{}/v1/async/batch/{batch_id}", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["progress"]["total"], 2);

    gw.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn gpu_status_and_models_are_observable() {
    let mut config = GatewayConfig::default();
    config.workers = vec![worker("m1", 0, 2.3, &["chat"])];

    let backend = CountingBackend::ok();
    let gw = boot(
        config,
        vec![("m1", backend)],
        vec![device(0, 14, 24)],
        None,
    )
    .await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .get(format!("{}/v1/gpu/status", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let devices = body["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["device_id"], 0);
    assert_eq!(devices[0]["pressure"], "normal");

    let body: serde_json::Value = client
        .get(format!("{}/models", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let models = body["data"].as_array().unwrap();
    assert_eq!(models[0]["logical_name"], "m1");
    // Endpoint URLs are redacted from the public view.
    assert!(!body.to_string().contains("endpoint_url"));

    let health: serde_json::Value = client
        .get(format!("{}/v1/async/health", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let metrics_text = client
        .get(format!("{}/metrics", gw.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics_text.contains("gateway_"));

    let response = client
        .post(format!("{}/v1/chat/completions", gw.base))
        .json(&json!({"agent_kind": "chat", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    gw.runtime.shutdown().await.unwrap();
}
