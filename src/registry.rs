//! Worker registry
//!
//! Authoritative directory of configured models and their live health.
//! The registry owns every `ModelEntry`; consumers only ever see cloned
//! snapshots. Outcome statistics are folded in by the dispatcher, and a
//! background readiness probe gives unhealthy endpoints a way back.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::ChatBackend;
use crate::config::WorkerSettings;
use crate::types::AgentKind;

/// EMA smoothing factor for per-model latency.
const LATENCY_SMOOTHING: f64 = 0.2;

const DEGRADED_THRESHOLD: u32 = 3;
const UNHEALTHY_THRESHOLD: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ModelState {
    /// Ranking ordinal; healthier sorts first.
    pub fn ordinal(&self) -> u8 {
        match self {
            ModelState::Healthy => 0,
            ModelState::Degraded => 1,
            ModelState::Unhealthy => 2,
        }
    }
}

/// One configured model and its live statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub logical_name: String,
    pub endpoint_url: String,
    pub device_id: u32,
    pub declared_vram_gb: f64,
    pub max_context_tokens: u32,
    pub preferred_for: Vec<AgentKind>,
    pub state: ModelState,
    pub ema_latency_ms: f64,
    pub consecutive_failures: u32,
    pub inflight_count: u32,
}

impl ModelEntry {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        let preferred_for = settings
            .preferred_for
            .iter()
            .filter_map(|kind| kind.parse::<AgentKind>().ok())
            .collect();

        Self {
            logical_name: settings.logical_name.clone(),
            endpoint_url: settings.endpoint_url.clone(),
            device_id: settings.device_id,
            declared_vram_gb: settings.declared_vram_gb,
            max_context_tokens: settings.max_context_tokens,
            preferred_for,
            state: ModelState::Healthy,
            ema_latency_ms: 0.0,
            consecutive_failures: 0,
            inflight_count: 0,
        }
    }
}

/// Public registry view with endpoint URLs redacted.
#[derive(Debug, Clone, Serialize)]
pub struct ModelPublicView {
    pub logical_name: String,
    pub device_id: u32,
    pub declared_vram_gb: f64,
    pub max_context_tokens: u32,
    pub preferred_for: Vec<AgentKind>,
    pub state: ModelState,
    pub ema_latency_ms: f64,
    pub inflight_count: u32,
}

#[derive(Default)]
pub struct WorkerRegistry {
    entries: RwLock<HashMap<String, ModelEntry>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_settings(workers: &[WorkerSettings]) -> Self {
        let registry = Self::new();
        for settings in workers {
            registry.register(ModelEntry::from_settings(settings));
        }
        registry
    }

    pub fn register(&self, entry: ModelEntry) {
        let mut entries = self.entries.write();
        entries.insert(entry.logical_name.clone(), entry);
    }

    /// Immutable copy of every entry, sorted by name for determinism.
    pub fn snapshot(&self) -> Vec<ModelEntry> {
        let entries = self.entries.read();
        let mut snapshot: Vec<ModelEntry> = entries.values().cloned().collect();
        snapshot.sort_by(|a, b| a.logical_name.cmp(&b.logical_name));
        snapshot
    }

    pub fn get(&self, logical_name: &str) -> Option<ModelEntry> {
        self.entries.read().get(logical_name).cloned()
    }

    /// Fold a dispatch outcome into the entry's statistics.
    ///
    /// Success resets the failure streak and restores `Healthy`. Failures
    /// accumulate: 3 consecutive demote to `Degraded`, 6 to `Unhealthy`.
    pub fn record_outcome(&self, logical_name: &str, success: bool, latency_ms: f64) {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(logical_name) else {
            warn!(model = logical_name, "outcome recorded for unknown model");
            return;
        };

        if entry.ema_latency_ms == 0.0 {
            entry.ema_latency_ms = latency_ms;
        } else {
            entry.ema_latency_ms =
                LATENCY_SMOOTHING * latency_ms + (1.0 - LATENCY_SMOOTHING) * entry.ema_latency_ms;
        }

        if success {
            entry.consecutive_failures = 0;
            entry.state = ModelState::Healthy;
        } else {
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= UNHEALTHY_THRESHOLD {
                entry.state = ModelState::Unhealthy;
            } else if entry.consecutive_failures >= DEGRADED_THRESHOLD {
                entry.state = ModelState::Degraded;
            }
            debug!(
                model = logical_name,
                failures = entry.consecutive_failures,
                state = ?entry.state,
                "dispatch failure recorded"
            );
        }
    }

    /// Adjust the live dispatch count. The count never goes negative; an
    /// underflow is an accounting bug and is logged loudly.
    pub fn mark_inflight(&self, logical_name: &str, delta: i32) {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(logical_name) else {
            return;
        };

        if delta >= 0 {
            entry.inflight_count += delta as u32;
        } else {
            let decrement = delta.unsigned_abs();
            if entry.inflight_count < decrement {
                warn!(
                    model = logical_name,
                    inflight = entry.inflight_count,
                    delta,
                    "inflight count underflow"
                );
                entry.inflight_count = 0;
            } else {
                entry.inflight_count -= decrement;
            }
        }
    }

    /// Readiness-probe pass for an `Unhealthy` entry: back to `Degraded`,
    /// from where one recorded success restores `Healthy`.
    fn restore_from_probe(&self, logical_name: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(logical_name) {
            if entry.state == ModelState::Unhealthy {
                entry.state = ModelState::Degraded;
                entry.consecutive_failures = 0;
                info!(model = logical_name, "endpoint passed readiness probe");
            }
        }
    }

    pub fn public_view(&self) -> Vec<ModelPublicView> {
        self.snapshot()
            .into_iter()
            .map(|entry| ModelPublicView {
                logical_name: entry.logical_name,
                device_id: entry.device_id,
                declared_vram_gb: entry.declared_vram_gb,
                max_context_tokens: entry.max_context_tokens,
                preferred_for: entry.preferred_for,
                state: entry.state,
                ema_latency_ms: entry.ema_latency_ms,
                inflight_count: entry.inflight_count,
            })
            .collect()
    }

    /// Background readiness probe over every endpoint.
    pub async fn run_health_probe(
        self: Arc<Self>,
        backends: Arc<HashMap<String, Arc<dyn ChatBackend>>>,
        period: Duration,
        token: CancellationToken,
    ) {
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("registry health probe shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.probe_round(&backends).await;
                }
            }
        }
    }

    async fn probe_round(&self, backends: &HashMap<String, Arc<dyn ChatBackend>>) {
        for entry in self.snapshot() {
            let Some(backend) = backends.get(&entry.logical_name) else {
                continue;
            };
            match backend.health().await {
                Ok(()) => self.restore_from_probe(&entry.logical_name),
                Err(err) => {
                    debug!(model = %entry.logical_name, error = %err, "readiness probe failed");
                }
            }
        }
    }
}
