use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::types::AgentKind;

const DEFAULT_CONFIG_PATH: &str = "configs/gateway.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerSettings,
    pub observability: ObservabilitySettings,
    pub audit: AuditSettings,
    pub workers: Vec<WorkerSettings>,
    /// Bearer token presented to worker endpoints, if they require one.
    pub worker_api_key: Option<String>,
    /// Agent kind -> ordered candidate model names. Kinds without an entry
    /// fall back to workers that list the kind in `preferred_for`, then to
    /// the full pool.
    pub agent_map: HashMap<String, Vec<String>>,
    pub queue: QueueSettings,
    pub probe: ProbeSettings,
    pub registry: RegistrySettings,
    pub rate_limit: RateLimitSettings,
    /// Agent kind -> max_tokens ceiling. Requests above the ceiling are
    /// clamped, never rejected.
    pub per_agent_max_tokens: HashMap<String, u32>,
    pub external: ExternalProviderSettings,
    pub default_request_timeout_ms: u64,
    pub dispatch_retry_budget: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            observability: ObservabilitySettings::default(),
            audit: AuditSettings::default(),
            workers: Vec::new(),
            worker_api_key: None,
            agent_map: HashMap::new(),
            queue: QueueSettings::default(),
            probe: ProbeSettings::default(),
            registry: RegistrySettings::default(),
            rate_limit: RateLimitSettings::default(),
            per_agent_max_tokens: HashMap::new(),
            external: ExternalProviderSettings::default(),
            default_request_timeout_ms: 30_000,
            dispatch_retry_budget: 2,
        }
    }
}

impl GatewayConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_path(None::<PathBuf>)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            File::from(PathBuf::from(DEFAULT_CONFIG_PATH))
                .format(FileFormat::Toml)
                .required(false),
        );

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.as_ref())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(Environment::with_prefix("GATEWAY").separator("__"));

        let config = builder.build()?;
        let config: Self = config
            .try_deserialize()
            .context("invalid gateway configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation run once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            bail!("no workers configured");
        }

        let mut names = HashSet::new();
        for worker in &self.workers {
            if worker.logical_name.is_empty() {
                bail!("worker with empty logical_name");
            }
            if !names.insert(worker.logical_name.as_str()) {
                bail!("duplicate worker logical_name: {}", worker.logical_name);
            }
            if worker.endpoint_url.is_empty() {
                bail!("worker {} has no endpoint_url", worker.logical_name);
            }
            for kind in &worker.preferred_for {
                kind.parse::<AgentKind>()
                    .map_err(|_| anyhow::anyhow!("worker {}: unknown agent kind {:?} in preferred_for", worker.logical_name, kind))?;
            }
        }

        for (kind, candidates) in &self.agent_map {
            kind.parse::<AgentKind>()
                .map_err(|_| anyhow::anyhow!("agent_map: unknown agent kind {:?}", kind))?;
            if candidates.is_empty() {
                bail!("agent_map entry {:?} has no candidates", kind);
            }
            for name in candidates {
                if !names.contains(name.as_str()) {
                    bail!("agent_map entry {:?} references unknown model {:?}", kind, name);
                }
            }
        }

        for kind in self.per_agent_max_tokens.keys() {
            kind.parse::<AgentKind>()
                .map_err(|_| anyhow::anyhow!("per_agent_max_tokens: unknown agent kind {:?}", kind))?;
        }

        if self.external.enabled && self.external.base_url.is_empty() {
            bail!("external provider enabled without a base_url");
        }

        Ok(())
    }

    /// Resolved candidate lists for every agent kind.
    ///
    /// Explicit `agent_map` entries win; otherwise workers preferring the
    /// kind (sorted by name), otherwise every worker (sorted by name).
    pub fn resolved_agent_map(&self) -> HashMap<AgentKind, Vec<String>> {
        let mut resolved = HashMap::new();
        for kind in AgentKind::ALL {
            if let Some(candidates) = self.agent_map.get(kind.as_str()) {
                resolved.insert(kind, candidates.clone());
                continue;
            }

            let mut preferred: Vec<String> = self
                .workers
                .iter()
                .filter(|w| w.preferred_for.iter().any(|k| k == kind.as_str()))
                .map(|w| w.logical_name.clone())
                .collect();
            preferred.sort();

            if preferred.is_empty() {
                preferred = self
                    .workers
                    .iter()
                    .map(|w| w.logical_name.clone())
                    .collect();
                preferred.sort();
            }

            resolved.insert(kind, preferred);
        }
        resolved
    }

    pub fn max_tokens_for(&self, kind: AgentKind) -> Option<u32> {
        self.per_agent_max_tokens.get(kind.as_str()).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_level: String,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub log_path: String,
    pub retention_days: u32,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            log_path: "logs/audit.log".to_string(),
            retention_days: 90,
        }
    }
}

/// One local worker endpoint serving an OpenAI-compatible surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub logical_name: String,
    pub endpoint_url: String,
    #[serde(default)]
    pub device_id: u32,
    pub declared_vram_gb: f64,
    pub max_context_tokens: u32,
    #[serde(default)]
    pub preferred_for: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub capacity: usize,
    pub workers: usize,
    pub batch_max_size: usize,
    pub batch_window_ms: u64,
    pub result_ttl_ms: u64,
    pub cache_enabled: bool,
    pub cache_ttl_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            workers: 4,
            batch_max_size: 8,
            batch_window_ms: 100,
            result_ttl_ms: 300_000,
            cache_enabled: true,
            cache_ttl_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub interval_ms: u64,
    pub safety_reserve_gb: f64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            safety_reserve_gb: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Cadence of the background readiness probe against worker endpoints.
    pub health_interval_s: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            health_interval_s: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window_seconds: u64,
    pub max_requests: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            max_requests: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalProviderSettings {
    pub enabled: bool,
    pub provider_name: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for ExternalProviderSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider_name: "external".to_string(),
            base_url: String::new(),
            api_key: String::new(),
            model: String::new(),
            timeout_ms: 10_000,
        }
    }
}
