//! # GPU Probe
//!
//! Samples per-device memory, temperature, and utilization at a fixed
//! cadence and keeps a bounded rolling history per device. Readers only
//! ever receive value copies; the ring buffers never leak references.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics;
use crate::utils::timestamp_now;

/// Maximum samples retained per device.
pub const RING_CAPACITY: usize = 100;

/// Device query failures are logged at most this often.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);

const THERMAL_PROMOTE_C: f64 = 80.0;
const THERMAL_CRITICAL_C: f64 = 85.0;

/// Whether a sample came from the device query or was synthesized after a
/// query failure. Readers must treat `Unknown` as worst-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleState {
    Known,
    Unknown,
}

/// One timestamped measurement of a GPU device.
#[derive(Debug, Clone, Serialize)]
pub struct GpuMetric {
    pub device_id: u32,
    pub used_gb: f64,
    pub total_gb: f64,
    pub utilization_pct: f64,
    pub temperature_c: f64,
    pub power_w: f64,
    pub state: SampleState,
    pub sampled_at_unix: u64,
}

impl GpuMetric {
    fn unknown(device_id: u32) -> Self {
        Self {
            device_id,
            used_gb: 0.0,
            total_gb: 0.0,
            utilization_pct: 0.0,
            temperature_c: 0.0,
            power_w: 0.0,
            state: SampleState::Unknown,
            sampled_at_unix: timestamp_now(),
        }
    }
}

/// Four-valued classification of GPU resource state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Low,
    Normal,
    High,
    Critical,
}

impl PressureLevel {
    /// Classify a sample. Memory ratio sets the base level, temperature
    /// above 80 degC promotes it by one level, above 85 degC forces
    /// `Critical`. An `Unknown` sample is always `Critical`.
    pub fn classify(metric: &GpuMetric) -> PressureLevel {
        if metric.state == SampleState::Unknown || metric.total_gb <= 0.0 {
            return PressureLevel::Critical;
        }

        let ratio = metric.used_gb / metric.total_gb;
        let base = if ratio <= 0.50 {
            PressureLevel::Low
        } else if ratio <= 0.70 {
            PressureLevel::Normal
        } else if ratio <= 0.85 {
            PressureLevel::High
        } else {
            PressureLevel::Critical
        };

        if metric.temperature_c > THERMAL_CRITICAL_C {
            PressureLevel::Critical
        } else if metric.temperature_c > THERMAL_PROMOTE_C {
            base.promote()
        } else {
            base
        }
    }

    fn promote(self) -> PressureLevel {
        match self {
            PressureLevel::Low => PressureLevel::Normal,
            PressureLevel::Normal => PressureLevel::High,
            PressureLevel::High | PressureLevel::Critical => PressureLevel::Critical,
        }
    }
}

/// Raw scalars returned by the device query collaborator.
#[derive(Debug, Clone)]
pub struct DeviceSample {
    pub device_id: u32,
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub utilization_pct: f64,
    pub temperature_c: f64,
    pub power_w: f64,
}

/// Process-local facility that reports the five scalars per device.
#[async_trait]
pub trait DeviceQuery: Send + Sync {
    async fn query(&self) -> anyhow::Result<Vec<DeviceSample>>;
}

/// Production query that shells out to `nvidia-smi`.
pub struct NvidiaSmiQuery {
    binary: String,
}

impl NvidiaSmiQuery {
    pub fn new() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
        }
    }

    pub fn with_binary<S: Into<String>>(binary: S) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for NvidiaSmiQuery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceQuery for NvidiaSmiQuery {
    async fn query(&self) -> anyhow::Result<Vec<DeviceSample>> {
        let output = tokio::process::Command::new(&self.binary)
            .args([
                "--query-gpu=index,memory.used,memory.total,utilization.gpu,temperature.gpu,power.draw",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await?;

        if !output.status.success() {
            anyhow::bail!(
                "nvidia-smi exited with status {}",
                output.status.code().unwrap_or(-1)
            );
        }

        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse the csv,noheader,nounits output format. Memory columns are MiB.
fn parse_nvidia_smi(stdout: &str) -> anyhow::Result<Vec<DeviceSample>> {
    const MIB: u64 = 1024 * 1024;
    let mut samples = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 6 {
            anyhow::bail!("unexpected nvidia-smi line: {line:?}");
        }

        samples.push(DeviceSample {
            device_id: fields[0].parse()?,
            used_bytes: fields[1].parse::<u64>()? * MIB,
            total_bytes: fields[2].parse::<u64>()? * MIB,
            utilization_pct: fields[3].parse()?,
            temperature_c: fields[4].parse()?,
            power_w: fields[5].parse().unwrap_or(0.0),
        });
    }

    Ok(samples)
}

/// Fixed-output device query for environments without NVIDIA tooling and
/// for tests. The reported samples can be swapped at runtime.
pub struct StaticDeviceQuery {
    samples: RwLock<Vec<DeviceSample>>,
}

impl StaticDeviceQuery {
    pub fn new(samples: Vec<DeviceSample>) -> Self {
        Self {
            samples: RwLock::new(samples),
        }
    }

    pub fn set(&self, samples: Vec<DeviceSample>) {
        *self.samples.write() = samples;
    }
}

#[async_trait]
impl DeviceQuery for StaticDeviceQuery {
    async fn query(&self) -> anyhow::Result<Vec<DeviceSample>> {
        Ok(self.samples.read().clone())
    }
}

/// Rolling per-device sample history with pressure classification.
pub struct GpuProbe {
    query: Arc<dyn DeviceQuery>,
    tracked_devices: Vec<u32>,
    history: RwLock<HashMap<u32, VecDeque<GpuMetric>>>,
    last_error_log: Mutex<Option<Instant>>,
    interval: Duration,
}

impl GpuProbe {
    pub fn new(query: Arc<dyn DeviceQuery>, tracked_devices: Vec<u32>, interval: Duration) -> Self {
        let mut devices = tracked_devices;
        devices.sort_unstable();
        devices.dedup();

        Self {
            query,
            tracked_devices: devices,
            history: RwLock::new(HashMap::new()),
            last_error_log: Mutex::new(None),
            interval,
        }
    }

    pub fn devices(&self) -> Vec<u32> {
        self.tracked_devices.clone()
    }

    /// Most recent sample for a device, if any round has completed.
    pub fn current(&self, device_id: u32) -> Option<GpuMetric> {
        self.history
            .read()
            .get(&device_id)
            .and_then(|ring| ring.back().cloned())
    }

    /// Up to `n` most recent samples, newest last.
    pub fn history(&self, device_id: u32, n: usize) -> Vec<GpuMetric> {
        self.history
            .read()
            .get(&device_id)
            .map(|ring| ring.iter().rev().take(n).rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest sample per tracked device, in device order. Devices that have
    /// never been sampled report an `Unknown` placeholder.
    pub fn snapshot(&self) -> Vec<GpuMetric> {
        self.tracked_devices
            .iter()
            .map(|&id| self.current(id).unwrap_or_else(|| GpuMetric::unknown(id)))
            .collect()
    }

    /// Current pressure for a device; no sample reads as `Critical`.
    pub fn pressure(&self, device_id: u32) -> PressureLevel {
        match self.current(device_id) {
            Some(metric) => PressureLevel::classify(&metric),
            None => PressureLevel::Critical,
        }
    }

    /// One sampling round. Query failures record synthetic `Unknown`
    /// samples and never propagate.
    pub async fn tick(&self) {
        match self.query.query().await {
            Ok(samples) => {
                let by_device: HashMap<u32, DeviceSample> = samples
                    .into_iter()
                    .map(|sample| (sample.device_id, sample))
                    .collect();

                for &device_id in &self.tracked_devices {
                    let metric = match by_device.get(&device_id) {
                        Some(sample) => sample_to_metric(sample),
                        None => GpuMetric::unknown(device_id),
                    };
                    metrics::record_gpu_sample(&metric);
                    self.push(metric);
                }
            }
            Err(err) => {
                self.log_query_error(&err);
                for &device_id in &self.tracked_devices {
                    self.push(GpuMetric::unknown(device_id));
                }
            }
        }
    }

    /// Background sampling loop, cancelled via the runtime token.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("gpu probe shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    fn push(&self, metric: GpuMetric) {
        let mut history = self.history.write();
        let ring = history.entry(metric.device_id).or_default();
        if ring.len() >= RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(metric);
    }

    fn log_query_error(&self, err: &anyhow::Error) {
        let mut last = self.last_error_log.lock();
        let due = last.map_or(true, |at| at.elapsed() >= ERROR_LOG_INTERVAL);
        if due {
            warn!(error = %err, "device query failed; recording unknown samples");
            *last = Some(Instant::now());
        }
    }
}

fn sample_to_metric(sample: &DeviceSample) -> GpuMetric {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    GpuMetric {
        device_id: sample.device_id,
        used_gb: sample.used_bytes as f64 / GIB,
        total_gb: sample.total_bytes as f64 / GIB,
        utilization_pct: sample.utilization_pct,
        temperature_c: sample.temperature_c,
        power_w: sample.power_w,
        state: SampleState::Known,
        sampled_at_unix: timestamp_now(),
    }
}
