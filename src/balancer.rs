//! Smart load balancer
//!
//! Picks one concrete `(model, endpoint)` dispatch target from a candidate
//! set, honoring model health, context windows, VRAM headroom, and the
//! per-device GPU pressure level.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::gpu_probe::{GpuMetric, GpuProbe, PressureLevel, SampleState};
use crate::registry::{ModelEntry, ModelState, WorkerRegistry};

/// Expected latency reported before a model has served any request.
const DEFAULT_EXPECTED_LATENCY_MS: f64 = 500.0;

/// Chosen dispatch target. Produced fresh for every dispatch; never cached.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub model: ModelEntry,
    pub endpoint_url: String,
    pub rationale: String,
    pub estimated_latency_ms: f64,
}

/// The balancer found nothing dispatchable right now. Callers either queue
/// the work or reject with a retry-after signal.
#[derive(Debug, Clone)]
pub struct NoViableTarget {
    pub reason: String,
}

impl fmt::Display for NoViableTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no viable target: {}", self.reason)
    }
}

pub struct SmartBalancer {
    registry: Arc<WorkerRegistry>,
    probe: Arc<GpuProbe>,
    safety_reserve_gb: f64,
}

struct Survivor {
    entry: ModelEntry,
    pressure: PressureLevel,
}

impl SmartBalancer {
    pub fn new(registry: Arc<WorkerRegistry>, probe: Arc<GpuProbe>, safety_reserve_gb: f64) -> Self {
        Self {
            registry,
            probe,
            safety_reserve_gb,
        }
    }

    /// Select the best dispatch target among `candidates`.
    ///
    /// The pipeline: snapshot registry and per-device pressure, filter by
    /// health / context window / VRAM headroom, apply the pressure rules,
    /// then rank by `(state, failures, inflight, ema latency, vram)` with a
    /// lexicographic name tie-break for determinism.
    pub fn decide(
        &self,
        candidates: &[String],
        min_context_tokens: u32,
    ) -> Result<RoutingDecision, NoViableTarget> {
        if candidates.is_empty() {
            return Err(NoViableTarget {
                reason: "empty candidate set".to_string(),
            });
        }

        let snapshot: HashMap<String, ModelEntry> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|entry| (entry.logical_name.clone(), entry))
            .collect();

        // Smallest declared footprint per device across the WHOLE registry,
        // not just the candidate set. Under Critical pressure only the
        // device-wide minimum may receive work, even when it is not among
        // the candidates.
        let mut device_min_vram: HashMap<u32, f64> = HashMap::new();
        for entry in snapshot.values() {
            let slot = device_min_vram
                .entry(entry.device_id)
                .or_insert(entry.declared_vram_gb);
            if entry.declared_vram_gb < *slot {
                *slot = entry.declared_vram_gb;
            }
        }

        let mut latest_metric: HashMap<u32, GpuMetric> = HashMap::new();
        let mut pressure: HashMap<u32, PressureLevel> = HashMap::new();
        for device_id in self.probe.devices() {
            pressure.insert(device_id, self.probe.pressure(device_id));
            if let Some(metric) = self.probe.current(device_id) {
                latest_metric.insert(device_id, metric);
            }
        }

        let mut notes: Vec<String> = Vec::new();

        // Health, context window, and headroom filters.
        let mut survivors: Vec<Survivor> = Vec::new();
        for name in candidates {
            let Some(entry) = snapshot.get(name).cloned() else {
                continue;
            };
            if entry.state == ModelState::Unhealthy {
                continue;
            }
            if entry.max_context_tokens < min_context_tokens {
                continue;
            }
            let device_pressure = pressure
                .get(&entry.device_id)
                .copied()
                .unwrap_or(PressureLevel::Critical);
            // Headroom gates admission below Critical; at Critical the
            // smallest-footprint rule takes over (that worker is already
            // resident on the device).
            if device_pressure != PressureLevel::Critical
                && !self.fits_headroom(&entry, latest_metric.get(&entry.device_id))
            {
                continue;
            }
            survivors.push(Survivor {
                entry,
                pressure: device_pressure,
            });
        }

        if survivors.is_empty() {
            return Err(NoViableTarget {
                reason: format!(
                    "no healthy candidate fits context {min_context_tokens} and available headroom"
                ),
            });
        }

        self.apply_pressure_rules(&mut survivors, &device_min_vram, &mut notes);

        if survivors.is_empty() {
            return Err(NoViableTarget {
                reason: "critical pressure and the smallest-footprint model is busy or absent"
                    .to_string(),
            });
        }

        survivors.sort_by(|a, b| {
            rank_key(a)
                .partial_cmp(&rank_key(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.logical_name.cmp(&b.entry.logical_name))
        });

        let chosen = &survivors[0];
        let estimated_latency_ms = if chosen.entry.ema_latency_ms > 0.0 {
            chosen.entry.ema_latency_ms
        } else {
            DEFAULT_EXPECTED_LATENCY_MS
        };

        let rationale = format!(
            "pressure {:?} on device {}; {} of {} candidates survived filtering{}; \
             selected {} ({:?}, {} inflight, {:.0}ms ema)",
            chosen.pressure,
            chosen.entry.device_id,
            survivors.len(),
            candidates.len(),
            if notes.is_empty() {
                String::new()
            } else {
                format!(" [{}]", notes.join("; "))
            },
            chosen.entry.logical_name,
            chosen.entry.state,
            chosen.entry.inflight_count,
            chosen.entry.ema_latency_ms,
        );

        Ok(RoutingDecision {
            endpoint_url: chosen.entry.endpoint_url.clone(),
            estimated_latency_ms,
            rationale,
            model: chosen.entry.clone(),
        })
    }

    /// Headroom check: the model's declared footprint must fit in
    /// `total - used - safety_reserve`. With no usable sample there is no
    /// estimate; the pressure rules (Critical) take over instead.
    fn fits_headroom(&self, entry: &ModelEntry, metric: Option<&GpuMetric>) -> bool {
        match metric {
            Some(metric) if metric.state == SampleState::Known => {
                let headroom = metric.total_gb - metric.used_gb - self.safety_reserve_gb;
                entry.declared_vram_gb <= headroom
            }
            _ => true,
        }
    }

    fn apply_pressure_rules(
        &self,
        survivors: &mut Vec<Survivor>,
        device_min_vram: &HashMap<u32, f64>,
        notes: &mut Vec<String>,
    ) {
        // Median declared VRAM per device, over the current survivors.
        let mut per_device: HashMap<u32, Vec<f64>> = HashMap::new();
        for survivor in survivors.iter() {
            per_device
                .entry(survivor.entry.device_id)
                .or_default()
                .push(survivor.entry.declared_vram_gb);
        }
        let medians: HashMap<u32, f64> = per_device
            .into_iter()
            .map(|(device, mut sizes)| {
                sizes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                (device, median_of_sorted(&sizes))
            })
            .collect();

        survivors.retain(|survivor| {
            let median = medians
                .get(&survivor.entry.device_id)
                .copied()
                .unwrap_or(survivor.entry.declared_vram_gb);
            match survivor.pressure {
                // Under Normal the smaller-footprint preference falls out
                // of the ranking key's trailing VRAM term.
                PressureLevel::Low | PressureLevel::Normal => true,
                PressureLevel::High => {
                    if survivor.entry.declared_vram_gb > median {
                        notes.push(format!(
                            "high pressure dropped {} (above median footprint)",
                            survivor.entry.logical_name
                        ));
                        false
                    } else {
                        true
                    }
                }
                PressureLevel::Critical => {
                    let device_min = device_min_vram
                        .get(&survivor.entry.device_id)
                        .copied()
                        .unwrap_or(survivor.entry.declared_vram_gb);
                    let is_device_smallest = survivor.entry.declared_vram_gb <= device_min;
                    // The single smallest model on the device still
                    // serves, one request at a time.
                    let idle = survivor.entry.inflight_count == 0;
                    if !is_device_smallest {
                        notes.push(format!(
                            "critical pressure dropped {} (not the device minimum)",
                            survivor.entry.logical_name
                        ));
                    } else if !idle {
                        notes.push(format!(
                            "critical pressure: {} busy, dispatch deferred",
                            survivor.entry.logical_name
                        ));
                    }
                    is_device_smallest && idle
                }
            }
        });
    }
}

/// Composite ranking key; smaller is better.
fn rank_key(survivor: &Survivor) -> (u8, u32, u32, f64, f64) {
    (
        survivor.entry.state.ordinal(),
        survivor.entry.consecutive_failures,
        survivor.entry.inflight_count,
        survivor.entry.ema_latency_ms,
        survivor.entry.declared_vram_gb,
    )
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}
