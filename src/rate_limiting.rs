use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::RateLimitSettings;
use crate::types::AgentKind;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            max_requests: settings.max_requests,
            window: Duration::from_secs(settings.window_seconds),
        }
    }
}

/// Sliding-window limiter keyed by `(client identifier, agent kind)`.
///
/// Buckets hold the instants of accepted requests inside the window.
/// Within any window of the configured length a key is never granted more
/// than `max_requests`; a denied request learns when the oldest entry
/// falls out of the window.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<(String, AgentKind), Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(RateLimitConfig::from(settings))
    }

    /// Admit or deny one request for the key. On denial the error carries
    /// the time until the next slot frees up.
    pub fn check(&self, client: &str, agent_kind: AgentKind) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        let bucket = buckets
            .entry((client.to_string(), agent_kind))
            .or_insert_with(Vec::new);

        // Drop requests that have left the window.
        bucket.retain(|&accepted_at| now.duration_since(accepted_at) < self.config.window);

        if bucket.len() >= self.config.max_requests as usize {
            let oldest = bucket.iter().min().copied().unwrap_or(now);
            let elapsed = now.duration_since(oldest);
            let retry_after = self.config.window.saturating_sub(elapsed);
            return Err(RateLimitError { retry_after });
        }

        bucket.push(now);
        Ok(())
    }

    /// Accepted requests currently inside the window for a key.
    pub fn current_usage(&self, client: &str, agent_kind: AgentKind) -> usize {
        let now = Instant::now();
        let buckets = self.buckets.lock();
        buckets
            .get(&(client.to_string(), agent_kind))
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|&&at| now.duration_since(at) < self.config.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop empty buckets; called from the periodic cleanup sweep.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        buckets.retain(|_, bucket| {
            bucket.retain(|&at| now.duration_since(at) < self.config.window);
            !bucket.is_empty()
        });
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitError {
    pub retry_after: Duration,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rate limit exceeded, retry after {}s",
            self.retry_after.as_secs()
        )
    }
}

impl std::error::Error for RateLimitError {}
