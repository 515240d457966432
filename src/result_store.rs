//! Task result retention and the optional response cache.
//!
//! Results are retrievable for a TTL measured from completion; a
//! background sweeper purges expired entries. The response cache is
//! content-addressed by a hash of the normalized messages and the
//! resolved model name, and never influences queue ordering.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::backend::ChatResponse;
use crate::types::{ChatMessage, GatewayError};

pub type TaskResult = Result<ChatResponse, GatewayError>;

struct StoredEntry {
    result: TaskResult,
    completed_at: Instant,
}

/// Per-task result retention keyed by task id.
pub struct ResultStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
    ttl: Duration,
}

impl ResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn insert(&self, task_id: &str, result: TaskResult) {
        let mut entries = self.entries.lock();
        entries.insert(
            task_id.to_string(),
            StoredEntry {
                result,
                completed_at: Instant::now(),
            },
        );
    }

    /// Retrieve a live result; expired entries read as absent.
    pub fn get(&self, task_id: &str) -> Option<TaskResult> {
        let entries = self.entries.lock();
        entries.get(task_id).and_then(|entry| {
            if entry.completed_at.elapsed() < self.ttl {
                Some(entry.result.clone())
            } else {
                None
            }
        })
    }

    /// Drop entries past the TTL; returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.completed_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn remove(&self, task_id: &str) {
        self.entries.lock().remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct CacheEntry {
    response: ChatResponse,
    inserted_at: Instant,
}

/// Content-addressed response cache with per-entry TTL.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(enabled: bool, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            enabled,
        }
    }

    /// Cache key over the normalized messages and the resolved model.
    pub fn key(messages: &[ChatMessage], model: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update(b"\x1e");
        for message in messages {
            hasher.update(message.role.trim().as_bytes());
            hasher.update(b"\x1f");
            hasher.update(message.content.trim().as_bytes());
            hasher.update(b"\x1e");
        }
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<ChatResponse> {
        if !self.enabled {
            return None;
        }
        let entries = self.entries.lock();
        entries.get(key).and_then(|entry| {
            if entry.inserted_at.elapsed() < self.ttl {
                Some(entry.response.clone())
            } else {
                None
            }
        })
    }

    pub fn insert(&self, key: String, response: ChatResponse) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            CacheEntry {
                response,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn remove_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        before - entries.len()
    }
}
