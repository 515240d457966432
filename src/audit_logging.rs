use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::types::ChatMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub request_id: String,
    pub client: Option<String>,
    pub agent_kind: Option<String>,
    /// sha256 over the normalized messages; raw content is never logged.
    pub message_digest: Option<String>,
    pub model_used: Option<String>,
    pub result: String,
    pub severity: AuditSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuditSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Append-only JSON-lines audit log.
#[derive(Clone)]
pub struct AuditLogger {
    log_file: Arc<Mutex<BufWriter<File>>>,
    _retention_days: u32,
}

impl AuditLogger {
    pub fn new(log_path: &str, retention_days: u32) -> Result<Self> {
        if let Some(parent) = Path::new(log_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Self {
            log_file: Arc::new(Mutex::new(BufWriter::new(file))),
            _retention_days: retention_days,
        })
    }

    pub fn log_event(&self, mut event: AuditEvent) -> Result<()> {
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }

        if matches!(event.severity, AuditSeverity::Critical | AuditSeverity::High) {
            warn!(
                event_type = %event.event_type,
                request_id = %event.request_id,
                result = %event.result,
                "audit"
            );
        }

        let event_json = serde_json::to_string(&event)? + "\n";
        let mut writer = self
            .log_file
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log writer poisoned"))?;
        writer.write_all(event_json.as_bytes())?;
        writer.flush()?;

        Ok(())
    }

    /// One record per dispatched request, written after the model resolved.
    pub fn log_dispatch(
        &self,
        request_id: &str,
        client: Option<String>,
        agent_kind: &str,
        message_digest: &str,
        model_used: Option<String>,
        result: &str,
    ) -> Result<()> {
        let severity = if result == "success" {
            AuditSeverity::Low
        } else {
            AuditSeverity::Medium
        };

        self.log_event(AuditEvent {
            id: String::new(),
            timestamp: Utc::now(),
            event_type: "dispatch".to_string(),
            request_id: request_id.to_string(),
            client,
            agent_kind: Some(agent_kind.to_string()),
            message_digest: Some(message_digest.to_string()),
            model_used,
            result: result.to_string(),
            severity,
        })
    }

    pub fn log_rejection(
        &self,
        request_id: &str,
        client: Option<String>,
        agent_kind: Option<String>,
        error_kind: &str,
    ) -> Result<()> {
        self.log_event(AuditEvent {
            id: String::new(),
            timestamp: Utc::now(),
            event_type: "admission_rejected".to_string(),
            request_id: request_id.to_string(),
            client,
            agent_kind,
            message_digest: None,
            model_used: None,
            result: error_kind.to_string(),
            severity: AuditSeverity::Medium,
        })
    }

    /// External provider failures are swallowed by the failover wrapper but
    /// still leave an audit trail.
    pub fn log_external_failure(&self, request_id: &str, error_kind: &str) -> Result<()> {
        self.log_event(AuditEvent {
            id: String::new(),
            timestamp: Utc::now(),
            event_type: "external_failure".to_string(),
            request_id: request_id.to_string(),
            client: None,
            agent_kind: None,
            message_digest: None,
            model_used: None,
            result: error_kind.to_string(),
            severity: AuditSeverity::Low,
        })
    }
}

/// Hex sha256 over the normalized message list.
pub fn message_digest(messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(message.role.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(message.content.as_bytes());
        hasher.update(b"\x1e");
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
