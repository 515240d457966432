//! Core type definitions shared across the gateway.
//!
//! This module defines the request vocabulary (agent kinds, priorities,
//! chat messages), the async task status machine, and the gateway error
//! taxonomy surfaced to clients.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical role of an inbound request.
///
/// The agent kind drives candidate model selection in the router. The set
/// is closed: unknown values are rejected at admission, and extending it is
/// a build-time change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Chat,
    Appointment,
    #[serde(rename = "medical_qa")]
    MedicalQA,
    Documentation,
    Billing,
    Claims,
    Monitoring,
    Scribe,
    Triage,
    Clinical,
    #[serde(rename = "ai_doctor")]
    AIDoctor,
}

impl AgentKind {
    pub const ALL: [AgentKind; 11] = [
        AgentKind::Chat,
        AgentKind::Appointment,
        AgentKind::MedicalQA,
        AgentKind::Documentation,
        AgentKind::Billing,
        AgentKind::Claims,
        AgentKind::Monitoring,
        AgentKind::Scribe,
        AgentKind::Triage,
        AgentKind::Clinical,
        AgentKind::AIDoctor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Chat => "chat",
            AgentKind::Appointment => "appointment",
            AgentKind::MedicalQA => "medical_qa",
            AgentKind::Documentation => "documentation",
            AgentKind::Billing => "billing",
            AgentKind::Claims => "claims",
            AgentKind::Monitoring => "monitoring",
            AgentKind::Scribe => "scribe",
            AgentKind::Triage => "triage",
            AgentKind::Clinical => "clinical",
            AgentKind::AIDoctor => "ai_doctor",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| GatewayError::AgentUnknown(s.to_string()))
    }
}

/// Priority levels for task scheduling.
///
/// Smaller ordinal dispatches earlier: a `Critical` task is always selected
/// over a `Low` task regardless of age. Within one priority class tasks
/// drain FIFO by submit time.
///
/// # Examples
/// ```
/// use gateway_core::types::Priority;
///
/// assert!(Priority::Critical.ordinal() < Priority::Low.ordinal());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Interactive or triage-critical requests that must not wait
    Critical = 0,
    /// Latency-sensitive requests
    High = 1,
    /// Standard priority for regular requests
    Normal = 2,
    /// Bulk or backfill work that can wait
    Low = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Dispatch ordinal; smaller dispatches earlier.
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ordinal().cmp(&other.ordinal())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One turn of an OpenAI-style conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new<R: Into<String>, C: Into<String>>(role: R, content: C) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Status machine for async tasks.
///
/// Transitions form a DAG: `Queued -> {Batching, Processing} ->
/// {Completed, Failed}` plus the cancel edge `Queued -> Cancelled`
/// (also honored from `Batching` while the collation window is open).
/// A task never re-enters an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Batching,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Client-visible error taxonomy.
///
/// The synchronous chat path surfaces these as HTTP statuses; the async
/// path surfaces the same kinds through the result channel. External
/// provider failures are never represented here: the failover wrapper
/// swallows them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum GatewayError {
    #[error("unknown agent kind: {0}")]
    AgentUnknown(String),

    #[error("rate limit exceeded; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("task queue is full")]
    RejectedFull,

    #[error("no viable dispatch target under current GPU pressure")]
    BackpressureRetry { retry_after_secs: u64 },

    #[error("upstream worker did not respond within the deadline")]
    UpstreamTimeout,

    #[error("no upstream worker available after exhausting retries")]
    UpstreamUnavailable,

    #[error("upstream returned an unusable response: {0}")]
    UpstreamBadResponse(String),

    #[error("task was cancelled before processing")]
    Cancelled,

    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(String),
}

impl GatewayError {
    /// Stable machine-readable kind for audit records and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::AgentUnknown(_) => "agent_unknown",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::RejectedFull => "rejected_full",
            GatewayError::BackpressureRetry { .. } => "backpressure_retry",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::UpstreamUnavailable => "upstream_unavailable",
            GatewayError::UpstreamBadResponse(_) => "upstream_bad_response",
            GatewayError::Cancelled => "cancelled",
            GatewayError::InternalInvariantViolation(_) => "internal_invariant_violation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_dispatch_order() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }

    #[test]
    fn test_agent_kind_round_trip() {
        for kind in AgentKind::ALL {
            let parsed: AgentKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_agent_kind_rejects_unknown() {
        let err = "quantum_ml".parse::<AgentKind>().unwrap_err();
        assert!(matches!(err, GatewayError::AgentUnknown(_)));
    }

    #[test]
    fn test_agent_kind_wire_names() {
        let json = serde_json::to_string(&AgentKind::MedicalQA).unwrap();
        assert_eq!(json, "\"medical_qa\"");
        let json = serde_json::to_string(&AgentKind::AIDoctor).unwrap();
        assert_eq!(json, "\"ai_doctor\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Batching.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(GatewayError::RejectedFull.kind(), "rejected_full");
        assert_eq!(
            GatewayError::RateLimited {
                retry_after_secs: 5
            }
            .kind(),
            "rate_limited"
        );
    }
}
