//! Utility functions and helpers for the gateway
//!
//! Small shared helpers for identifiers, timestamps, and token estimation.

use crate::types::ChatMessage;

pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn timestamp_nanos() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Rough token estimate when the upstream omits usage accounting.
///
/// Uses the common ~4 chars/token heuristic; a non-empty text always counts
/// as at least one token.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    ((text.chars().count() as u32) / 4).max(1)
}

/// Estimated prompt token count across a full message list.
pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u32 {
    messages
        .iter()
        .map(|m| estimate_tokens(&m.content) + estimate_tokens(&m.role))
        .sum()
}
