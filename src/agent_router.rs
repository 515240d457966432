//! Agent router
//!
//! Maps each agent kind onto an ordered list of candidate logical model
//! names. The mapping is resolved once from configuration at startup;
//! health is not considered here, the balancer skips unhealthy entries.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::registry::WorkerRegistry;
use crate::types::AgentKind;

pub struct AgentRouter {
    map: HashMap<AgentKind, Vec<String>>,
    registry: Arc<WorkerRegistry>,
}

impl AgentRouter {
    pub fn from_config(config: &GatewayConfig, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            map: config.resolved_agent_map(),
            registry,
        }
    }

    /// Ordered candidates for an agent kind; never empty for admitted
    /// kinds (guaranteed by config resolution at startup).
    pub fn candidates(&self, kind: AgentKind) -> Vec<String> {
        self.map.get(&kind).cloned().unwrap_or_default()
    }

    /// Candidates whose declared context window meets the requirement.
    pub fn candidates_for_context(&self, kind: AgentKind, min_context_tokens: u32) -> Vec<String> {
        self.candidates(kind)
            .into_iter()
            .filter(|name| {
                self.registry
                    .get(name)
                    .map(|entry| entry.max_context_tokens >= min_context_tokens)
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerSettings;

    fn worker(name: &str, context: u32, preferred: &[&str]) -> WorkerSettings {
        WorkerSettings {
            logical_name: name.to_string(),
            endpoint_url: format!("http://127.0.0.1/{name}"),
            device_id: 0,
            declared_vram_gb: 4.0,
            max_context_tokens: context,
            preferred_for: preferred.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn router() -> AgentRouter {
        let mut config = GatewayConfig::default();
        config.workers = vec![
            worker("phi-mini", 4096, &["chat"]),
            worker("med-7b", 8192, &["claims", "medical_qa"]),
        ];
        config.agent_map.insert(
            "claims".to_string(),
            vec!["med-7b".to_string(), "phi-mini".to_string()],
        );

        let registry = Arc::new(WorkerRegistry::from_settings(&config.workers));
        AgentRouter::from_config(&config, registry)
    }

    #[test]
    fn test_explicit_mapping_preserves_order() {
        let router = router();
        assert_eq!(router.candidates(AgentKind::Claims), vec!["med-7b", "phi-mini"]);
    }

    #[test]
    fn test_every_kind_has_candidates() {
        let router = router();
        for kind in AgentKind::ALL {
            assert!(!router.candidates(kind).is_empty());
        }
    }

    #[test]
    fn test_context_filter_drops_small_windows() {
        let router = router();
        let candidates = router.candidates_for_context(AgentKind::Claims, 6000);
        assert_eq!(candidates, vec!["med-7b"]);

        let candidates = router.candidates_for_context(AgentKind::Claims, 2000);
        assert_eq!(candidates, vec!["med-7b", "phi-mini"]);
    }
}
