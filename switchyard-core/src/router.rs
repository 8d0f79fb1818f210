//! Smart router: turns resolver output into the per-request trial order.
//!
//! Candidates are partitioned by tier and reordered within each tier by
//! the configured strategy; tiers always concatenate lowest first, so a
//! strategy can never promote a backup tier above a primary one. Health
//! and quota are deliberately *not* consulted here; the dispatch loop
//! checks them at the moment of each attempt, so skips reflect current
//! state rather than state at routing time.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::registry::{Capabilities, Registry};
use crate::resolver::{self, Candidate};

/// Within-tier ordering strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Rotate a cursor per (model, tier) so concurrent requests spread
    /// across equivalent providers
    #[default]
    RoundRobin,
    /// Providers with the fewest recorded attempts first
    LeastLoaded,
    /// Keep the resolver's quality ordering
    Priority,
}

pub struct SmartRouter {
    strategy: RoutingStrategy,
    /// Rotation cursors keyed by (model, tier)
    cursors: DashMap<(String, u8), AtomicU64>,
    /// Attempt counts per provider, feeding LeastLoaded
    attempts: DashMap<String, AtomicU64>,
}

impl SmartRouter {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            cursors: DashMap::new(),
            attempts: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Ordered candidate list for one request. Tier boundaries from the
    /// resolver are preserved; only the order within a tier changes.
    pub fn candidates(
        &self,
        registry: &Registry,
        model_id: &str,
        streaming_required: bool,
    ) -> Vec<Candidate> {
        let required = Capabilities {
            streaming: streaming_required,
            ..Default::default()
        };
        let resolved = resolver::resolve(registry, model_id, &required);

        let mut out = Vec::with_capacity(resolved.len());
        let mut start = 0;
        while start < resolved.len() {
            let tier = resolved[start].tier();
            let mut end = start;
            while end < resolved.len() && resolved[end].tier() == tier {
                end += 1;
            }
            let mut group: Vec<Candidate> = resolved[start..end].to_vec();
            self.order_within_tier(model_id, tier, &mut group);
            out.append(&mut group);
            start = end;
        }
        out
    }

    /// Record that the dispatch loop is attempting this provider.
    pub fn note_attempt(&self, key: &str) {
        self.attempts
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Drop state for providers no longer present in the registry.
    /// Rotation cursors restart from zero after a reload.
    pub fn prune<F: Fn(&str) -> bool>(&self, is_live: F) {
        self.attempts.retain(|key, _| is_live(key));
        self.cursors.clear();
    }

    fn order_within_tier(&self, model_id: &str, tier: u8, group: &mut [Candidate]) {
        if group.len() < 2 {
            return;
        }
        match self.strategy {
            RoutingStrategy::Priority => {}
            RoutingStrategy::RoundRobin => {
                let cursor = self
                    .cursors
                    .entry((model_id.to_string(), tier))
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
                group.rotate_left((cursor as usize) % group.len());
            }
            RoutingStrategy::LeastLoaded => {
                group.sort_by_key(|c| {
                    self.attempts
                        .get(c.key())
                        .map(|a| a.load(Ordering::Relaxed))
                        .unwrap_or(0)
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryDocument;

    fn registry() -> Registry {
        let toml = r#"
            [providers.a0]
            type = "openai-compatible"
            tier = 0
            endpoint = "https://a0.example.com/v1"
            quality_score = 9

            [providers.b0]
            type = "openai-compatible"
            tier = 0
            endpoint = "https://b0.example.com/v1"
            quality_score = 6

            [providers.c1]
            type = "openai-compatible"
            tier = 1
            endpoint = "https://c1.example.com/v1"

            [[models]]
            id = "m"
            family = "test"
            context_window = 8192
            max_output_tokens = 2048
            capabilities = { streaming = true }

            [[bindings]]
            provider = "a0"
            model = "m"
            provider_model_id = "a0-m"

            [[bindings]]
            provider = "b0"
            model = "m"
            provider_model_id = "b0-m"

            [[bindings]]
            provider = "c1"
            model = "m"
            provider_model_id = "c1-m"
        "#;
        let doc: RegistryDocument = toml::from_str(toml).unwrap();
        Registry::from_document(doc).unwrap()
    }

    fn keys(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(Candidate::key).collect()
    }

    #[test]
    fn tiers_concatenate_lowest_first_regardless_of_strategy() {
        let registry = registry();
        for strategy in [
            RoutingStrategy::RoundRobin,
            RoutingStrategy::LeastLoaded,
            RoutingStrategy::Priority,
        ] {
            let router = SmartRouter::new(strategy);
            let candidates = router.candidates(&registry, "m", false);
            assert_eq!(candidates.len(), 3);
            assert_eq!(candidates.last().unwrap().key(), "c1");
            let tiers: Vec<u8> = candidates.iter().map(Candidate::tier).collect();
            assert!(tiers.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn round_robin_rotates_within_the_tier_across_requests() {
        let registry = registry();
        let router = SmartRouter::new(RoutingStrategy::RoundRobin);

        let first_candidates = router.candidates(&registry, "m", false);
        let first = keys(&first_candidates);
        let second_candidates = router.candidates(&registry, "m", false);
        let second = keys(&second_candidates);
        let third_candidates = router.candidates(&registry, "m", false);
        let third = keys(&third_candidates);

        assert_ne!(first[0], second[0]);
        assert_eq!(first[0], third[0]);
    }

    #[test]
    fn priority_keeps_quality_ordering() {
        let registry = registry();
        let router = SmartRouter::new(RoutingStrategy::Priority);
        let candidates = router.candidates(&registry, "m", false);
        assert_eq!(keys(&candidates), vec!["a0", "b0", "c1"]);
    }

    #[test]
    fn least_loaded_prefers_quieter_providers() {
        let registry = registry();
        let router = SmartRouter::new(RoutingStrategy::LeastLoaded);

        router.note_attempt("a0");
        router.note_attempt("a0");
        router.note_attempt("b0");

        let candidates = router.candidates(&registry, "m", false);
        assert_eq!(candidates[0].key(), "b0");
    }
}
