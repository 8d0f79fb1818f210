//! Model resolution: canonical id (or alias, or provider-prefixed id)
//! plus a required-capability set, in; an ordered candidate list, out.
//!
//! Resolution is a pure function over a registry snapshot: the same
//! snapshot and the same input always yield the same list. Within-tier
//! rotation and load-aware reordering happen later, in the smart router.

use std::sync::Arc;

use crate::registry::{Capabilities, ProviderConfig, Registry};

/// Ephemeral per-request routing tuple.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: Arc<ProviderConfig>,
    /// Canonical model path this candidate was resolved through
    pub canonical: String,
    /// What the provider's `model` field will receive
    pub provider_model_id: String,
}

impl Candidate {
    pub fn key(&self) -> &str {
        &self.provider.key
    }

    pub fn tier(&self) -> u8 {
        self.provider.tier
    }

    pub fn quality(&self) -> u8 {
        self.provider.quality_score.unwrap_or(5)
    }
}

/// Resolve `model_id` into an ordered candidate list.
///
/// Ordering: tier ascending, then quality score descending, then
/// provider key lexicographically for determinism. An empty result is a
/// legal value; callers surface it as model-unavailable.
pub fn resolve(registry: &Registry, model_id: &str, required: &Capabilities) -> Vec<Candidate> {
    let mut candidates = collect(registry, model_id, required, None);

    // "key/suffix" pins resolution to one provider: the suffix resolves
    // through that provider's bindings, or verbatim through its raw
    // model list.
    if candidates.is_empty() {
        if let Some((prefix, suffix)) = model_id.split_once('/') {
            if let Some(provider) = registry.provider(prefix) {
                candidates = collect(registry, suffix, required, Some(prefix));
                if candidates.is_empty() && provider.enabled && provider.models.contains(suffix) {
                    candidates.push(Candidate {
                        provider: Arc::clone(provider),
                        canonical: suffix.to_string(),
                        provider_model_id: suffix.to_string(),
                    });
                }
            }
        }
    }

    candidates.sort_by(|a, b| {
        a.tier()
            .cmp(&b.tier())
            .then(b.quality().cmp(&a.quality()))
            .then(a.key().cmp(b.key()))
    });
    candidates
}

fn collect(
    registry: &Registry,
    model_id: &str,
    required: &Capabilities,
    only_provider: Option<&str>,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    for canonical_id in expand(registry, model_id) {
        let Some(model) = registry.canonical_model(&canonical_id) else {
            continue;
        };
        if !model.capabilities.satisfies(required) {
            continue;
        }
        for binding in registry.bindings_for(&canonical_id) {
            if !binding.available {
                continue;
            }
            if only_provider.is_some_and(|key| key != binding.provider) {
                continue;
            }
            let Some(provider) = registry.provider(&binding.provider) else {
                continue;
            };
            if !provider.enabled {
                continue;
            }
            if required.streaming && !provider.kind.supports_streaming() {
                continue;
            }
            out.push(Candidate {
                provider: Arc::clone(provider),
                canonical: canonical_id.clone(),
                provider_model_id: binding.provider_model_id.clone(),
            });
        }
    }
    out
}

/// Expand an alias into its target canonical ids in declared order,
/// deduplicated keeping the first occurrence. A non-alias id expands to
/// itself.
fn expand(registry: &Registry, model_id: &str) -> Vec<String> {
    match registry.resolve_alias(model_id) {
        Some(targets) => {
            let mut seen = Vec::new();
            for target in targets {
                if !seen.contains(target) {
                    seen.push(target.clone());
                }
            }
            seen
        }
        None => vec![model_id.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryDocument;

    fn registry() -> Registry {
        let toml = r#"
            [providers.alpha]
            type = "openai-compatible"
            tier = 0
            endpoint = "https://alpha.example.com/v1"
            quality_score = 7
            models = ["meta-llama-3"]

            [providers.beta]
            type = "openai-compatible"
            tier = 1
            endpoint = "https://beta.example.com/v1"
            quality_score = 9

            [providers.gamma]
            type = "gemini-native"
            tier = 0
            quality_score = 9

            [providers.paused]
            type = "openai-compatible"
            tier = 0
            endpoint = "https://paused.example.com/v1"
            enabled = false

            [[models]]
            id = "llama-3.3-70b"
            family = "llama"
            context_window = 131072
            max_output_tokens = 8192
            capabilities = { streaming = true, tools = true }

            [[models]]
            id = "llama-3.1-8b"
            family = "llama"
            context_window = 131072
            max_output_tokens = 8192
            capabilities = { streaming = true }

            [aliases]
            llama = ["llama-3.3-70b", "llama-3.1-8b", "llama-3.3-70b"]

            [[bindings]]
            provider = "alpha"
            model = "llama-3.3-70b"
            provider_model_id = "meta-llama-3"

            [[bindings]]
            provider = "beta"
            model = "llama-3.3-70b"
            provider_model_id = "accounts/llama-3p3-70b"

            [[bindings]]
            provider = "gamma"
            model = "llama-3.3-70b"
            provider_model_id = "gemini-llama-shim"

            [[bindings]]
            provider = "paused"
            model = "llama-3.3-70b"
            provider_model_id = "llama-70b"

            [[bindings]]
            provider = "beta"
            model = "llama-3.1-8b"
            provider_model_id = "accounts/llama-3p1-8b"
        "#;
        let doc: RegistryDocument = toml::from_str(toml).unwrap();
        Registry::from_document(doc).unwrap()
    }

    #[test]
    fn tiers_are_non_decreasing() {
        let registry = registry();
        let candidates = resolve(&registry, "llama-3.3-70b", &Capabilities::default());
        let tiers: Vec<u8> = candidates.iter().map(Candidate::tier).collect();
        let mut sorted = tiers.clone();
        sorted.sort_unstable();
        assert_eq!(tiers, sorted);
        assert!(!candidates.is_empty());
    }

    #[test]
    fn disabled_providers_are_dropped() {
        let registry = registry();
        let candidates = resolve(&registry, "llama-3.3-70b", &Capabilities::default());
        assert!(candidates.iter().all(|c| c.key() != "paused"));
    }

    #[test]
    fn quality_breaks_ties_within_a_tier() {
        let registry = registry();
        let candidates = resolve(&registry, "llama-3.3-70b", &Capabilities::default());
        // gamma (tier 0, quality 9) ahead of alpha (tier 0, quality 7)
        assert_eq!(candidates[0].key(), "gamma");
        assert_eq!(candidates[1].key(), "alpha");
        assert_eq!(candidates[2].key(), "beta");
    }

    #[test]
    fn streaming_requirement_drops_non_streaming_kinds() {
        let registry = registry();
        let required = Capabilities {
            streaming: true,
            ..Default::default()
        };
        let candidates = resolve(&registry, "llama-3.3-70b", &required);
        assert!(candidates.iter().all(|c| c.key() != "gamma"));
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn alias_expansion_is_stable_and_deduplicated() {
        let registry = registry();
        let candidates = resolve(&registry, "llama", &Capabilities::default());
        // 70b candidates first (declared first in the alias), 8b after;
        // the duplicate alias target adds nothing.
        let seventy: Vec<_> = candidates
            .iter()
            .filter(|c| c.canonical == "llama-3.3-70b")
            .collect();
        assert_eq!(seventy.len(), 3);
        assert_eq!(
            candidates
                .iter()
                .filter(|c| c.canonical == "llama-3.1-8b")
                .count(),
            1
        );
    }

    #[test]
    fn provider_prefix_pins_resolution_through_bindings() {
        let registry = registry();
        let candidates = resolve(&registry, "alpha/llama-3.3-70b", &Capabilities::default());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].key(), "alpha");
        assert_eq!(candidates[0].provider_model_id, "meta-llama-3");
    }

    #[test]
    fn provider_prefix_accepts_raw_provider_models() {
        let registry = registry();
        let candidates = resolve(&registry, "alpha/meta-llama-3", &Capabilities::default());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider_model_id, "meta-llama-3");

        assert!(resolve(&registry, "alpha/not-a-model", &Capabilities::default()).is_empty());
    }

    #[test]
    fn resolution_is_deterministic() {
        let registry = registry();
        let a = resolve(&registry, "llama", &Capabilities::default());
        let b = resolve(&registry, "llama", &Capabilities::default());
        let keys = |cs: &[Candidate]| cs.iter().map(|c| c.key().to_string()).collect::<Vec<_>>();
        assert_eq!(keys(&a), keys(&b));
    }
}
