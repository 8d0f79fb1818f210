//! In-memory model catalog.
//!
//! The registry is a read-only snapshot built once per configuration
//! load: providers, canonical models, aliases and provider↔model
//! bindings. The dispatch engine holds it behind an atomic pointer and
//! swaps the whole snapshot on reload, so queries here never lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-protocol family a provider speaks. A closed set: new provider
/// types are added by registering an adapter for a new kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterKind {
    /// OpenAI-compatible JSON body and SSE stream
    #[serde(rename = "openai-compatible")]
    OpenAiCompat,
    /// Google Gemini `generateContent` wire format; no native streaming
    #[serde(rename = "gemini-native")]
    GeminiNative,
    /// Minimal SSE backend speaking bare text frames (browser-session tier)
    #[serde(rename = "sse-text")]
    SseText,
}

impl AdapterKind {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "openai-compatible" => Some(AdapterKind::OpenAiCompat),
            "gemini-native" => Some(AdapterKind::GeminiNative),
            "sse-text" => Some(AdapterKind::SseText),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::OpenAiCompat => "openai-compatible",
            AdapterKind::GeminiNative => "gemini-native",
            AdapterKind::SseText => "sse-text",
        }
    }

    /// Whether this wire protocol can stream natively. Kinds that cannot
    /// are dropped from candidate lists when the request requires
    /// streaming; their `execute_streaming` still works by yielding a
    /// single aggregated update.
    pub fn supports_streaming(&self) -> bool {
        !matches!(self, AdapterKind::GeminiNative)
    }

    pub fn default_endpoint(&self) -> Option<&'static str> {
        match self {
            AdapterKind::GeminiNative => Some("https://generativelanguage.googleapis.com"),
            AdapterKind::OpenAiCompat | AdapterKind::SseText => None,
        }
    }
}

/// Immutable per-load provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Unique gateway-local key, also the failover-prefix namespace
    pub key: String,
    pub kind: AdapterKind,
    pub enabled: bool,
    /// Failover priority; 0 is tried first
    pub tier: u8,
    /// Provider-local model ids this provider accepts directly
    pub models: BTreeSet<String>,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub account_id: Option<String>,
    pub rate_limit_rpm: Option<u32>,
    pub rate_limit_tpm: Option<u64>,
    pub is_free: bool,
    /// 1..=10, higher is better; breaks ties within a tier
    pub quality_score: Option<u8>,
    pub headers: HashMap<String, String>,
}

/// Capability flags of a canonical model, doubling as a required-set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub streaming: bool,
    pub tools: bool,
    pub vision: bool,
    pub audio: bool,
    pub structured_output: bool,
    pub reasoning: bool,
}

impl Capabilities {
    /// True when every flag set in `required` is also set here.
    pub fn satisfies(&self, required: &Capabilities) -> bool {
        (!required.streaming || self.streaming)
            && (!required.tools || self.tools)
            && (!required.vision || self.vision)
            && (!required.audio || self.audio)
            && (!required.structured_output || self.structured_output)
            && (!required.reasoning || self.reasoning)
    }
}

/// Gateway-global model abstracting over provider-specific names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalModel {
    pub id: String,
    pub family: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    /// USD per million tokens
    #[serde(default)]
    pub input_price: f64,
    #[serde(default)]
    pub output_price: f64,
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// One provider's implementation of a canonical model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBinding {
    pub provider: String,
    /// Canonical model id
    pub model: String,
    /// What the provider expects in its `model` field
    pub provider_model_id: String,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default)]
    pub input_price: Option<f64>,
    #[serde(default)]
    pub output_price: Option<f64>,
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    #[serde(default)]
    pub rate_limit_tpm: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// Serde shape of a provider entry in the configuration document. The
/// adapter kind stays a string here so an unknown tag fails load with a
/// named error instead of a bare serde message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tier: u8,
    #[serde(default)]
    pub models: BTreeSet<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    #[serde(default)]
    pub rate_limit_tpm: Option<u64>,
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    pub quality_score: Option<u8>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// The registry portion of the configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub providers: HashMap<String, ProviderSpec>,
    #[serde(default)]
    pub models: Vec<CanonicalModel>,
    #[serde(default)]
    pub aliases: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub bindings: Vec<ModelBinding>,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("provider '{provider}' has unknown adapter type '{kind}'")]
    UnknownAdapterKind { provider: String, kind: String },

    #[error("provider '{provider}' needs an endpoint for adapter type '{kind}'")]
    MissingEndpoint { provider: String, kind: String },

    #[error("provider '{provider}' has quality_score {score}, expected 1..=10")]
    InvalidQualityScore { provider: String, score: u8 },

    #[error("canonical model '{id}' is declared more than once")]
    DuplicateModel { id: String },

    #[error("alias '{alias}' targets unknown model '{target}'")]
    MissingAliasTarget { alias: String, target: String },

    #[error("binding references unknown provider '{provider}'")]
    UnknownBindingProvider { provider: String },

    #[error("binding for provider '{provider}' references unknown model '{model}'")]
    UnknownBindingModel { provider: String, model: String },
}

/// Read-only snapshot of the model catalog.
#[derive(Debug, Default)]
pub struct Registry {
    providers: HashMap<String, Arc<ProviderConfig>>,
    models: HashMap<String, Arc<CanonicalModel>>,
    aliases: HashMap<String, Vec<String>>,
    /// canonical model id -> bindings, in declaration order
    bindings: HashMap<String, Vec<Arc<ModelBinding>>>,
}

impl Registry {
    /// Build and validate a snapshot from a configuration document.
    pub fn from_document(doc: RegistryDocument) -> Result<Self, RegistryError> {
        let mut providers = HashMap::new();
        for (key, spec) in doc.providers {
            let kind = AdapterKind::parse(&spec.kind).ok_or_else(|| {
                RegistryError::UnknownAdapterKind {
                    provider: key.clone(),
                    kind: spec.kind.clone(),
                }
            })?;
            if let Some(score) = spec.quality_score {
                if !(1..=10).contains(&score) {
                    return Err(RegistryError::InvalidQualityScore {
                        provider: key,
                        score,
                    });
                }
            }
            let endpoint = match spec.endpoint.or_else(|| {
                kind.default_endpoint().map(str::to_string)
            }) {
                Some(endpoint) => endpoint,
                None => {
                    return Err(RegistryError::MissingEndpoint {
                        provider: key,
                        kind: spec.kind,
                    })
                }
            };
            providers.insert(
                key.clone(),
                Arc::new(ProviderConfig {
                    key,
                    kind,
                    enabled: spec.enabled,
                    tier: spec.tier,
                    models: spec.models,
                    endpoint,
                    api_key: spec.api_key,
                    account_id: spec.account_id,
                    rate_limit_rpm: spec.rate_limit_rpm,
                    rate_limit_tpm: spec.rate_limit_tpm,
                    is_free: spec.is_free,
                    quality_score: spec.quality_score,
                    headers: spec.headers,
                }),
            );
        }

        let mut models: HashMap<String, Arc<CanonicalModel>> = HashMap::new();
        for model in doc.models {
            if models.contains_key(&model.id) {
                return Err(RegistryError::DuplicateModel { id: model.id });
            }
            models.insert(model.id.clone(), Arc::new(model));
        }

        for (alias, targets) in &doc.aliases {
            for target in targets {
                if !models.contains_key(target) {
                    return Err(RegistryError::MissingAliasTarget {
                        alias: alias.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        let mut bindings: HashMap<String, Vec<Arc<ModelBinding>>> = HashMap::new();
        for binding in doc.bindings {
            if !providers.contains_key(&binding.provider) {
                return Err(RegistryError::UnknownBindingProvider {
                    provider: binding.provider,
                });
            }
            if !models.contains_key(&binding.model) {
                return Err(RegistryError::UnknownBindingModel {
                    provider: binding.provider,
                    model: binding.model,
                });
            }
            bindings
                .entry(binding.model.clone())
                .or_default()
                .push(Arc::new(binding));
        }

        Ok(Self {
            providers,
            models,
            aliases: doc.aliases,
            bindings,
        })
    }

    pub fn provider(&self, key: &str) -> Option<&Arc<ProviderConfig>> {
        self.providers.get(key)
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<ProviderConfig>> {
        self.providers.values()
    }

    pub fn canonical_model(&self, id: &str) -> Option<&Arc<CanonicalModel>> {
        self.models.get(id)
    }

    pub fn resolve_alias(&self, name: &str) -> Option<&[String]> {
        self.aliases.get(name).map(Vec::as_slice)
    }

    pub fn bindings_for(&self, canonical_id: &str) -> &[Arc<ModelBinding>] {
        self.bindings
            .get(canonical_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Canonical ids the gateway will accept: those with at least one
    /// available binding to an enabled provider. Sorted for stable
    /// listings.
    pub fn advertised_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, rows)| {
                rows.iter().any(|b| {
                    b.available
                        && self
                            .providers
                            .get(&b.provider)
                            .is_some_and(|p| p.enabled)
                })
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}
