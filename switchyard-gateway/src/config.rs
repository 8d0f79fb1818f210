//! Gateway configuration: one TOML document covering the HTTP server,
//! caller authentication, routing and resilience settings, and the
//! model catalog (providers, canonical models, aliases, bindings) that
//! becomes the engine's registry snapshot.
//!
//! Reloading the file re-validates everything and atomically swaps the
//! registry snapshot; in-flight requests finish against the old one.
//!
//! ## Example
//!
//! ```toml
//! master_key = "sk-switchyard-master"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 3000
//! max_body_size = 31457280
//! request_timeout = "60s"
//!
//! [routing]
//! strategy = "round-robin"
//!
//! [providers.cerebras]
//! type = "openai-compatible"
//! tier = 0
//! endpoint = "https://api.cerebras.ai/v1"
//! api_key = "csk-..."
//! rate_limit_rpm = 30
//!
//! [[models]]
//! id = "llama-3.3-70b"
//! family = "llama"
//! context_window = 131072
//! max_output_tokens = 8192
//! capabilities = { streaming = true, tools = true }
//!
//! [[bindings]]
//! provider = "cerebras"
//! model = "llama-3.3-70b"
//! provider_model_id = "llama-3.3-70b"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use switchyard_core::{
    PipelineRegistry, Registry, RegistryDocument, ResiliencePipeline, RetryPolicy,
    RoutingStrategy, PROVIDER_RETRY,
};

pub const DEFAULT_MAX_BODY_SIZE: usize = 30 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Key every caller must present as `Authorization: Bearer <key>`
    pub master_key: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(flatten)]
    pub registry: RegistryDocument,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Inbound bodies above this are rejected with 413
    pub max_body_size: usize,
    /// Bounds the whole dispatch loop of one request
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Additional caller keys besides the master key, each with an optional
/// per-minute request budget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub api_keys: Vec<ApiKeyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub key: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub strategy: RoutingStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
    #[serde(with = "duration_str")]
    pub attempt_timeout: Duration,
    #[serde(with = "duration_str")]
    pub stream_initiation_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay: policy.base_delay,
            max_delay: policy.max_delay,
            attempt_timeout: Duration::from_secs(30),
            stream_initiation_timeout: Duration::from_secs(120),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.master_key.is_empty() {
            anyhow::bail!("master_key cannot be empty");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("server host cannot be empty");
        }
        if self.server.max_body_size == 0 {
            anyhow::bail!("max_body_size cannot be 0");
        }
        if self.resilience.max_attempts == 0 {
            anyhow::bail!("resilience max_attempts must be at least 1");
        }
        // surfaces catalog errors (unknown adapter type, duplicate
        // model, dangling alias/binding) at load time
        self.build_registry()?;
        Ok(())
    }

    /// Build a fresh registry snapshot from the catalog sections.
    pub fn build_registry(&self) -> anyhow::Result<Registry> {
        Ok(Registry::from_document(self.registry.clone())?)
    }

    /// Pipelines configured from the `[resilience]` section.
    pub fn build_pipelines(&self) -> PipelineRegistry {
        let mut pipelines = PipelineRegistry::new();
        pipelines.register(ResiliencePipeline::new(
            PROVIDER_RETRY,
            RetryPolicy {
                max_attempts: self.resilience.max_attempts,
                base_delay: self.resilience.base_delay,
                max_delay: self.resilience.max_delay,
                ..RetryPolicy::default()
            },
            self.resilience.attempt_timeout,
            self.resilience.stream_initiation_timeout,
        ));
        pipelines
    }

    /// Whether the presented bearer token belongs to a configured
    /// caller; returns its per-minute budget when one is set.
    pub fn caller_for_token(&self, token: &str) -> Option<Caller> {
        if token == self.master_key {
            return Some(Caller {
                name: "master".to_string(),
                requests_per_minute: None,
            });
        }
        self.auth
            .api_keys
            .iter()
            .find(|k| k.enabled && k.key == token)
            .map(|k| Caller {
                name: k.name.clone(),
                requests_per_minute: k.requests_per_minute,
            })
    }
}

/// An authenticated caller identity.
#[derive(Debug, Clone)]
pub struct Caller {
    pub name: String,
    pub requests_per_minute: Option<u32>,
}

/// Durations as human strings ("30s", "2m", "500ms") in TOML.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid duration '{raw}', expected e.g. \"30s\", \"2m\" or \"500ms\""
            ))
        })
    }

    fn parse(raw: &str) -> Option<Duration> {
        let raw = raw.trim();
        let (number, unit) = raw.split_at(raw.find(|c: char| c.is_ascii_alphabetic())?);
        let value: u64 = number.trim().parse().ok()?;
        match unit {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => Some(Duration::from_secs(value * 60)),
            "h" => Some(Duration::from_secs(value * 3600)),
            _ => None,
        }
    }

}
