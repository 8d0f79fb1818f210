//! # Switchyard Core
//!
//! The routing, resilience and streaming engine behind the Switchyard
//! inference gateway. Given an OpenAI-compatible chat request and a
//! catalog of heterogeneous upstream providers, the engine resolves the
//! requested model into an ordered candidate list, rotates through it
//! with per-provider health and quota checks, executes each attempt
//! through a retry/timeout pipeline, and returns the first fully
//! initiated response; unary JSON or a decorated chunk stream.
//!
//! ## Architecture
//!
//! - [`registry`]: read-only catalog snapshot: providers, canonical
//!   models, aliases, bindings. Swapped atomically on config reload.
//! - [`resolver`]: pure resolution of a model id (or alias, or
//!   provider-prefixed id) into tier-ordered candidates.
//! - [`router`]: within-tier ordering: round-robin, least-loaded or
//!   priority.
//! - [`health`] / [`quota`]: per-provider cooldown and sliding-window
//!   RPM/TPM state, one lock per entry.
//! - [`resilience`]: named pipelines: per-attempt timeout, jittered
//!   exponential backoff, cancellation-aware.
//! - [`adapters`]: stateless translators between the normalized types
//!   and each provider wire protocol family.
//! - [`dispatch`]: the candidate rotation loop tying it all together.
//! - [`telemetry`]: the metrics seam the embedding process implements.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use switchyard_core::{
//!     ChatRequest, Dispatcher, Message, PipelineRegistry, Registry,
//!     RegistryDocument, RoutingStrategy, telemetry::NoopSink,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let doc: RegistryDocument = toml::from_str(CONFIG)?;
//! let dispatcher = Dispatcher::new(
//!     Registry::from_document(doc)?,
//!     RoutingStrategy::RoundRobin,
//!     PipelineRegistry::new(),
//!     Arc::new(NoopSink),
//! )?;
//!
//! let response = dispatcher
//!     .get_response(
//!         ChatRequest {
//!             model: "llama-3.3-70b".to_string(),
//!             messages: vec![Message::user("hello")],
//!             ..Default::default()
//!         },
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{:?} served by {:?}", response.id, response.provider_name);
//! ```

pub mod adapters;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod models;
pub mod quota;
pub mod registry;
pub mod resilience;
pub mod resolver;
pub mod router;
pub mod telemetry;

pub use dispatch::{DispatchStream, Dispatcher};
pub use error::{AdapterError, AttemptFailure, DispatchError, FailureClass, FailureReport};
pub use health::HealthStore;
pub use models::{
    ChatRequest, ChatResponse, Choice, Delta, Message, Role, StreamChoice, StreamChunk, Usage,
};
pub use quota::QuotaTracker;
pub use registry::{
    AdapterKind, CanonicalModel, Capabilities, ModelBinding, ProviderConfig, Registry,
    RegistryDocument, RegistryError,
};
pub use resilience::{PipelineRegistry, ResiliencePipeline, RetryPolicy, PROVIDER_RETRY};
pub use resolver::Candidate;
pub use router::{RoutingStrategy, SmartRouter};
