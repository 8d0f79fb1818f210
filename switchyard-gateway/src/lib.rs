//! # Switchyard Gateway
//!
//! The HTTP surface of the Switchyard inference gateway: an axum server
//! exposing an OpenAI-compatible chat completions API in front of the
//! routing and resilience engine in `switchyard-core`.
//!
//! ## Endpoints
//!
//! - `POST /v1/chat/completions`; unary JSON or SSE streaming
//! - `GET /v1/models`; canonical ids the gateway accepts
//! - `GET /health/live`, `GET /health/ready`; local health probes
//! - `GET /metrics`; Prometheus scrape
//!
//! Callers authenticate with `Authorization: Bearer <key>` against the
//! configured master key or per-tenant API keys. SIGHUP re-reads the
//! configuration file and atomically swaps the registry snapshot.

pub mod auth;
pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod metrics;
pub mod server;

pub use config::Config;
pub use gateway_error::GatewayError;
pub use server::{create_server, reload_registry, AppState};
