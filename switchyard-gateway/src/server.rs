//! HTTP server assembly: application state, router, middleware stack
//! and the registry hot-reload entry point.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use switchyard_core::telemetry::MetricsSink;
use switchyard_core::Dispatcher;

use crate::auth::{auth_middleware, CallerRateLimiter};
use crate::config::Config;
use crate::handlers;
use crate::metrics::MetricsRegistry;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<MetricsRegistry>,
    pub caller_limiter: Arc<CallerRateLimiter>,
    pub started_at: Instant,
}

/// Build the router and its state from a validated configuration.
pub fn create_server(config: Config) -> anyhow::Result<(Router, AppState)> {
    let metrics = Arc::new(MetricsRegistry::new());
    let registry = config.build_registry()?;
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        config.routing.strategy,
        config.build_pipelines(),
        Arc::clone(&metrics) as Arc<dyn MetricsSink>,
    )?);

    let max_body_size = config.server.max_body_size;
    let state = AppState {
        config: Arc::new(config),
        dispatcher,
        metrics,
        caller_limiter: Arc::new(CallerRateLimiter::new()),
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/health/live", get(handlers::health_live))
        .route("/health/ready", get(handlers::health_ready))
        .route("/metrics", get(handlers::prometheus_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    auth_middleware,
                ))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .with_state(state.clone());

    Ok((app, state))
}

/// Re-read the configuration file and atomically swap the registry
/// snapshot. In-flight requests keep the snapshot they started with.
/// Server and auth sections take effect on restart only.
pub fn reload_registry(state: &AppState, config_path: &str) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    state.dispatcher.install_snapshot(config.build_registry()?)?;
    tracing::info!(path = %config_path, "registry snapshot reloaded");
    Ok(())
}
