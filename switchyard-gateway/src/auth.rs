//! Caller authentication middleware.
//!
//! Every API route requires `Authorization: Bearer <key>` matching the
//! master key or one of the configured API keys. Health probes and the
//! metrics scrape are exempt; they must answer locally even when the
//! caller has no credentials. Keys with a configured per-minute budget
//! are counted in a fixed one-minute window and rejected with 429 once
//! the budget is spent.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;

use crate::gateway_error::GatewayError;
use crate::server::AppState;

/// Per-key request counter over a one-minute fixed window.
#[derive(Debug)]
pub struct CallerRateLimiter {
    windows: DashMap<String, (u64, AtomicU32)>,
    epoch: Instant,
}

impl Default for CallerRateLimiter {
    fn default() -> Self {
        Self {
            windows: DashMap::new(),
            epoch: Instant::now(),
        }
    }
}

impl CallerRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request for `key`; `false` once the minute's budget is
    /// exhausted.
    pub fn admit(&self, key: &str, limit: u32) -> bool {
        let minute = self.epoch.elapsed().as_secs() / 60;
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| (minute, AtomicU32::new(0)));
        if entry.0 != minute {
            *entry = (minute, AtomicU32::new(0));
        }
        entry.1.fetch_add(1, Ordering::Relaxed) < limit
    }
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, GatewayError> {
    let path = request.uri().path();
    if path.starts_with("/health") || path == "/metrics" {
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| GatewayError::Auth {
            message: "missing bearer token".to_string(),
        })?;

    let caller = state
        .config
        .caller_for_token(token)
        .ok_or_else(|| GatewayError::Auth {
            message: "invalid api key".to_string(),
        })?;

    if let Some(limit) = caller.requests_per_minute {
        if !state.caller_limiter.admit(&caller.name, limit) {
            tracing::warn!(caller = %caller.name, "caller over request budget");
            return Err(GatewayError::RateLimited {
                message: format!("caller '{}' exceeded {limit} requests per minute", caller.name),
            });
        }
    }

    Ok(next.run(request).await)
}
