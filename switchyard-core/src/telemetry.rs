//! Metrics seam between the dispatch engine and whatever backend the
//! embedding process uses.
//!
//! The engine reports at request and candidate boundaries through
//! [`MetricsSink`]; the gateway implements it on its Prometheus
//! registry. Spans and structured logs are emitted directly with
//! `tracing` at the call sites.

use std::time::Duration;

/// Token direction label for `tokens_total{provider,direction}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

/// Sink for engine-level counters. All methods default to no-ops so
/// embedders only implement what they export.
pub trait MetricsSink: Send + Sync {
    /// One terminal outcome per dispatched request.
    fn record_request(&self, _status: &'static str) {}

    /// One record per attempted candidate.
    fn record_attempt(&self, _provider: &str, _outcome: &str, _latency: Duration) {}

    /// Tokens consumed on a provider, flagged when estimated rather than
    /// provider-reported.
    fn record_tokens(&self, _provider: &str, _direction: Direction, _count: u64, _estimated: bool) {
    }

    /// Provider health transition (into or out of cooldown).
    fn record_health_transition(&self, _provider: &str, _to_state: &'static str) {}
}

/// Sink that drops everything; the default for embedders that do not
/// export metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {}
