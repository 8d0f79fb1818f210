//! Prometheus metrics for the gateway.
//!
//! Implements the engine's [`MetricsSink`] on a registry of atomic
//! counters keyed by label tuples, and renders the Prometheus text
//! exposition format for the `/metrics` endpoint. Counter families:
//!
//! - `requests_total{status}`
//! - `attempts_total{provider,outcome}`
//! - `attempt_latency_ms_sum` / `attempt_latency_ms_count` per provider
//! - `tokens_total{provider,direction,estimated}`
//! - `health_transitions_total{provider,to_state}`

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use switchyard_core::telemetry::{Direction, MetricsSink};

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    requests: DashMap<String, AtomicU64>,
    attempts: DashMap<(String, String), AtomicU64>,
    latency: DashMap<String, (AtomicU64, AtomicU64)>,
    tokens: DashMap<(String, &'static str, bool), AtomicU64>,
    transitions: DashMap<(String, &'static str), AtomicU64>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump<K: Eq + std::hash::Hash>(map: &DashMap<K, AtomicU64>, key: K, by: u64) {
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(by, Ordering::Relaxed);
    }

    /// Render all counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "# HELP requests_total Terminal request outcomes.");
        let _ = writeln!(out, "# TYPE requests_total counter");
        for entry in self.requests.iter() {
            let _ = writeln!(
                out,
                "requests_total{{status=\"{}\"}} {}",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(out, "# HELP attempts_total Per-candidate attempt outcomes.");
        let _ = writeln!(out, "# TYPE attempts_total counter");
        for entry in self.attempts.iter() {
            let (provider, outcome) = entry.key();
            let _ = writeln!(
                out,
                "attempts_total{{provider=\"{}\",outcome=\"{}\"}} {}",
                provider,
                outcome,
                entry.value().load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(out, "# HELP attempt_latency_ms Attempt latency totals.");
        let _ = writeln!(out, "# TYPE attempt_latency_ms summary");
        for entry in self.latency.iter() {
            let (sum, count) = entry.value();
            let _ = writeln!(
                out,
                "attempt_latency_ms_sum{{provider=\"{}\"}} {}",
                entry.key(),
                sum.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "attempt_latency_ms_count{{provider=\"{}\"}} {}",
                entry.key(),
                count.load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(out, "# HELP tokens_total Tokens consumed per provider.");
        let _ = writeln!(out, "# TYPE tokens_total counter");
        for entry in self.tokens.iter() {
            let (provider, direction, estimated) = entry.key();
            let _ = writeln!(
                out,
                "tokens_total{{provider=\"{}\",direction=\"{}\",estimated=\"{}\"}} {}",
                provider,
                direction,
                estimated,
                entry.value().load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(
            out,
            "# HELP health_transitions_total Provider health state changes."
        );
        let _ = writeln!(out, "# TYPE health_transitions_total counter");
        for entry in self.transitions.iter() {
            let (provider, state) = entry.key();
            let _ = writeln!(
                out,
                "health_transitions_total{{provider=\"{}\",to_state=\"{}\"}} {}",
                provider,
                state,
                entry.value().load(Ordering::Relaxed)
            );
        }

        out
    }
}

impl MetricsSink for MetricsRegistry {
    fn record_request(&self, status: &'static str) {
        Self::bump(&self.requests, status.to_string(), 1);
    }

    fn record_attempt(&self, provider: &str, outcome: &str, latency: Duration) {
        Self::bump(
            &self.attempts,
            (provider.to_string(), outcome.to_string()),
            1,
        );
        let entry = self
            .latency
            .entry(provider.to_string())
            .or_insert_with(|| (AtomicU64::new(0), AtomicU64::new(0)));
        entry.0.fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        entry.1.fetch_add(1, Ordering::Relaxed);
    }

    fn record_tokens(&self, provider: &str, direction: Direction, count: u64, estimated: bool) {
        Self::bump(
            &self.tokens,
            (provider.to_string(), direction.as_str(), estimated),
            count,
        );
    }

    fn record_health_transition(&self, provider: &str, to_state: &'static str) {
        Self::bump(&self.transitions, (provider.to_string(), to_state), 1);
    }
}
