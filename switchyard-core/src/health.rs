//! Per-provider health with cooldown expiry.
//!
//! One cell per provider in a `DashMap`; every operation touches exactly
//! one cell, so a hot `is_healthy` check never contends with updates to
//! other providers. The cooldown transition back to healthy is lazy:
//! nothing flips state on a timer, a provider simply reads as healthy
//! once `cooldown_until` has passed.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Default)]
struct HealthEntry {
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
    last_latency_ms: Option<u64>,
}

impl HealthEntry {
    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Default)]
pub struct HealthStore {
    entries: DashMap<String, HealthEntry>,
}

impl HealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider with no recorded failures is healthy; a provider in
    /// cooldown becomes healthy again the moment the cooldown expires.
    pub fn is_healthy(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) => !entry.in_cooldown(Instant::now()),
            None => true,
        }
    }

    /// Record a successful attempt. Returns `true` when the provider was
    /// in cooldown and this success cleared it (a health transition).
    pub fn mark_success(&self, key: &str, latency_ms: u64) -> bool {
        let mut entry = self.entries.entry(key.to_string()).or_default();
        let was_cooling = entry.in_cooldown(Instant::now());
        entry.cooldown_until = None;
        entry.consecutive_failures = 0;
        entry.last_latency_ms = Some(latency_ms);
        was_cooling
    }

    /// Record a failed attempt with the given cooldown. A new failure
    /// extends an existing cooldown, never shrinks it. Returns `true`
    /// when the provider transitioned from healthy to cooling down.
    pub fn mark_failure(&self, key: &str, cooldown: Duration) -> bool {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_default();
        let was_healthy = !entry.in_cooldown(now);
        let proposed = now + cooldown;
        entry.cooldown_until = Some(match entry.cooldown_until {
            Some(existing) => existing.max(proposed),
            None => proposed,
        });
        entry.consecutive_failures += 1;
        was_healthy
    }

    pub fn consecutive_failures(&self, key: &str) -> u32 {
        self.entries
            .get(key)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }

    /// Remaining cooldown, if the provider is currently cooling down.
    pub fn cooldown_remaining(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries.get(key).and_then(|e| {
            e.cooldown_until
                .filter(|until| *until > now)
                .map(|until| until - now)
        })
    }

    /// Drop entries for providers no longer present in the registry.
    pub fn prune<F: Fn(&str) -> bool>(&self, is_live: F) {
        self.entries.retain(|key, _| is_live(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_providers_are_healthy() {
        let store = HealthStore::new();
        assert!(store.is_healthy("never-seen"));
    }

    #[tokio::test]
    async fn failure_puts_provider_in_cooldown_until_expiry() {
        let store = HealthStore::new();
        let entered = store.mark_failure("p", Duration::from_millis(40));
        assert!(entered);
        assert!(!store.is_healthy("p"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.is_healthy("p"));
    }

    #[tokio::test]
    async fn success_clears_cooldown_and_failure_count() {
        let store = HealthStore::new();
        store.mark_failure("p", Duration::from_secs(60));
        store.mark_failure("p", Duration::from_secs(60));
        assert_eq!(store.consecutive_failures("p"), 2);
        assert!(!store.is_healthy("p"));

        let cleared = store.mark_success("p", 120);
        assert!(cleared);
        assert!(store.is_healthy("p"));
        assert_eq!(store.consecutive_failures("p"), 0);
    }

    #[tokio::test]
    async fn new_failures_extend_but_never_shrink_cooldown() {
        let store = HealthStore::new();
        store.mark_failure("p", Duration::from_secs(60));
        let long = store.cooldown_remaining("p").unwrap();

        store.mark_failure("p", Duration::from_millis(10));
        let after_short = store.cooldown_remaining("p").unwrap();
        // the shorter cooldown must not have shrunk the longer one
        assert!(after_short >= long - Duration::from_millis(50));

        store.mark_failure("p", Duration::from_secs(120));
        let after_long = store.cooldown_remaining("p").unwrap();
        assert!(after_long > long);
    }

    #[tokio::test]
    async fn prune_drops_removed_providers() {
        let store = HealthStore::new();
        store.mark_failure("kept", Duration::from_secs(60));
        store.mark_failure("dropped", Duration::from_secs(60));

        store.prune(|key| key == "kept");
        assert!(!store.is_healthy("kept"));
        assert!(store.is_healthy("dropped"));
    }
}
