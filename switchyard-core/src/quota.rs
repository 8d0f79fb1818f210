//! Per-provider sliding-window request and token accounting.
//!
//! Each provider with a configured RPM or TPM limit gets a 60-second
//! window decomposed into six 10-second buckets, rotated lazily on
//! access. Rotation and summation are O(buckets) under the single entry
//! lock, so the tracker adds no cross-provider contention. Requests are
//! counted at attempt initiation; tokens are added once usage is known.

use std::time::Instant;

use dashmap::DashMap;

use crate::registry::ProviderConfig;

const BUCKETS: usize = 6;
/// Bucket width in milliseconds; six of these make the 60-second window.
const DEFAULT_BUCKET_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    slot: u64,
    requests: u32,
    tokens: u64,
}

#[derive(Debug)]
struct Window {
    buckets: [Bucket; BUCKETS],
}

impl Window {
    fn new() -> Self {
        Self {
            buckets: [Bucket::default(); BUCKETS],
        }
    }

    fn bucket_at(&mut self, slot: u64) -> &mut Bucket {
        let bucket = &mut self.buckets[(slot as usize) % BUCKETS];
        if bucket.slot != slot {
            *bucket = Bucket {
                slot,
                requests: 0,
                tokens: 0,
            };
        }
        bucket
    }

    fn totals(&self, now_slot: u64) -> (u32, u64) {
        let oldest = now_slot.saturating_sub(BUCKETS as u64 - 1);
        self.buckets
            .iter()
            .filter(|b| b.slot >= oldest && b.slot <= now_slot)
            .fold((0, 0), |(r, t), b| (r + b.requests, t + b.tokens))
    }
}

#[derive(Debug)]
pub struct QuotaTracker {
    windows: DashMap<String, Window>,
    epoch: Instant,
    bucket_ms: u64,
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::with_bucket_ms(DEFAULT_BUCKET_MS)
    }

    /// Narrow buckets are only useful in tests.
    pub fn with_bucket_ms(bucket_ms: u64) -> Self {
        Self {
            windows: DashMap::new(),
            epoch: Instant::now(),
            bucket_ms,
        }
    }

    fn now_slot(&self) -> u64 {
        (self.epoch.elapsed().as_millis() as u64) / self.bucket_ms
    }

    /// Quota veto: `false` when admitting one more request would exceed
    /// the provider's RPM limit, or its TPM budget is already exhausted.
    /// Providers without configured limits are never vetoed.
    pub fn check(&self, provider: &ProviderConfig) -> bool {
        if provider.rate_limit_rpm.is_none() && provider.rate_limit_tpm.is_none() {
            return true;
        }
        let now_slot = self.now_slot();
        let (requests, tokens) = self
            .windows
            .get(&provider.key)
            .map(|w| w.totals(now_slot))
            .unwrap_or((0, 0));

        if provider
            .rate_limit_rpm
            .is_some_and(|limit| requests + 1 > limit)
        {
            return false;
        }
        if provider.rate_limit_tpm.is_some_and(|limit| tokens >= limit) {
            return false;
        }
        true
    }

    /// Count one request at attempt initiation.
    pub fn record_request(&self, key: &str) {
        let slot = self.now_slot();
        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(Window::new);
        window.bucket_at(slot).requests += 1;
    }

    /// Add consumed tokens once usage is known.
    pub fn record_usage(&self, key: &str, input_tokens: u32, output_tokens: u32) {
        let slot = self.now_slot();
        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(Window::new);
        window.bucket_at(slot).tokens += u64::from(input_tokens) + u64::from(output_tokens);
    }

    /// Current window totals, mainly for tests and admin introspection.
    pub fn window_totals(&self, key: &str) -> (u32, u64) {
        let now_slot = self.now_slot();
        self.windows
            .get(key)
            .map(|w| w.totals(now_slot))
            .unwrap_or((0, 0))
    }

    /// Drop windows for providers no longer present in the registry.
    pub fn prune<F: Fn(&str) -> bool>(&self, is_live: F) {
        self.windows.retain(|key, _| is_live(key));
    }
}
