//! Named resilience pipelines: per-attempt timeout plus retry with
//! jittered exponential backoff.
//!
//! A pipeline wraps a single provider attempt. Only transient failure
//! classes are retried, the delay doubles per attempt with ±jitter, and
//! the request-scoped cancellation token is honoured both between
//! attempts and while sleeping. For streaming calls the pipeline wraps
//! connection and first-chunk delivery only; once a stream has started
//! yielding, a failure aborts the request instead of retrying.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{AdapterError, FailureClass};

/// The canonical pipeline wrapped around every provider call.
pub const PROVIDER_RETRY: &str = "provider-retry";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// ±fraction applied to each backoff delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResiliencePipeline {
    name: String,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    stream_initiation_timeout: Duration,
}

impl Default for ResiliencePipeline {
    fn default() -> Self {
        Self {
            name: PROVIDER_RETRY.to_string(),
            policy: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(30),
            stream_initiation_timeout: Duration::from_secs(120),
        }
    }
}

impl ResiliencePipeline {
    pub fn new(
        name: impl Into<String>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
        stream_initiation_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            attempt_timeout,
            stream_initiation_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute a unary provider attempt under the per-attempt timeout.
    pub async fn execute<T, F, Fut>(
        &self,
        ct: &CancellationToken,
        op: F,
    ) -> Result<T, AdapterError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AdapterError>>,
    {
        self.run(self.attempt_timeout, ct, op).await
    }

    /// Execute a streaming initiation (connect + first chunk) under the
    /// streaming initiation timeout.
    pub async fn execute_initiation<T, F, Fut>(
        &self,
        ct: &CancellationToken,
        op: F,
    ) -> Result<T, AdapterError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AdapterError>>,
    {
        self.run(self.stream_initiation_timeout, ct, op).await
    }

    async fn run<T, F, Fut>(
        &self,
        attempt_timeout: Duration,
        ct: &CancellationToken,
        mut op: F,
    ) -> Result<T, AdapterError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AdapterError>>,
    {
        let mut delay = self.policy.base_delay;
        let mut attempt = 0u32;

        loop {
            if ct.is_cancelled() {
                return Err(AdapterError::Cancelled);
            }

            let outcome = tokio::select! {
                _ = ct.cancelled() => return Err(AdapterError::Cancelled),
                result = tokio::time::timeout(attempt_timeout, op()) => result,
            };

            let error = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) => error,
                Err(_) => AdapterError::Timeout,
            };

            attempt += 1;
            let class = FailureClass::classify(&error);
            if attempt >= self.policy.max_attempts || !class.is_transient() {
                return Err(error);
            }

            tracing::debug!(
                pipeline = %self.name,
                attempt,
                class = %class,
                delay_ms = delay.as_millis() as u64,
                "retrying after transient failure"
            );

            let jittered = jitter(delay, self.policy.jitter);
            tokio::select! {
                _ = ct.cancelled() => return Err(AdapterError::Cancelled),
                _ = tokio::time::sleep(jittered) => {}
            }
            delay = (delay * 2).min(self.policy.max_delay);
        }
    }
}

fn jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(1.0 - fraction..=1.0 + fraction);
    delay.mul_f64(factor)
}

/// Registry of named pipelines. The default set contains only
/// [`PROVIDER_RETRY`]; callers can register more.
#[derive(Debug, Default, Clone)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<ResiliencePipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register(ResiliencePipeline::default());
        registry
    }

    pub fn register(&mut self, pipeline: ResiliencePipeline) {
        self.pipelines
            .insert(pipeline.name().to_string(), Arc::new(pipeline));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResiliencePipeline>> {
        self.pipelines.get(name).cloned()
    }
}
