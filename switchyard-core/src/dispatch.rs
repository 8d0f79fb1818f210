//! The dispatch engine: rotates through routed candidates, executes each
//! through the resilience pipeline, classifies failures, updates health
//! and quota state, and annotates whatever comes back with the provider
//! that produced it.
//!
//! Ordering rules the loop guarantees:
//! - candidate N+1 is not tried until candidate N has terminated;
//! - a candidate skipped for health or quota does not consume retry
//!   budget;
//! - an upstream 400/404 short-circuits to the caller (every other
//!   candidate would reproduce it) without penalising the provider;
//! - once a stream has yielded its first chunk, a failure aborts the
//!   request rather than failing over; the client has already observed
//!   partial output from that provider.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_stream::stream;
use dashmap::DashMap;
use futures::StreamExt;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::adapters::{AdapterSet, ProviderHttpClient, UpdateStream};
use crate::error::{
    AdapterError, AttemptFailure, DispatchError, FailureClass, FailureReport,
};
use crate::health::HealthStore;
use crate::models::{ChatRequest, ChatResponse, StreamChunk, Usage};
use crate::quota::QuotaTracker;
use crate::registry::Registry;
use crate::resilience::{PipelineRegistry, ResiliencePipeline, PROVIDER_RETRY};
use crate::resolver::Candidate;
use crate::router::{RoutingStrategy, SmartRouter};
use crate::telemetry::{Direction, MetricsSink};

/// Stream of decorated updates handed to the transport layer.
pub type DispatchStream =
    Pin<Box<dyn futures::Stream<Item = Result<StreamChunk, DispatchError>> + Send>>;

pub struct Dispatcher {
    snapshot: ArcSwap<Registry>,
    router: SmartRouter,
    health: Arc<HealthStore>,
    quota: Arc<QuotaTracker>,
    pipeline: Arc<ResiliencePipeline>,
    adapters: AdapterSet,
    clients: DashMap<String, ProviderHttpClient>,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub fn new(
        registry: Registry,
        strategy: RoutingStrategy,
        pipelines: PipelineRegistry,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, AdapterError> {
        let pipeline = pipelines
            .get(PROVIDER_RETRY)
            .unwrap_or_else(|| Arc::new(ResiliencePipeline::default()));
        let dispatcher = Self {
            snapshot: ArcSwap::from_pointee(Registry::default()),
            router: SmartRouter::new(strategy),
            health: Arc::new(HealthStore::new()),
            quota: Arc::new(QuotaTracker::new()),
            pipeline,
            adapters: AdapterSet::new(),
            clients: DashMap::new(),
            metrics,
        };
        dispatcher.install_snapshot(registry)?;
        Ok(dispatcher)
    }

    /// Atomically swap in a new registry snapshot. In-flight requests
    /// keep the snapshot they loaded; health/quota/router state for
    /// providers that disappeared is pruned.
    pub fn install_snapshot(&self, registry: Registry) -> Result<(), AdapterError> {
        let mut new_clients = Vec::new();
        for config in registry.providers() {
            if !config.enabled {
                continue;
            }
            new_clients.push((config.key.clone(), ProviderHttpClient::for_provider(config)?));
        }

        self.clients.clear();
        for (key, client) in new_clients {
            self.clients.insert(key, client);
        }

        let snapshot = Arc::new(registry);
        self.snapshot.store(Arc::clone(&snapshot));

        let live = |key: &str| snapshot.provider(key).is_some();
        self.health.prune(live);
        self.quota.prune(live);
        self.router.prune(live);
        Ok(())
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.snapshot.load_full()
    }

    pub fn health(&self) -> &HealthStore {
        &self.health
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    /// Canonical ids the gateway currently accepts.
    pub fn advertised_models(&self) -> Vec<String> {
        self.snapshot.load().advertised_models()
    }

    /// Unary dispatch: try candidates in routed order until one
    /// succeeds or the list is exhausted.
    #[tracing::instrument(name = "chat.request", skip_all, fields(model = %request.model, streaming = false))]
    pub async fn get_response(
        &self,
        request: ChatRequest,
        ct: &CancellationToken,
    ) -> Result<ChatResponse, DispatchError> {
        self.validate(&request)?;

        let registry = self.snapshot.load_full();
        let candidates = self.router.candidates(&registry, &request.model, false);
        if candidates.is_empty() {
            self.metrics.record_request("model_unavailable");
            return Err(DispatchError::ModelUnavailable {
                model: request.model,
            });
        }

        let mut failures = Vec::new();
        for candidate in candidates {
            if ct.is_cancelled() {
                self.metrics.record_request("cancelled");
                return Err(DispatchError::Cancelled);
            }
            if !self.candidate_admissible(&candidate) {
                continue;
            }

            let key = candidate.key().to_string();
            let span = tracing::info_span!(
                "chat.attempt",
                provider.key = %key,
                provider.tier = candidate.tier(),
                attempt.status = tracing::field::Empty,
            );
            let started = Instant::now();
            let result = self
                .attempt_unary(&candidate, &request, ct)
                .instrument(span.clone())
                .await;
            let latency = started.elapsed();

            match result {
                Ok(mut response) => {
                    span.record("attempt.status", "ok");
                    self.metrics.record_attempt(&key, "ok", latency);
                    self.note_success(&key, latency);

                    response.provider_name = Some(key.clone());
                    response.effective_model_id = Some(candidate.provider_model_id.clone());
                    response.model = request.model.clone();

                    let usage = response.usage.get_or_insert_with(|| {
                        Usage::estimated_from_chars(request.content_chars(), 0)
                    });
                    self.note_usage(&key, usage);

                    self.metrics.record_request("ok");
                    return Ok(response);
                }
                Err(error) => {
                    let class = FailureClass::classify(&error);
                    span.record("attempt.status", class.as_str());
                    self.metrics.record_attempt(&key, class.as_str(), latency);

                    match class {
                        FailureClass::Cancelled => {
                            self.metrics.record_request("cancelled");
                            return Err(DispatchError::Cancelled);
                        }
                        FailureClass::RequestError => {
                            tracing::warn!(
                                provider = %key,
                                model = %request.model,
                                class = %class,
                                "upstream rejected the request; surfacing to caller"
                            );
                            self.metrics.record_request("rejected");
                            return Err(DispatchError::Rejected {
                                provider: key,
                                source: error,
                            });
                        }
                        _ => self.note_failure(&key, &request.model, class, &error, &mut failures),
                    }
                }
            }
        }

        self.metrics.record_request("failed");
        Err(DispatchError::AllProvidersFailed(FailureReport {
            model: request.model,
            attempts: failures,
        }))
    }

    /// Streaming dispatch. A candidate counts as successful once its
    /// stream yields a first chunk within the initiation timeout; after
    /// that the stream is committed and mid-flight failures abort the
    /// request instead of trying the next candidate.
    #[tracing::instrument(name = "chat.request", skip_all, fields(model = %request.model, streaming = true))]
    pub async fn get_streaming_response(
        &self,
        request: ChatRequest,
        ct: &CancellationToken,
    ) -> Result<DispatchStream, DispatchError> {
        self.validate(&request)?;

        let registry = self.snapshot.load_full();
        let candidates = self.router.candidates(&registry, &request.model, true);
        if candidates.is_empty() {
            self.metrics.record_request("model_unavailable");
            return Err(DispatchError::ModelUnavailable {
                model: request.model,
            });
        }

        let mut failures = Vec::new();
        for candidate in candidates {
            if ct.is_cancelled() {
                self.metrics.record_request("cancelled");
                return Err(DispatchError::Cancelled);
            }
            if !self.candidate_admissible(&candidate) {
                continue;
            }

            let key = candidate.key().to_string();
            let span = tracing::info_span!(
                "chat.attempt",
                provider.key = %key,
                provider.tier = candidate.tier(),
                attempt.status = tracing::field::Empty,
            );
            let started = Instant::now();
            let result = self
                .attempt_stream_initiation(&candidate, &request, ct)
                .instrument(span.clone())
                .await;
            let latency = started.elapsed();

            match result {
                Ok((first, rest)) => {
                    span.record("attempt.status", "ok");
                    self.metrics.record_attempt(&key, "ok", latency);
                    self.note_success(&key, latency);
                    self.metrics.record_request("ok");

                    return Ok(self.decorate_stream(
                        key,
                        request.model.clone(),
                        candidate.provider_model_id.clone(),
                        request.content_chars(),
                        first,
                        rest,
                    ));
                }
                Err(error) => {
                    let class = FailureClass::classify(&error);
                    span.record("attempt.status", class.as_str());
                    self.metrics.record_attempt(&key, class.as_str(), latency);

                    match class {
                        FailureClass::Cancelled => {
                            self.metrics.record_request("cancelled");
                            return Err(DispatchError::Cancelled);
                        }
                        FailureClass::RequestError => {
                            tracing::warn!(
                                provider = %key,
                                model = %request.model,
                                class = %class,
                                "upstream rejected the request; surfacing to caller"
                            );
                            self.metrics.record_request("rejected");
                            return Err(DispatchError::Rejected {
                                provider: key,
                                source: error,
                            });
                        }
                        _ => self.note_failure(&key, &request.model, class, &error, &mut failures),
                    }
                }
            }
        }

        self.metrics.record_request("failed");
        Err(DispatchError::AllProvidersFailed(FailureReport {
            model: request.model,
            attempts: failures,
        }))
    }

    fn validate(&self, request: &ChatRequest) -> Result<(), DispatchError> {
        if request.model.is_empty() {
            self.metrics.record_request("invalid");
            return Err(DispatchError::InvalidRequest {
                message: "model is required".to_string(),
            });
        }
        if request.messages.is_empty() {
            self.metrics.record_request("invalid");
            return Err(DispatchError::InvalidRequest {
                message: "messages must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Health and quota are consulted at the moment of attempt, not at
    /// routing time; a skip costs nothing from the retry budget.
    fn candidate_admissible(&self, candidate: &Candidate) -> bool {
        let key = candidate.key();
        if !self.health.is_healthy(key) {
            tracing::debug!(provider = %key, "skipping provider in cooldown");
            return false;
        }
        if !self.quota.check(&candidate.provider) {
            tracing::debug!(provider = %key, "skipping provider over quota");
            return false;
        }
        true
    }

    async fn attempt_unary(
        &self,
        candidate: &Candidate,
        request: &ChatRequest,
        ct: &CancellationToken,
    ) -> Result<ChatResponse, AdapterError> {
        let upstream = self.upstream_request(candidate, request, false);
        let adapter = self.adapters.for_kind(candidate.provider.kind);
        let client = self.client_for(candidate.key())?;

        self.quota.record_request(candidate.key());
        self.router.note_attempt(candidate.key());

        self.pipeline
            .execute(ct, || adapter.execute(&client, &upstream, ct))
            .await
    }

    async fn attempt_stream_initiation(
        &self,
        candidate: &Candidate,
        request: &ChatRequest,
        ct: &CancellationToken,
    ) -> Result<(Option<StreamChunk>, UpdateStream), AdapterError> {
        let upstream = self.upstream_request(candidate, request, true);
        let adapter = self.adapters.for_kind(candidate.provider.kind);
        let client = self.client_for(candidate.key())?;

        self.quota.record_request(candidate.key());
        self.router.note_attempt(candidate.key());

        self.pipeline
            .execute_initiation(ct, || {
                let upstream = upstream.clone();
                let client = client.clone();
                async move {
                    let mut stream = adapter.execute_streaming(&client, &upstream, ct).await?;
                    let first = stream.next().await.transpose()?;
                    Ok((first, stream))
                }
            })
            .await
    }

    /// Clone of the caller's request with the provider-specific model id
    /// substituted in. Prefix stripping already happened in resolution:
    /// a "key/suffix" id resolved through that provider's bindings, so
    /// `provider_model_id` is what the upstream expects.
    fn upstream_request(
        &self,
        candidate: &Candidate,
        request: &ChatRequest,
        streaming: bool,
    ) -> ChatRequest {
        let mut upstream = request.clone();
        upstream.model = candidate.provider_model_id.clone();
        upstream.stream = streaming.then_some(true);
        upstream
    }

    fn client_for(&self, key: &str) -> Result<ProviderHttpClient, AdapterError> {
        self.clients
            .get(key)
            .map(|entry| entry.clone())
            .ok_or_else(|| AdapterError::Configuration {
                message: format!("no http client for provider '{key}'"),
            })
    }

    fn note_success(&self, key: &str, latency: Duration) {
        if self.health.mark_success(key, latency.as_millis() as u64) {
            self.metrics.record_health_transition(key, "healthy");
        }
    }

    fn note_usage(&self, key: &str, usage: &Usage) {
        self.quota
            .record_usage(key, usage.prompt_tokens, usage.completion_tokens);
        self.metrics.record_tokens(
            key,
            Direction::Input,
            u64::from(usage.prompt_tokens),
            usage.estimated,
        );
        self.metrics.record_tokens(
            key,
            Direction::Output,
            u64::from(usage.completion_tokens),
            usage.estimated,
        );
    }

    fn note_failure(
        &self,
        key: &str,
        model: &str,
        class: FailureClass,
        error: &AdapterError,
        failures: &mut Vec<AttemptFailure>,
    ) {
        if let Some(cooldown) = class.cooldown() {
            if self.health.mark_failure(key, cooldown) {
                self.metrics.record_health_transition(key, "cooldown");
            }
        }
        tracing::warn!(
            provider = %key,
            model = %model,
            class = %class,
            error = %error.summary(),
            "provider attempt failed; moving to next candidate"
        );
        failures.push(AttemptFailure {
            provider: key.to_string(),
            class,
            message: error.summary(),
        });
    }

    /// Re-yield upstream chunks decorated with routing metadata, keeping
    /// provider order and back-pressure. Records estimated usage at
    /// natural end-of-stream when the upstream never reported any.
    fn decorate_stream(
        &self,
        key: String,
        requested_model: String,
        effective_model: String,
        input_chars: usize,
        first: Option<StreamChunk>,
        rest: UpdateStream,
    ) -> DispatchStream {
        let health = Arc::clone(&self.health);
        let quota = Arc::clone(&self.quota);
        let metrics = Arc::clone(&self.metrics);

        Box::pin(stream! {
            let mut output_chars = 0usize;
            let mut usage_reported = false;

            if let Some(chunk) = first {
                let chunk = decorate_chunk(chunk, &requested_model, &key, &effective_model);
                output_chars += chunk.content_chars();
                if let Some(usage) = &chunk.usage {
                    record_stream_usage(&quota, &metrics, &key, usage);
                    usage_reported = true;
                }
                yield Ok(chunk);
            }

            let mut rest = rest;
            while let Some(item) = rest.next().await {
                match item {
                    Ok(chunk) => {
                        let chunk = decorate_chunk(chunk, &requested_model, &key, &effective_model);
                        output_chars += chunk.content_chars();
                        if let Some(usage) = &chunk.usage {
                            record_stream_usage(&quota, &metrics, &key, usage);
                            usage_reported = true;
                        }
                        yield Ok(chunk);
                    }
                    Err(error) => {
                        let class = FailureClass::classify(&error);
                        if let Some(cooldown) = class.cooldown() {
                            if health.mark_failure(&key, cooldown) {
                                metrics.record_health_transition(&key, "cooldown");
                            }
                        }
                        tracing::warn!(
                            provider = %key,
                            class = %class,
                            error = %error.summary(),
                            "stream aborted mid-flight"
                        );
                        yield Err(DispatchError::StreamAborted {
                            provider: key.clone(),
                            source: error,
                        });
                        return;
                    }
                }
            }

            if !usage_reported {
                let usage = Usage::estimated_from_chars(input_chars, output_chars);
                record_stream_usage(&quota, &metrics, &key, &usage);
            }
        })
    }
}

fn decorate_chunk(
    mut chunk: StreamChunk,
    requested_model: &str,
    provider: &str,
    effective_model: &str,
) -> StreamChunk {
    chunk.model = requested_model.to_string();
    chunk.provider_name = Some(provider.to_string());
    chunk.effective_model_id = Some(effective_model.to_string());
    chunk
}

fn record_stream_usage(
    quota: &QuotaTracker,
    metrics: &Arc<dyn MetricsSink>,
    key: &str,
    usage: &Usage,
) {
    quota.record_usage(key, usage.prompt_tokens, usage.completion_tokens);
    metrics.record_tokens(
        key,
        Direction::Input,
        u64::from(usage.prompt_tokens),
        usage.estimated,
    );
    metrics.record_tokens(
        key,
        Direction::Output,
        u64::from(usage.completion_tokens),
        usage.estimated,
    );
}
