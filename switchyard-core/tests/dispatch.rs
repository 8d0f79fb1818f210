//! End-to-end dispatch loop behavior against mock upstream providers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use switchyard_core::registry::ProviderSpec;
use switchyard_core::telemetry::NoopSink;
use switchyard_core::{
    CanonicalModel, Capabilities, ChatRequest, DispatchError, Dispatcher, FailureClass, Message,
    ModelBinding, PipelineRegistry, Registry, RegistryDocument, ResiliencePipeline, RetryPolicy,
    RoutingStrategy, PROVIDER_RETRY,
};

fn provider_spec(uri: &str, tier: u8, quality: u8) -> ProviderSpec {
    ProviderSpec {
        kind: "openai-compatible".to_string(),
        enabled: true,
        tier,
        models: Default::default(),
        endpoint: Some(uri.to_string()),
        api_key: Some("sk-test".to_string()),
        account_id: None,
        rate_limit_rpm: None,
        rate_limit_tpm: None,
        is_free: false,
        quality_score: Some(quality),
        headers: HashMap::new(),
    }
}

fn binding(provider: &str, provider_model_id: &str) -> ModelBinding {
    ModelBinding {
        provider: provider.to_string(),
        model: "m".to_string(),
        provider_model_id: provider_model_id.to_string(),
        available: true,
        input_price: None,
        output_price: None,
        rate_limit_rpm: None,
        rate_limit_tpm: None,
    }
}

/// Two-provider registry: alpha on tier 0, beta on tier 1.
fn two_tier_document(alpha_uri: &str, beta_uri: &str) -> RegistryDocument {
    let mut providers = HashMap::new();
    providers.insert("alpha".to_string(), provider_spec(alpha_uri, 0, 8));
    providers.insert("beta".to_string(), provider_spec(beta_uri, 1, 8));

    RegistryDocument {
        providers,
        models: vec![CanonicalModel {
            id: "m".to_string(),
            family: "test".to_string(),
            context_window: 8192,
            max_output_tokens: 2048,
            input_price: 0.0,
            output_price: 0.0,
            capabilities: Capabilities {
                streaming: true,
                tools: true,
                ..Default::default()
            },
        }],
        aliases: HashMap::new(),
        bindings: vec![binding("alpha", "alpha-model"), binding("beta", "beta-model")],
    }
}

fn dispatcher(doc: RegistryDocument) -> Dispatcher {
    let mut pipelines = PipelineRegistry::new();
    pipelines.register(ResiliencePipeline::new(
        PROVIDER_RETRY,
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: 0.0,
        },
        Duration::from_secs(5),
        Duration::from_secs(5),
    ));
    Dispatcher::new(
        Registry::from_document(doc).unwrap(),
        RoutingStrategy::Priority,
        pipelines,
        Arc::new(NoopSink),
    )
    .unwrap()
}

fn chat_request(model: &str, stream: bool) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: vec![Message::user("hi")],
        stream: stream.then_some(true),
        ..Default::default()
    }
}

fn ok_body(content: &str, usage: Option<(u32, u32)>) -> serde_json::Value {
    let mut body = json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion",
        "created": 1,
        "model": "upstream-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    });
    if let Some((input, output)) = usage {
        body["usage"] = json!({
            "prompt_tokens": input,
            "completion_tokens": output,
            "total_tokens": input + output
        });
    }
    body
}

fn sse_body(deltas: &[&str]) -> String {
    let mut body = String::new();
    for (i, delta) in deltas.iter().enumerate() {
        let frame = json!({
            "id": "chatcmpl-upstream",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": "upstream-model",
            "choices": [{
                "index": 0,
                "delta": {"content": delta},
                "finish_reason": if i + 1 == deltas.len() { Some("stop") } else { None }
            }]
        });
        body.push_str(&format!("data: {frame}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

async fn mount_chat(server: &MockServer, response: ResponseTemplate, expect: u64) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(response)
        .expect(expect)
        .mount(server)
        .await;
}

#[tokio::test]
async fn healthy_tier_zero_provider_serves_the_request() {
    let alpha = MockServer::start().await;
    let beta = MockServer::start().await;
    mount_chat(&alpha, ResponseTemplate::new(200).set_body_json(ok_body("hello", None)), 1).await;
    mount_chat(&beta, ResponseTemplate::new(200).set_body_json(ok_body("hello", None)), 0).await;

    let dispatcher = dispatcher(two_tier_document(&alpha.uri(), &beta.uri()));
    let response = dispatcher
        .get_response(chat_request("m", false), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.provider_name.as_deref(), Some("alpha"));
    assert_eq!(response.effective_model_id.as_deref(), Some("alpha-model"));
    assert_eq!(response.model, "m");
}

#[tokio::test]
async fn server_errors_retry_then_fail_over_to_the_next_tier() {
    let alpha = MockServer::start().await;
    let beta = MockServer::start().await;
    // retry budget of 1 -> exactly two attempts against alpha
    mount_chat(&alpha, ResponseTemplate::new(503).set_body_string("overloaded"), 2).await;
    mount_chat(
        &beta,
        ResponseTemplate::new(200).set_body_json(ok_body("fallback", Some((3, 5)))),
        1,
    )
    .await;

    let dispatcher = dispatcher(two_tier_document(&alpha.uri(), &beta.uri()));
    let response = dispatcher
        .get_response(chat_request("m", false), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.provider_name.as_deref(), Some("beta"));
    assert!(!dispatcher.health().is_healthy("alpha"));
    let remaining = dispatcher.health().cooldown_remaining("alpha").unwrap();
    assert!(remaining > Duration::from_secs(25));
    assert_eq!(dispatcher.quota().window_totals("beta"), (1, 8));
}

#[tokio::test]
async fn provider_prefixed_model_reaches_upstream_as_the_bound_id() {
    let alpha = MockServer::start().await;
    let beta = MockServer::start().await;

    let mut doc = two_tier_document(&alpha.uri(), &beta.uri());
    doc.bindings[0].provider_model_id = "meta-llama-3".to_string();

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "meta-llama-3"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("pinned", None)))
        .expect(1)
        .mount(&alpha)
        .await;
    mount_chat(&beta, ResponseTemplate::new(200).set_body_json(ok_body("x", None)), 0).await;

    let dispatcher = dispatcher(doc);
    let response = dispatcher
        .get_response(chat_request("alpha/m", false), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.provider_name.as_deref(), Some("alpha"));
    assert_eq!(response.effective_model_id.as_deref(), Some("meta-llama-3"));
}

#[tokio::test]
async fn unanimous_auth_failures_aggregate_with_long_cooldowns() {
    let alpha = MockServer::start().await;
    let beta = MockServer::start().await;
    let unauthorized = ResponseTemplate::new(401)
        .set_body_json(json!({"error": {"message": "bad key", "code": "invalid_api_key"}}));
    mount_chat(&alpha, unauthorized.clone(), 1).await;
    mount_chat(&beta, unauthorized, 1).await;

    let dispatcher = dispatcher(two_tier_document(&alpha.uri(), &beta.uri()));
    let error = dispatcher
        .get_response(chat_request("m", false), &CancellationToken::new())
        .await
        .unwrap_err();

    match error {
        DispatchError::AllProvidersFailed(report) => {
            assert_eq!(report.attempts.len(), 2);
            assert_eq!(report.dominant_class(), FailureClass::Auth);
        }
        other => panic!("expected AllProvidersFailed, got {other:?}"),
    }

    for key in ["alpha", "beta"] {
        let remaining = dispatcher.health().cooldown_remaining(key).unwrap();
        assert!(remaining > Duration::from_secs(3500));
    }
}

#[tokio::test]
async fn upstream_400_surfaces_without_failover_or_penalty() {
    let alpha = MockServer::start().await;
    let beta = MockServer::start().await;
    mount_chat(
        &alpha,
        ResponseTemplate::new(400).set_body_json(
            json!({"error": {"code": "invalid_request", "message": "bad tool schema"}}),
        ),
        1,
    )
    .await;
    mount_chat(&beta, ResponseTemplate::new(200).set_body_json(ok_body("x", None)), 0).await;

    let dispatcher = dispatcher(two_tier_document(&alpha.uri(), &beta.uri()));
    let error = dispatcher
        .get_response(chat_request("m", false), &CancellationToken::new())
        .await
        .unwrap_err();

    match error {
        DispatchError::Rejected { provider, source } => {
            assert_eq!(provider, "alpha");
            assert_eq!(source.status(), Some(400));
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert!(dispatcher.health().is_healthy("alpha"));
}

#[tokio::test]
async fn streaming_chunks_arrive_in_order_tagged_with_one_provider() {
    let alpha = MockServer::start().await;
    let beta = MockServer::start().await;
    mount_chat(
        &alpha,
        ResponseTemplate::new(200)
            .set_body_raw(sse_body(&["Once", " upon", " a time"]), "text/event-stream"),
        1,
    )
    .await;
    mount_chat(&beta, ResponseTemplate::new(200).set_body_json(ok_body("x", None)), 0).await;

    let dispatcher = dispatcher(two_tier_document(&alpha.uri(), &beta.uri()));
    let stream = dispatcher
        .get_streaming_response(chat_request("m", true), &CancellationToken::new())
        .await
        .unwrap();

    let chunks: Vec<_> = stream.collect().await;
    assert_eq!(chunks.len(), 3);
    let mut content = String::new();
    for chunk in chunks {
        let chunk = chunk.unwrap();
        assert_eq!(chunk.provider_name.as_deref(), Some("alpha"));
        assert_eq!(chunk.effective_model_id.as_deref(), Some("alpha-model"));
        if let Some(text) = &chunk.choices[0].delta.content {
            content.push_str(text);
        }
    }
    assert_eq!(content, "Once upon a time");

    // no upstream usage -> estimated usage recorded at end of stream
    let (requests, tokens) = dispatcher.quota().window_totals("alpha");
    assert_eq!(requests, 1);
    assert!(tokens > 0);
}

#[tokio::test]
async fn streaming_initiation_failure_fails_over_before_first_chunk() {
    let alpha = MockServer::start().await;
    let beta = MockServer::start().await;
    mount_chat(&alpha, ResponseTemplate::new(500).set_body_string("boom"), 2).await;
    mount_chat(
        &beta,
        ResponseTemplate::new(200).set_body_raw(sse_body(&["ok"]), "text/event-stream"),
        1,
    )
    .await;

    let dispatcher = dispatcher(two_tier_document(&alpha.uri(), &beta.uri()));
    let stream = dispatcher
        .get_streaming_response(chat_request("m", true), &CancellationToken::new())
        .await
        .unwrap();

    let chunks: Vec<_> = stream.collect().await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(
        chunks[0].as_ref().unwrap().provider_name.as_deref(),
        Some("beta")
    );
    assert!(!dispatcher.health().is_healthy("alpha"));
}

#[tokio::test]
async fn providers_in_cooldown_are_skipped_without_consuming_attempts() {
    let alpha = MockServer::start().await;
    let beta = MockServer::start().await;
    mount_chat(&alpha, ResponseTemplate::new(200).set_body_json(ok_body("x", None)), 0).await;
    mount_chat(&beta, ResponseTemplate::new(200).set_body_json(ok_body("x", None)), 1).await;

    let dispatcher = dispatcher(two_tier_document(&alpha.uri(), &beta.uri()));
    dispatcher
        .health()
        .mark_failure("alpha", Duration::from_secs(60));

    let response = dispatcher
        .get_response(chat_request("m", false), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.provider_name.as_deref(), Some("beta"));
}

#[tokio::test]
async fn quota_exhausted_providers_are_vetoed_at_attempt_time() {
    let alpha = MockServer::start().await;
    let beta = MockServer::start().await;
    mount_chat(&alpha, ResponseTemplate::new(200).set_body_json(ok_body("x", None)), 1).await;
    mount_chat(&beta, ResponseTemplate::new(200).set_body_json(ok_body("x", None)), 1).await;

    let mut doc = two_tier_document(&alpha.uri(), &beta.uri());
    doc.providers.get_mut("alpha").unwrap().rate_limit_rpm = Some(1);

    let dispatcher = dispatcher(doc);
    let first = dispatcher
        .get_response(chat_request("m", false), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.provider_name.as_deref(), Some("alpha"));

    let second = dispatcher
        .get_response(chat_request("m", false), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.provider_name.as_deref(), Some("beta"));
}

#[tokio::test]
async fn unknown_models_resolve_to_nothing() {
    let alpha = MockServer::start().await;
    let beta = MockServer::start().await;
    let dispatcher = dispatcher(two_tier_document(&alpha.uri(), &beta.uri()));

    let error = dispatcher
        .get_response(chat_request("no-such-model", false), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, DispatchError::ModelUnavailable { .. }));
}

#[tokio::test]
async fn reload_prunes_state_for_removed_providers() {
    let alpha = MockServer::start().await;
    let beta = MockServer::start().await;
    let dispatcher = dispatcher(two_tier_document(&alpha.uri(), &beta.uri()));

    dispatcher
        .health()
        .mark_failure("beta", Duration::from_secs(3600));

    let mut doc = two_tier_document(&alpha.uri(), &beta.uri());
    doc.providers.remove("beta");
    doc.bindings.retain(|b| b.provider != "beta");
    dispatcher
        .install_snapshot(Registry::from_document(doc).unwrap())
        .unwrap();

    // the pruned entry is gone: a re-added beta would start healthy
    assert!(dispatcher.health().is_healthy("beta"));
    assert_eq!(dispatcher.advertised_models(), vec!["m".to_string()]);
}

#[tokio::test]
async fn gemini_backends_stream_as_one_terminal_update() {
    use switchyard_core::adapters::{ChatAdapter, ProviderHttpClient};
    use switchyard_core::adapters::gemini::GeminiAdapter;
    use switchyard_core::registry::{AdapterKind, ProviderConfig};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "aggregated answer"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 3}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = ProviderConfig {
        key: "gem".to_string(),
        kind: AdapterKind::GeminiNative,
        enabled: true,
        tier: 0,
        models: Default::default(),
        endpoint: server.uri(),
        api_key: Some("gk".to_string()),
        account_id: None,
        rate_limit_rpm: None,
        rate_limit_tpm: None,
        is_free: true,
        quality_score: None,
        headers: HashMap::new(),
    };
    let client = ProviderHttpClient::for_provider(&config).unwrap();

    let adapter = GeminiAdapter;
    let stream = adapter
        .execute_streaming(
            &client,
            &chat_request("gemini-2.0-flash", true),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let chunks: Vec<_> = stream.collect().await;
    assert_eq!(chunks.len(), 1);
    let chunk = chunks[0].as_ref().unwrap();
    assert!(chunk.is_terminal());
    assert_eq!(
        chunk.choices[0].delta.content.as_deref(),
        Some("aggregated answer")
    );
    assert_eq!(chunk.usage.as_ref().unwrap().total_tokens, 8);
}
