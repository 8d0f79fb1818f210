//! HTTP request handlers: the OpenAI-compatible chat endpoint (unary
//! JSON and SSE streaming), the model listing, health probes and the
//! Prometheus scrape.
//!
//! SSE framing is exact: every update is one `data: <json>\n\n` frame
//! and a normal completion ends with `data: [DONE]\n\n`. No `event:` or
//! `id:` lines. A mid-stream failure emits one error-shaped frame and
//! closes the connection without the `[DONE]` sentinel, so clients can
//! tell an aborted stream from a finished one.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{Response, StatusCode};
use axum::response::{IntoResponse, Json};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use switchyard_core::ChatRequest;

use crate::gateway_error::GatewayError;
use crate::server::AppState;

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response<Body>, GatewayError> {
    if request.stream.unwrap_or(false) {
        return streaming_chat_completions(state, request).await;
    }

    // Dropping the guard (client gone, timeout) cancels upstream I/O
    // and skips any remaining retries.
    let ct = CancellationToken::new();
    let _guard = ct.clone().drop_guard();

    let response = tokio::time::timeout(
        state.config.server.request_timeout,
        state.dispatcher.get_response(request, &ct),
    )
    .await
    .map_err(|_| GatewayError::Timeout)??;

    Ok(Json(response).into_response())
}

async fn streaming_chat_completions(
    state: AppState,
    request: ChatRequest,
) -> Result<Response<Body>, GatewayError> {
    let ct = CancellationToken::new();
    let guard = ct.clone().drop_guard();

    // The request-wide timeout bounds the dispatch loop up to stream
    // initiation; a committed stream then runs as long as the provider
    // keeps yielding.
    let stream = tokio::time::timeout(
        state.config.server.request_timeout,
        state.dispatcher.get_streaming_response(request, &ct),
    )
    .await
    .map_err(|_| GatewayError::Timeout)??;

    let body = Body::from_stream(async_stream::stream! {
        // keep the upstream connection cancellable for as long as the
        // client is reading
        let _guard = guard;
        let mut stream = stream;

        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    match serde_json::to_string(&chunk) {
                        Ok(frame) => {
                            yield Ok::<Bytes, std::convert::Infallible>(
                                Bytes::from(format!("data: {frame}\n\n")),
                            );
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to serialize stream chunk");
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "closing client stream after upstream abort");
                    let frame = json!({
                        "error": {
                            "message": error.to_string(),
                            "type": "stream_aborted",
                        }
                    });
                    yield Ok(Bytes::from(format!("data: {frame}\n\n")));
                    return;
                }
            }
        }

        yield Ok(Bytes::from("data: [DONE]\n\n"));
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(body)
        .expect("static response parts"))
}

/// The canonical model ids the gateway will currently accept.
pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .dispatcher
        .advertised_models()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "switchyard",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

pub async fn health_live(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn health_ready(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "models": state.dispatcher.advertised_models().len(),
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> Response<Body> {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
