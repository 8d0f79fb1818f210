//! Adapter for minimal SSE backends that speak bare text frames; the
//! browser-session ("ghost") tier, where the upstream is a thin shim in
//! front of a web UI. Each `data:` line carries a raw text fragment
//! rather than a JSON delta; `[DONE]` ends the stream. These backends
//! never report usage, so usage is always estimated.

use async_stream::stream;
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::adapters::http::ProviderHttpClient;
use crate::adapters::{ChatAdapter, UpdateStream};
use crate::error::AdapterError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Delta, Message, StreamChoice, StreamChunk, Usage,
};
use crate::registry::AdapterKind;

pub struct SseTextAdapter;

#[derive(Debug, Serialize)]
struct SseTextRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
}

fn text_chunk(id: &str, model: &str, text: Option<String>, finish: Option<&str>) -> StreamChunk {
    StreamChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created: chrono::Utc::now().timestamp() as u64,
        model: model.to_string(),
        choices: vec![StreamChoice {
            index: 0,
            delta: Delta {
                role: None,
                content: text,
                tool_calls: None,
            },
            finish_reason: finish.map(str::to_string),
        }],
        usage: None,
        provider_name: None,
        effective_model_id: None,
    }
}

#[async_trait::async_trait]
impl ChatAdapter for SseTextAdapter {
    fn can_handle(&self, kind: AdapterKind) -> bool {
        kind == AdapterKind::SseText
    }

    async fn execute(
        &self,
        http: &ProviderHttpClient,
        request: &ChatRequest,
        ct: &CancellationToken,
    ) -> Result<ChatResponse, AdapterError> {
        // These backends only stream; a unary call aggregates the frames.
        let mut stream = self.execute_streaming(http, request, ct).await?;
        let mut content = String::new();
        let mut finish_reason = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for choice in chunk.choices {
                if let Some(text) = choice.delta.content {
                    content.push_str(&text);
                }
                if choice.finish_reason.is_some() {
                    finish_reason = choice.finish_reason;
                }
            }
        }

        let usage = Usage::estimated_from_chars(request.content_chars(), content.len());
        Ok(ChatResponse {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: finish_reason.or_else(|| Some("stop".to_string())),
            }],
            usage: Some(usage),
            provider_name: None,
            effective_model_id: None,
        })
    }

    async fn execute_streaming(
        &self,
        http: &ProviderHttpClient,
        request: &ChatRequest,
        _ct: &CancellationToken,
    ) -> Result<UpdateStream, AdapterError> {
        let body = SseTextRequest {
            model: &request.model,
            messages: &request.messages,
        };
        let response = http.post_stream("/chat", &body).await?;

        let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
        let model = request.model.clone();

        let stream = Box::pin(stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut yielded_any = false;

            while let Some(chunk_result) = bytes_stream.next().await {
                let bytes = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(AdapterError::Http(e));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end().to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        yield Ok(text_chunk(&id, &model, None, Some("stop")));
                        return;
                    }
                    if payload.is_empty() {
                        continue;
                    }
                    yielded_any = true;
                    yield Ok(text_chunk(&id, &model, Some(payload.to_string()), None));
                }
            }

            // Upstream closed without the sentinel; still terminate
            // cleanly if anything was delivered.
            if yielded_any {
                yield Ok(text_chunk(&id, &model, None, Some("stop")));
            }
        });

        Ok(stream)
    }
}
