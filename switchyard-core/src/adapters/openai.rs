//! OpenAI-compatible adapter: the normalized types already speak this
//! wire format, so translation is mostly passthrough plus SSE parsing.

use async_stream::stream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::adapters::http::ProviderHttpClient;
use crate::adapters::{ChatAdapter, UpdateStream};
use crate::error::AdapterError;
use crate::models::{normalize_finish_reason, ChatRequest, ChatResponse, StreamChunk, Usage};
use crate::registry::AdapterKind;

pub struct OpenAiCompatAdapter;

#[async_trait::async_trait]
impl ChatAdapter for OpenAiCompatAdapter {
    fn can_handle(&self, kind: AdapterKind) -> bool {
        kind == AdapterKind::OpenAiCompat
    }

    async fn execute(
        &self,
        http: &ProviderHttpClient,
        request: &ChatRequest,
        _ct: &CancellationToken,
    ) -> Result<ChatResponse, AdapterError> {
        let mut body = request.clone();
        body.stream = None;

        let mut response: ChatResponse = http.post_json("/chat/completions", &body).await?;

        for choice in &mut response.choices {
            if let Some(reason) = choice.finish_reason.take() {
                choice.finish_reason = Some(normalize_finish_reason(&reason));
            }
        }
        if response.usage.is_none() {
            response.usage = Some(Usage::estimated_from_chars(
                request.content_chars(),
                response.content_chars(),
            ));
        }
        Ok(response)
    }

    async fn execute_streaming(
        &self,
        http: &ProviderHttpClient,
        request: &ChatRequest,
        _ct: &CancellationToken,
    ) -> Result<UpdateStream, AdapterError> {
        let mut body = request.clone();
        body.stream = Some(true);

        let response = http.post_stream("/chat/completions", &body).await?;

        let stream = Box::pin(stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

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
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    match parse_data_line(&line) {
                        SseLine::Done => return,
                        SseLine::Chunk(mut chunk) => {
                            for choice in &mut chunk.choices {
                                if let Some(reason) = choice.finish_reason.take() {
                                    choice.finish_reason =
                                        Some(normalize_finish_reason(&reason));
                                }
                            }
                            yield Ok(chunk);
                        }
                        SseLine::Skip => {}
                    }
                }
            }
        });

        Ok(stream)
    }
}

enum SseLine {
    Chunk(StreamChunk),
    Done,
    Skip,
}

/// Parse one SSE line. Empty lines, non-`data:` lines and malformed JSON
/// frames are dropped silently (logged at debug) so a single garbled
/// frame never kills the stream.
fn parse_data_line(line: &str) -> SseLine {
    let Some(payload) = line.strip_prefix("data: ") else {
        return SseLine::Skip;
    };
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => SseLine::Chunk(chunk),
        Err(e) => {
            tracing::debug!(error = %e, "dropping malformed stream frame");
            SseLine::Skip
        }
    }
}
