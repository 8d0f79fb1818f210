//! Gemini-native adapter: translates to the `generateContent` wire
//! format. Gemini has no SSE endpoint we use, so `execute_streaming`
//! performs a unary call and yields one terminal aggregated update.

use async_stream::stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::adapters::http::ProviderHttpClient;
use crate::adapters::{ChatAdapter, UpdateStream};
use crate::error::AdapterError;
use crate::models::{
    normalize_finish_reason, ChatRequest, ChatResponse, Choice, Delta, Message, Role, StreamChoice,
    StreamChunk, Usage,
};
use crate::registry::AdapterKind;

pub struct GeminiAdapter;

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(rename = "topK", skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(rename = "stopSequences", skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

fn build_request(request: &ChatRequest) -> GeminiRequest {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System => system_parts.push(GeminiPart {
                text: message.content.clone(),
            }),
            Role::User | Role::Tool => contents.push(GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: message.content.clone(),
                }],
            }),
            Role::Assistant => contents.push(GeminiContent {
                role: Some("model".to_string()),
                parts: vec![GeminiPart {
                    text: message.content.clone(),
                }],
            }),
        }
    }

    GeminiRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then_some(GeminiContent {
            role: None,
            parts: system_parts,
        }),
        generation_config: GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            max_output_tokens: request.max_tokens,
            stop_sequences: request.stop.clone(),
        },
    }
}

fn convert_response(
    model: &str,
    input_chars: usize,
    response: GeminiResponse,
) -> ChatResponse {
    let candidate = response.candidates.into_iter().next();
    let (content, finish_reason) = match candidate {
        Some(c) => {
            let text = c
                .content
                .map(|content| {
                    content
                        .parts
                        .into_iter()
                        .map(|p| p.text)
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            let reason = c
                .finish_reason
                .as_deref()
                .map(normalize_finish_reason)
                .unwrap_or_else(|| "stop".to_string());
            (text, reason)
        }
        None => (String::new(), "error".to_string()),
    };

    let usage = match response.usage_metadata {
        Some(u) => Usage::new(u.prompt_token_count, u.candidates_token_count),
        None => Usage::estimated_from_chars(input_chars, content.len()),
    };

    ChatResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp() as u64,
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: Message::assistant(content),
            finish_reason: Some(finish_reason),
        }],
        usage: Some(usage),
        provider_name: None,
        effective_model_id: None,
    }
}

#[async_trait::async_trait]
impl ChatAdapter for GeminiAdapter {
    fn can_handle(&self, kind: AdapterKind) -> bool {
        kind == AdapterKind::GeminiNative
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        http: &ProviderHttpClient,
        request: &ChatRequest,
        _ct: &CancellationToken,
    ) -> Result<ChatResponse, AdapterError> {
        let body = build_request(request);
        let path = format!("/v1beta/models/{}:generateContent", request.model);
        let response: GeminiResponse = http.post_json(&path, &body).await?;
        Ok(convert_response(
            &request.model,
            request.content_chars(),
            response,
        ))
    }

    async fn execute_streaming(
        &self,
        http: &ProviderHttpClient,
        request: &ChatRequest,
        ct: &CancellationToken,
    ) -> Result<UpdateStream, AdapterError> {
        // No native streaming: one aggregated terminal update.
        let response = self.execute(http, request, ct).await?;

        let chunk = StreamChunk {
            id: response.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: response.created,
            model: response.model.clone(),
            choices: response
                .choices
                .iter()
                .map(|choice| StreamChoice {
                    index: choice.index,
                    delta: Delta {
                        role: Some(Role::Assistant),
                        content: Some(choice.message.content.clone()),
                        tool_calls: None,
                    },
                    finish_reason: choice.finish_reason.clone(),
                })
                .collect(),
            usage: response.usage.clone(),
            provider_name: None,
            effective_model_id: None,
        };

        Ok(Box::pin(stream! {
            yield Ok(chunk);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![
                Message::system("Be terse."),
                Message::user("Hello"),
                Message::assistant("Hi."),
                Message::user("Bye"),
            ],
            temperature: Some(0.5),
            max_tokens: Some(64),
            ..Default::default()
        }
    }

    #[test]
    fn system_messages_fold_into_system_instruction() {
        let body = build_request(&request());
        assert_eq!(body.contents.len(), 3);
        assert_eq!(body.contents[0].role.as_deref(), Some("user"));
        assert_eq!(body.contents[1].role.as_deref(), Some("model"));
        let system = body.system_instruction.unwrap();
        assert_eq!(system.parts[0].text, "Be terse.");
    }

    #[test]
    fn generation_config_carries_sampling_parameters() {
        let body = build_request(&request());
        assert_eq!(body.generation_config.temperature, Some(0.5));
        assert_eq!(body.generation_config.max_output_tokens, Some(64));
    }

    #[test]
    fn response_conversion_maps_finish_reason_and_usage() {
        let raw = GeminiResponse {
            candidates: vec![GeminiCandidate {
                content: Some(GeminiContent {
                    role: Some("model".to_string()),
                    parts: vec![
                        GeminiPart {
                            text: "Hello ".to_string(),
                        },
                        GeminiPart {
                            text: "there".to_string(),
                        },
                    ],
                }),
                finish_reason: Some("MAX_TOKENS".to_string()),
            }],
            usage_metadata: Some(GeminiUsage {
                prompt_token_count: 12,
                candidates_token_count: 4,
            }),
        };

        let response = convert_response("gemini-2.0-flash", 24, raw);
        assert_eq!(response.choices[0].message.content, "Hello there");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("length"));
        let usage = response.usage.unwrap();
        assert_eq!(usage.total_tokens, 16);
        assert!(!usage.estimated);
    }

    #[test]
    fn missing_usage_falls_back_to_estimate() {
        let raw = GeminiResponse {
            candidates: vec![GeminiCandidate {
                content: Some(GeminiContent {
                    role: None,
                    parts: vec![GeminiPart {
                        text: "abcdefgh".to_string(),
                    }],
                }),
                finish_reason: Some("STOP".to_string()),
            }],
            usage_metadata: None,
        };

        let response = convert_response("gemini-2.0-flash", 16, raw);
        let usage = response.usage.unwrap();
        assert!(usage.estimated);
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 2);
    }
}
