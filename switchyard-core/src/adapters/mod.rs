//! Provider adapter layer.
//!
//! An adapter translates the normalized [`ChatRequest`] into one wire
//! protocol family and parses the provider's answer back into the
//! uniform response types. Adapters are stateless: pure functions of
//! their inputs plus the provider-bound HTTP client, so one instance
//! serves every provider of its kind. The dispatch engine picks the
//! first adapter whose `can_handle` matches the provider's configured
//! kind, falling back to the OpenAI-compatible adapter.
//!
//! Streaming is always a legal call: kinds without native streaming
//! yield exactly one terminal aggregated update instead of failing.

use std::pin::Pin;

use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::models::{ChatRequest, ChatResponse, StreamChunk};
use crate::registry::AdapterKind;

pub mod gemini;
pub mod http;
pub mod openai;
pub mod sse_text;

pub use http::ProviderHttpClient;

/// A finite, non-restartable sequence of streaming updates.
pub type UpdateStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, AdapterError>> + Send>>;

#[async_trait::async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Whether this adapter speaks the given wire protocol family.
    fn can_handle(&self, kind: AdapterKind) -> bool;

    /// Whether streams from this adapter are produced incrementally by
    /// the provider, as opposed to a single aggregated update.
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Perform a unary chat completion against the provider.
    async fn execute(
        &self,
        http: &ProviderHttpClient,
        request: &ChatRequest,
        ct: &CancellationToken,
    ) -> Result<ChatResponse, AdapterError>;

    /// Open a streaming chat completion. The returned stream yields
    /// uniform chunks in provider order and terminates after a chunk
    /// carrying a finish reason (or the provider's end-of-stream).
    async fn execute_streaming(
        &self,
        http: &ProviderHttpClient,
        request: &ChatRequest,
        ct: &CancellationToken,
    ) -> Result<UpdateStream, AdapterError>;
}

/// The closed set of registered adapters.
pub struct AdapterSet {
    adapters: Vec<Box<dyn ChatAdapter>>,
    fallback: openai::OpenAiCompatAdapter,
}

impl Default for AdapterSet {
    fn default() -> Self {
        Self {
            adapters: vec![
                Box::new(openai::OpenAiCompatAdapter),
                Box::new(gemini::GeminiAdapter),
                Box::new(sse_text::SseTextAdapter),
            ],
            fallback: openai::OpenAiCompatAdapter,
        }
    }
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// First adapter claiming the kind; OpenAI-compatible otherwise.
    pub fn for_kind(&self, kind: AdapterKind) -> &dyn ChatAdapter {
        self.adapters
            .iter()
            .find(|a| a.can_handle(kind))
            .map(Box::as_ref)
            .unwrap_or(&self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_an_adapter() {
        let set = AdapterSet::new();
        for kind in [
            AdapterKind::OpenAiCompat,
            AdapterKind::GeminiNative,
            AdapterKind::SseText,
        ] {
            assert!(set.for_kind(kind).can_handle(kind));
        }
    }

    #[test]
    fn gemini_adapter_reports_aggregated_streaming() {
        let set = AdapterSet::new();
        assert!(!set.for_kind(AdapterKind::GeminiNative).supports_streaming());
        assert!(set.for_kind(AdapterKind::OpenAiCompat).supports_streaming());
        assert!(set.for_kind(AdapterKind::SseText).supports_streaming());
    }
}
