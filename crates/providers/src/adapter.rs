//! The uniform adapter interface.
//!
//! Three incompatible wire protocols (Anthropic Messages, OpenAI
//! Responses, OpenAI Codex Responses) are collapsed behind one
//! operation returning a uniform event stream. Each adapter is a
//! distinct concrete type selected by [`Provider`] tag; there is no
//! runtime pluggability beyond the three.

use std::sync::Arc;

use helm_domain::error::{Error, Result};
use helm_domain::message::{Message, ToolDescriptor};
use helm_domain::model::{Model, Provider};
use helm_domain::options::RequestOptions;
use helm_domain::stream::{AssistantMessageEvent, BoxStream};

use crate::anthropic::AnthropicAdapter;
use crate::codex::CodexAdapter;
use crate::http::HttpClient;
use crate::openai::OpenAiResponsesAdapter;

/// The provider-agnostic view of a session handed to an adapter.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
}

/// Trait every provider adapter implements.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The provider family this adapter speaks for.
    fn provider(&self) -> Provider;

    /// Open a streaming completion. Yields `Start` immediately, then
    /// `TextDelta`s, and always finishes with `Done` carrying the
    /// aggregated message (unless the stream itself fails).
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &RequestOptions,
    ) -> Result<BoxStream<'static, Result<AssistantMessageEvent>>>;
}

/// Select the concrete adapter for a provider tag.
pub fn adapter_for(provider: Provider, http: HttpClient) -> Arc<dyn ProviderAdapter> {
    match provider {
        Provider::Anthropic => Arc::new(AnthropicAdapter::new(http)),
        Provider::Openai => Arc::new(OpenAiResponsesAdapter::new(http)),
        Provider::OpenaiCodex => Arc::new(CodexAdapter::new(http)),
    }
}

/// Resolve the API key for a request: options first, then the
/// provider's environment variable. Fails on a provider mismatch
/// between the adapter and the requested model.
pub(crate) fn resolve_api_key(
    expected: Provider,
    model: &Model,
    options: &RequestOptions,
) -> Result<String> {
    if model.provider != expected {
        return Err(Error::Unsupported(format!("Expected provider {expected}")));
    }
    if let Some(key) = &options.api_key {
        return Ok(key.clone());
    }
    std::env::var(expected.api_key_env()).map_err(|_| {
        Error::Unsupported(format!(
            "no API key: set {} or pass one in the request options",
            expected.api_key_env()
        ))
    })
}
