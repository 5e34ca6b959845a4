//! Provider adapters for the Helm runtime: a shared SSE framer, the
//! process-wide HTTP client, and the three streaming adapters
//! (Anthropic Messages, OpenAI Responses, OpenAI Codex Responses)
//! behind one [`ProviderAdapter`] interface.

pub mod adapter;
pub mod anthropic;
pub mod codex;
pub mod http;
pub mod openai;
pub mod sse;

// Re-exports for convenience.
pub use adapter::{adapter_for, Context, ProviderAdapter};
pub use http::HttpClient;
pub use sse::{drain_frames, SseFrame};
