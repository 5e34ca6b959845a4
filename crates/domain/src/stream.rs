use std::pin::Pin;

use serde::Serialize;

use crate::message::AssistantMessage;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted by a provider adapter while streaming one assistant
/// turn.
///
/// `Start` always comes first with an empty message; `Done` always comes
/// last with the fully aggregated one. Each `TextDelta` carries both the
/// new fragment and the partial aggregate so observers can render either
/// incrementally or from scratch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AssistantMessageEvent {
    Start {
        message: AssistantMessage,
    },
    TextDelta {
        delta: String,
        partial: AssistantMessage,
    },
    Done {
        message: AssistantMessage,
    },
}
