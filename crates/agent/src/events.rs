//! Per-session observation stream.
//!
//! Two classes of events ride the same bus: streaming events (deltas,
//! turn markers, tool progress), which a slow observer may lose, and
//! committed events, one per store-committed action in serialization
//! order. The transport is bounded; observers that fall behind receive
//! a `Lagged` notice and should re-read the store, which is the source
//! of truth for anything committed.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use helm_domain::message::{AssistantMessage, ContentBlock, Message, ToolResultMessage};

use crate::state::{EntryId, TranscriptEntry};

/// Bus capacity: the newest 1024 events are retained per receiver.
pub const EVENT_BUFFER: usize = 1024;

/// A store-committed mutation, emitted inside the serialized block that
/// performed it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CommittedAction {
    Materialized { entries: Vec<TranscriptEntry> },
    AssistantAppended {
        entry_id: EntryId,
        message: AssistantMessage,
    },
    ToolStarted { call_id: String },
    ToolResultRecorded {
        entry_id: EntryId,
        message: ToolResultMessage,
    },
    Compacted,
}

/// Everything observable about a running session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentEvent {
    AgentStart,
    AgentEnd { messages: Vec<Message> },

    TurnStart,
    TurnEnd {
        assistant: AssistantMessage,
        tool_results: Vec<ToolResultMessage>,
    },

    MessageStart { message: Message },
    MessageUpdate { message: Message, delta: String },
    MessageEnd { message: Message },

    ToolExecutionStart {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolExecutionUpdate {
        call_id: String,
        tool_name: String,
        arguments: Value,
        partial: Value,
    },
    ToolExecutionEnd {
        call_id: String,
        tool_name: String,
        result: Vec<ContentBlock>,
        is_error: bool,
    },

    Committed { action: CommittedAction },
}

/// Broadcast-backed bus; cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Emit to all current observers. A session with no observers is
    /// normal; the send result is intentionally ignored.
    pub fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}
