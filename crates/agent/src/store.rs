//! The durable-store contract the agent drives, plus the in-process
//! implementation used by tests and embedders.
//!
//! The agent's correctness rests on two methods being transactional:
//! `materialize` (queue removal + transcript append) and
//! `tool_did_execute` (status flip + tool-result append). A persistent
//! backend (e.g. SQLite) implements the same trait out of tree.

use std::collections::HashMap;

use parking_lot::Mutex;

use helm_domain::error::{Error, Result};
use helm_domain::message::{AssistantMessage, Message, ToolResultMessage, UserMessage};
use helm_domain::queue::{QueueItem, QueueLane};

use crate::state::{EntryId, EntryPayload, SessionId, SessionState, ToolCallStatus, TranscriptEntry};

/// One queued item to move into the transcript.
#[derive(Debug, Clone)]
pub struct MaterializeRequest {
    pub item_id: String,
    pub lane: QueueLane,
}

/// Atomic persistence consumed by the session agent.
///
/// Every method must be crash-safe: a method either happened entirely
/// or not at all as far as a subsequent `load_state` is concerned.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn mark_running(&self, session: &SessionId) -> Result<()>;

    async fn mark_idle(&self, session: &SessionId) -> Result<()>;

    async fn load_state(&self, session: &SessionId) -> Result<SessionState>;

    async fn insert_queue_item(
        &self,
        session: &SessionId,
        item: QueueItem,
        lane: QueueLane,
    ) -> Result<()>;

    async fn cancel_queue_item(
        &self,
        session: &SessionId,
        item_id: &str,
        lane: QueueLane,
    ) -> Result<()>;

    /// Move queued items into the transcript and out of their lanes in
    /// one transaction. Returns the created entries in request order.
    async fn materialize(
        &self,
        session: &SessionId,
        requests: &[MaterializeRequest],
    ) -> Result<Vec<TranscriptEntry>>;

    async fn append_assistant_entry(
        &self,
        session: &SessionId,
        message: &AssistantMessage,
    ) -> Result<EntryId>;

    /// Flip the call's status to `started`.
    async fn tool_will_execute(&self, session: &SessionId, call_id: &str) -> Result<()>;

    /// Single transaction: flip the status to `completed`/`errored` and
    /// append the tool-result entry.
    async fn tool_did_execute(
        &self,
        session: &SessionId,
        call_id: &str,
        output: &ToolResultMessage,
    ) -> Result<EntryId>;

    /// Summarize the transcript prefix and append a compaction marker
    /// atomically.
    async fn perform_compaction(&self, session: &SessionId) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct StoredSession {
    state: SessionState,
    next_entry: EntryId,
    running: bool,
}

impl StoredSession {
    fn next_id(&mut self) -> EntryId {
        self.next_entry += 1;
        self.next_entry
    }
}

/// Process-local [`SessionStore`]. A single mutex makes every method a
/// transaction.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionId, StoredSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_session<T>(
        &self,
        session: &SessionId,
        f: impl FnOnce(&mut StoredSession) -> Result<T>,
    ) -> Result<T> {
        let mut sessions = self.sessions.lock();
        let stored = sessions.entry(session.clone()).or_default();
        f(stored)
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Extractive digest of the entries being compacted away.
fn summarize(entries: &[TranscriptEntry]) -> String {
    let mut lines: Vec<String> = Vec::new();
    for entry in entries {
        match &entry.payload {
            EntryPayload::Message(Message::User(user)) => {
                let text: String = user
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        helm_domain::message::ContentBlock::Text { text, .. } => {
                            Some(text.as_str())
                        }
                        _ => None,
                    })
                    .collect();
                lines.push(format!("user: {}", truncate_str(&text, 120)));
            }
            EntryPayload::Message(Message::Assistant(assistant)) => {
                let calls: Vec<&str> =
                    assistant.tool_calls().map(|tc| tc.name.as_str()).collect();
                let mut line = format!("assistant: {}", truncate_str(&assistant.text(), 120));
                if !calls.is_empty() {
                    line.push_str(&format!(" [tools: {}]", calls.join(", ")));
                }
                lines.push(line);
            }
            EntryPayload::Message(Message::ToolResult(result)) => {
                lines.push(format!(
                    "tool {}: {}",
                    result.tool_name,
                    truncate_str(&result.text(), 120)
                ));
            }
            EntryPayload::Compaction { summary } => {
                lines.push(format!("(earlier summary) {}", truncate_str(summary, 200)));
            }
        }
    }
    lines.join("\n")
}

#[async_trait::async_trait]
impl SessionStore for MemoryStore {
    async fn mark_running(&self, session: &SessionId) -> Result<()> {
        self.with_session(session, |stored| {
            stored.running = true;
            Ok(())
        })
    }

    async fn mark_idle(&self, session: &SessionId) -> Result<()> {
        self.with_session(session, |stored| {
            stored.running = false;
            Ok(())
        })
    }

    async fn load_state(&self, session: &SessionId) -> Result<SessionState> {
        self.with_session(session, |stored| Ok(stored.state.clone()))
    }

    async fn insert_queue_item(
        &self,
        session: &SessionId,
        item: QueueItem,
        lane: QueueLane,
    ) -> Result<()> {
        self.with_session(session, |stored| {
            stored.state.lane_mut(lane).push(item);
            Ok(())
        })
    }

    async fn cancel_queue_item(
        &self,
        session: &SessionId,
        item_id: &str,
        lane: QueueLane,
    ) -> Result<()> {
        self.with_session(session, |stored| {
            let queue = stored.state.lane_mut(lane);
            let before = queue.len();
            queue.retain(|item| item.id != item_id);
            if queue.len() == before {
                return Err(Error::Store(format!("queue item {item_id} not found")));
            }
            Ok(())
        })
    }

    async fn materialize(
        &self,
        session: &SessionId,
        requests: &[MaterializeRequest],
    ) -> Result<Vec<TranscriptEntry>> {
        self.with_session(session, |stored| {
            // Validate everything first so the transaction cannot half-apply.
            for request in requests {
                if !stored
                    .state
                    .lane(request.lane)
                    .iter()
                    .any(|item| item.id == request.item_id)
                {
                    return Err(Error::Store(format!(
                        "queue item {} not found in {:?}",
                        request.item_id, request.lane
                    )));
                }
            }

            let mut entries = Vec::with_capacity(requests.len());
            for request in requests {
                let queue = stored.state.lane_mut(request.lane);
                let Some(pos) = queue.iter().position(|item| item.id == request.item_id) else {
                    return Err(Error::Store(format!(
                        "queue item {} vanished mid-transaction",
                        request.item_id
                    )));
                };
                let item = queue.remove(pos);

                let id = stored.next_id();
                let entry = TranscriptEntry {
                    id,
                    payload: EntryPayload::Message(Message::User(UserMessage {
                        content: item.payload,
                        timestamp: item.enqueued_at,
                    })),
                };
                stored.state.transcript.push(entry.clone());
                entries.push(entry);
            }
            Ok(entries)
        })
    }

    async fn append_assistant_entry(
        &self,
        session: &SessionId,
        message: &AssistantMessage,
    ) -> Result<EntryId> {
        self.with_session(session, |stored| {
            let id = stored.next_id();
            stored.state.transcript.push(TranscriptEntry {
                id,
                payload: EntryPayload::Message(Message::Assistant(message.clone())),
            });
            for call in message.tool_calls() {
                stored
                    .state
                    .tool_call_status
                    .insert(call.id.clone(), ToolCallStatus::Pending);
            }
            Ok(id)
        })
    }

    async fn tool_will_execute(&self, session: &SessionId, call_id: &str) -> Result<()> {
        self.with_session(session, |stored| {
            stored
                .state
                .tool_call_status
                .insert(call_id.to_string(), ToolCallStatus::Started);
            Ok(())
        })
    }

    async fn tool_did_execute(
        &self,
        session: &SessionId,
        call_id: &str,
        output: &ToolResultMessage,
    ) -> Result<EntryId> {
        self.with_session(session, |stored| {
            let status = if output.is_error {
                ToolCallStatus::Errored
            } else {
                ToolCallStatus::Completed
            };
            stored
                .state
                .tool_call_status
                .insert(call_id.to_string(), status);

            let id = stored.next_id();
            stored.state.transcript.push(TranscriptEntry {
                id,
                payload: EntryPayload::Message(Message::ToolResult(output.clone())),
            });
            Ok(id)
        })
    }

    async fn perform_compaction(&self, session: &SessionId) -> Result<()> {
        self.with_session(session, |stored| {
            if stored.state.transcript.is_empty() {
                return Ok(());
            }
            let summary = summarize(&stored.state.transcript);
            let id = stored.next_id();
            stored.state.transcript.push(TranscriptEntry {
                id,
                payload: EntryPayload::Compaction { summary },
            });
            Ok(())
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
