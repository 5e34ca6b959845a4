//! In-memory session state: the transcript, tool-call statuses, and the
//! three input lanes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use helm_domain::message::{Message, ToolCall};
use helm_domain::queue::{QueueItem, QueueLane};

pub type SessionId = String;
pub type EntryId = u64;

/// Lifecycle of one tool call, from the first appearance of its
/// assistant entry until its result is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Started,
    Completed,
    Errored,
}

/// What one transcript entry holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EntryPayload {
    #[serde(rename = "message")]
    Message(Message),
    /// Marker appended by compaction: everything before it is
    /// summarized by `summary`.
    #[serde(rename = "compaction")]
    Compaction { summary: String },
}

/// One element of the append-only transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: EntryId,
    pub payload: EntryPayload,
}

/// Everything the agent knows about one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub transcript: Vec<TranscriptEntry>,
    pub tool_call_status: HashMap<String, ToolCallStatus>,
    pub system_queue: Vec<QueueItem>,
    pub steer_queue: Vec<QueueItem>,
    pub follow_up_queue: Vec<QueueItem>,
}

impl SessionState {
    pub fn lane(&self, lane: QueueLane) -> &Vec<QueueItem> {
        match lane {
            QueueLane::System => &self.system_queue,
            QueueLane::Steer => &self.steer_queue,
            QueueLane::FollowUp => &self.follow_up_queue,
        }
    }

    pub fn lane_mut(&mut self, lane: QueueLane) -> &mut Vec<QueueItem> {
        match lane {
            QueueLane::System => &mut self.system_queue,
            QueueLane::Steer => &mut self.steer_queue,
            QueueLane::FollowUp => &mut self.follow_up_queue,
        }
    }

    /// A system or steer item is waiting.
    pub fn has_interrupt(&self) -> bool {
        !self.system_queue.is_empty() || !self.steer_queue.is_empty()
    }

    /// Tool calls left in `started` by a previous process: each needs a
    /// crash-recovery error result before the loop resumes.
    pub fn stale_started_calls(&self) -> Vec<ToolCall> {
        self.tool_call_status
            .iter()
            .filter(|(_, status)| **status == ToolCallStatus::Started)
            .filter_map(|(call_id, _)| self.find_tool_call(call_id).cloned())
            .collect()
    }

    /// Locate the assistant-declared call for a call id.
    pub fn find_tool_call(&self, call_id: &str) -> Option<&ToolCall> {
        self.transcript.iter().rev().find_map(|entry| {
            let EntryPayload::Message(Message::Assistant(assistant)) = &entry.payload else {
                return None;
            };
            assistant.tool_calls().find(|tc| tc.id == call_id)
        })
    }

    /// Project the transcript into the provider-agnostic message list.
    ///
    /// Entries before the last compaction marker are replaced by the
    /// marker's summary, rendered as a user message.
    pub fn context_messages(&self) -> Vec<Message> {
        let boundary = self
            .transcript
            .iter()
            .rposition(|e| matches!(e.payload, EntryPayload::Compaction { .. }))
            .unwrap_or(0);

        self.transcript[boundary..]
            .iter()
            .map(|entry| match &entry.payload {
                EntryPayload::Message(msg) => msg.clone(),
                EntryPayload::Compaction { summary } => Message::user_text(format!(
                    "Summary of the conversation so far:\n{summary}"
                )),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_domain::message::{AssistantMessage, ContentBlock};
    use helm_domain::model::Provider;

    fn assistant_with_call(call_id: &str) -> Message {
        let mut msg = AssistantMessage::empty(Provider::Anthropic, "m");
        msg.content.push(ContentBlock::ToolCall(ToolCall {
            id: call_id.into(),
            name: "echo".into(),
            arguments: serde_json::json!({}),
        }));
        Message::Assistant(msg)
    }

    #[test]
    fn stale_calls_resolve_names_from_transcript() {
        let mut state = SessionState::default();
        state.transcript.push(TranscriptEntry {
            id: 1,
            payload: EntryPayload::Message(assistant_with_call("t2")),
        });
        state
            .tool_call_status
            .insert("t1".into(), ToolCallStatus::Completed);
        state
            .tool_call_status
            .insert("t2".into(), ToolCallStatus::Started);

        let stale = state.stale_started_calls();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "t2");
        assert_eq!(stale[0].name, "echo");
    }

    #[test]
    fn context_projection_cuts_at_last_compaction_marker() {
        let mut state = SessionState::default();
        state.transcript.push(TranscriptEntry {
            id: 1,
            payload: EntryPayload::Message(Message::user_text("old")),
        });
        state.transcript.push(TranscriptEntry {
            id: 2,
            payload: EntryPayload::Compaction {
                summary: "the user said old".into(),
            },
        });
        state.transcript.push(TranscriptEntry {
            id: 3,
            payload: EntryPayload::Message(Message::user_text("new")),
        });

        let messages = state.context_messages();
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            Message::User(u) => {
                let text = match &u.content[0] {
                    ContentBlock::Text { text, .. } => text,
                    other => panic!("expected text, got {other:?}"),
                };
                assert!(text.contains("the user said old"));
            }
            other => panic!("expected summary user message, got {other:?}"),
        }
    }

    #[test]
    fn interrupt_reflects_system_and_steer_only() {
        let mut state = SessionState::default();
        assert!(!state.has_interrupt());
        state.follow_up_queue.push(QueueItem::text("later"));
        assert!(!state.has_interrupt());
        state.steer_queue.push(QueueItem::text("now"));
        assert!(state.has_interrupt());
    }
}
