use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::ContentBlock;

/// The three input lanes of a session.
///
/// `System` and `Steer` interrupt a running turn at the next checkpoint;
/// `FollowUp` only drains once the session has nothing else to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueLane {
    System,
    Steer,
    FollowUp,
}

impl QueueLane {
    /// Tie-break priority when two lanes hold items with the same
    /// enqueue time: system before steer before follow-up.
    pub fn priority(&self) -> u8 {
        match self {
            QueueLane::System => 0,
            QueueLane::Steer => 1,
            QueueLane::FollowUp => 2,
        }
    }
}

/// An item waiting in one of the lanes. Lives from `insert_queue_item`
/// until it is materialized into the transcript or cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub enqueued_at: DateTime<Utc>,
    pub payload: Vec<ContentBlock>,
}

impl QueueItem {
    pub fn new(payload: Vec<ContentBlock>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            enqueued_at: Utc::now(),
            payload,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![ContentBlock::text(text)])
    }
}
