//! Per-request and per-agent configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::Usage;

/// Reasoning-effort hint forwarded to providers that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Xhigh => "xhigh",
        }
    }
}

/// Options recognized on every provider request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// API key override. When absent, the provider's environment
    /// variable is consulted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Extra headers appended to the provider request.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Session identity, forwarded where the provider accepts one
    /// (Codex conversation headers, Responses prompt cache key).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// When to collapse old transcript history into a summary marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionPolicy {
    pub enabled: bool,
    /// Total-token threshold; once a turn reports usage at or above it,
    /// the agent asks the store to compact.
    pub token_budget: u32,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            token_budget: 160_000,
        }
    }
}

impl CompactionPolicy {
    pub fn should_compact(&self, usage: Option<&Usage>) -> bool {
        self.enabled && usage.is_some_and(|u| u.total >= self.token_budget)
    }
}

/// Agent-level configuration.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub system_prompt: Option<String>,
    /// Cap on assistant turns per active run; exceeding it fails the
    /// loop without persisting an assistant entry.
    pub max_turns: Option<u32>,
    pub compaction: CompactionPolicy,
}
