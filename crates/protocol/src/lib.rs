//! Remote-runner protocol: WebSocket message types and capability
//! advertisement.
//!
//! Runners are external processes that register the tools they can
//! execute and serve typed request/response calls on behalf of the
//! agent runtime. Every message travels as one JSON text frame.

use serde::{Deserialize, Serialize};

use helm_domain::message::ToolDescriptor;

/// Protocol revision, sent in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// WebSocket message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Runner → Runtime: initial handshake advertising executable tools.
    RunnerHello {
        protocol_version: u32,
        runner_id: String,
        version: String,
        tools: Vec<ToolDescriptor>,
    },

    /// Runtime → Runner: handshake accepted.
    Welcome { session_id: String },

    /// Runtime → Runner: execute a tool call.
    ToolRequest {
        request_id: String,
        tool: String,
        args: serde_json::Value,
    },

    /// Runner → Runtime: tool call outcome.
    ToolResponse {
        request_id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Bidirectional heartbeat.
    Ping { timestamp: i64 },

    /// Heartbeat response.
    Pong { timestamp: i64 },
}
