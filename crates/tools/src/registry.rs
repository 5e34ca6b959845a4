//! The tool trait and the named registry the agent dispatches through.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use helm_domain::error::{Error, Result};
use helm_domain::json::validate_tool_args;
use helm_domain::message::{ContentBlock, ToolDescriptor};

/// The outcome of a tool execution: renderable content plus structured
/// details for observers.
#[derive(Debug, Clone)]
pub struct AgentToolResult {
    pub content: Vec<ContentBlock>,
    pub details: Value,
}

impl AgentToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            details: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Handle a tool can use to publish progress while it runs. Posts
/// surface as `toolExecutionUpdate` events on the session's bus.
#[derive(Clone)]
pub struct ToolUpdates {
    tx: Option<mpsc::UnboundedSender<Value>>,
}

impl ToolUpdates {
    /// A sink that discards updates (tests, fire-and-forget dispatch).
    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn post(&self, partial: Value) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(partial);
        }
    }
}

/// Per-invocation context handed to a tool.
#[derive(Clone)]
pub struct ToolContext {
    pub call_id: String,
    pub updates: ToolUpdates,
}

/// Trait every executable tool implements.
///
/// Execution may block arbitrarily long and may fail; failures become
/// error tool results at the agent level, never fatal conditions.
#[async_trait::async_trait]
pub trait AgentTool: Send + Sync {
    /// The definition exposed to the LLM.
    fn descriptor(&self) -> ToolDescriptor;

    /// Short human-readable label for logs and UIs.
    fn label(&self) -> &str;

    async fn execute(&self, ctx: ToolContext, args: Value) -> Result<AgentToolResult>;
}

/// A named set of tools.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        self.tools.insert(tool.descriptor().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for provider context building.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Look up a tool, validate the arguments against its schema, and
    /// execute it.
    pub async fn dispatch(
        &self,
        name: &str,
        ctx: ToolContext,
        args: Value,
    ) -> Result<AgentToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::Unsupported(format!("Tool {name} not found")))?;
        validate_tool_args(&tool.descriptor().parameters, &args)?;
        tracing::debug!(tool = %name, call_id = %ctx.call_id, "dispatching tool");
        tool.execute(ctx, args).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
