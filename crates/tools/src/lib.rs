//! Tools for the Helm runtime: the [`AgentTool`] trait, the named
//! registry the agent dispatches through, and the WebSocket client that
//! adapts remote-runner tools to the same interface.

pub mod registry;
pub mod remote;

pub use registry::{AgentTool, AgentToolResult, ToolContext, ToolRegistry, ToolUpdates};
pub use remote::{remote_tools, RemoteRunnerClient, RemoteTool};
