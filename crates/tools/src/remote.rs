//! Remote tool runner client.
//!
//! Connects to a runner over a persistent WebSocket, performs the hello
//! handshake, and dispatches typed request/response tool calls. Each
//! in-flight call parks on a oneshot keyed by request id; when the
//! socket drops, every pending call fails with a disconnect error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsFrame;

use helm_domain::error::{Error, Result};
use helm_domain::message::ToolDescriptor;
use helm_protocol::WsMessage;

use crate::registry::{AgentTool, AgentToolResult, ToolContext};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>>;

/// A connected remote runner.
pub struct RemoteRunnerClient {
    runner_id: String,
    tools: Vec<ToolDescriptor>,
    outbound: mpsc::Sender<WsMessage>,
    pending: PendingMap,
}

impl RemoteRunnerClient {
    /// Connect to a runner, await its hello, and reply with a welcome.
    ///
    /// Spawns the writer and reader tasks; both end when the socket
    /// closes or the client is dropped.
    pub async fn connect(url: &str, session_id: &str) -> Result<Self> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::Transport(format!("runner connect failed: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        // ── Await runner_hello ───────────────────────────────────────
        let hello = tokio::time::timeout(HELLO_TIMEOUT, async {
            while let Some(Ok(frame)) = stream.next().await {
                if let WsFrame::Text(text) = frame {
                    if let Ok(WsMessage::RunnerHello {
                        runner_id, tools, ..
                    }) = serde_json::from_str(&text)
                    {
                        return Some((runner_id, tools));
                    }
                }
            }
            None
        })
        .await;

        let (runner_id, tools) = match hello {
            Ok(Some(hello)) => hello,
            Ok(None) => {
                return Err(Error::Transport(
                    "runner closed before completing the handshake".into(),
                ))
            }
            Err(_) => return Err(Error::Transport("runner hello timeout".into())),
        };

        let welcome = WsMessage::Welcome {
            session_id: session_id.to_string(),
        };
        let json = serde_json::to_string(&welcome)?;
        sink.send(WsFrame::Text(json))
            .await
            .map_err(|e| Error::Transport(format!("welcome send failed: {e}")))?;

        tracing::debug!(runner_id = %runner_id, tools = tools.len(), "runner connected");

        // ── Writer task ──────────────────────────────────────────────
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(64);
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize outbound message");
                        continue;
                    }
                };
                if sink.send(WsFrame::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        // ── Reader task ──────────────────────────────────────────────
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader_outbound = outbound_tx.clone();
        let reader_runner_id = runner_id.clone();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = stream.next().await {
                match frame {
                    WsFrame::Text(text) => match serde_json::from_str::<WsMessage>(&text) {
                        Ok(WsMessage::ToolResponse {
                            request_id,
                            ok,
                            result,
                            error,
                        }) => {
                            let waiter = reader_pending.lock().remove(&request_id);
                            if let Some(tx) = waiter {
                                let outcome = if ok {
                                    Ok(result.unwrap_or(Value::Null))
                                } else {
                                    Err(Error::Transport(format!(
                                        "remote runner: {}",
                                        error.unwrap_or_else(|| "tool failed".into())
                                    )))
                                };
                                let _ = tx.send(outcome);
                            }
                        }
                        Ok(WsMessage::Ping { timestamp }) => {
                            let _ = reader_outbound.send(WsMessage::Pong { timestamp }).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(error = %e, "failed to parse runner message");
                        }
                    },
                    WsFrame::Close(_) => break,
                    _ => {}
                }
            }

            // Disconnect: fail everything still waiting.
            let waiters: Vec<_> = reader_pending.lock().drain().collect();
            if !waiters.is_empty() {
                tracing::warn!(
                    runner_id = %reader_runner_id,
                    pending = waiters.len(),
                    "runner disconnected with pending tool calls"
                );
            }
            for (_, tx) in waiters {
                let _ = tx.send(Err(Error::Transport("runner disconnected".into())));
            }
        });

        Ok(Self {
            runner_id,
            tools,
            outbound: outbound_tx,
            pending,
        })
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// Tools advertised in the runner's hello.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Dispatch one tool call and await its response.
    pub async fn invoke(&self, tool: &str, args: Value) -> Result<Value> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        let request = WsMessage::ToolRequest {
            request_id: request_id.clone(),
            tool: tool.to_string(),
            args,
        };
        if self.outbound.send(request).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(Error::Transport("runner disconnected".into()));
        }

        rx.await
            .map_err(|_| Error::Transport("runner disconnected".into()))?
    }
}

/// One remote tool exposed through the [`AgentTool`] interface.
pub struct RemoteTool {
    client: Arc<RemoteRunnerClient>,
    descriptor: ToolDescriptor,
    label: String,
}

impl RemoteTool {
    pub fn new(client: Arc<RemoteRunnerClient>, descriptor: ToolDescriptor) -> Self {
        let label = format!("{}:{}", client.runner_id(), descriptor.name);
        Self {
            client,
            descriptor,
            label,
        }
    }
}

#[async_trait::async_trait]
impl AgentTool for RemoteTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn execute(&self, _ctx: ToolContext, args: Value) -> Result<AgentToolResult> {
        let result = self.client.invoke(&self.descriptor.name, args).await?;
        let rendered = match &result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(AgentToolResult {
            content: vec![helm_domain::message::ContentBlock::text(rendered)],
            details: result,
        })
    }
}

/// Wrap every tool a runner advertises.
pub fn remote_tools(client: &Arc<RemoteRunnerClient>) -> Vec<Arc<dyn AgentTool>> {
    client
        .tools()
        .iter()
        .map(|descriptor| {
            Arc::new(RemoteTool::new(client.clone(), descriptor.clone())) as Arc<dyn AgentTool>
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
