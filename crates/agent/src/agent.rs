//! The per-session agent loop.
//!
//! A serialized, crash-safe state machine: it materializes queued
//! inputs at checkpoints, streams one assistant turn from the provider,
//! dispatches the turn's tool calls, persists every step through the
//! store, and loops until the model stops asking for tools and the
//! queues are empty. All state mutation flows through the session's
//! [`SerialCell`]; LLM streaming and tool execution run off-queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use helm_domain::error::{Error, Result};
use helm_domain::message::{
    AssistantMessage, ContentBlock, Message, StopReason, ToolCall, ToolResultMessage,
};
use helm_domain::model::Model;
use helm_domain::options::{AgentConfig, RequestOptions};
use helm_domain::queue::{QueueItem, QueueLane};
use helm_domain::stream::AssistantMessageEvent;
use helm_providers::adapter::{Context, ProviderAdapter};
use helm_tools::{ToolContext, ToolRegistry, ToolUpdates};

use crate::events::{AgentEvent, CommittedAction, EventBus};
use crate::serial::SerialCell;
use crate::state::{EntryId, EntryPayload, SessionId, SessionState, ToolCallStatus, TranscriptEntry};
use crate::store::{MaterializeRequest, SessionStore};

/// Content of the synthetic result appended for tool calls skipped by a
/// steer arrival.
const SKIPPED_TOOL_MESSAGE: &str = "Skipped due to queued user message.";
/// Content of the synthetic result appended during crash recovery.
const RECOVERED_TOOL_MESSAGE: &str =
    "Tool execution did not complete before the session was interrupted.";

/// Per-phase bookkeeping: whether `agentStart` has been emitted and the
/// messages produced so far (reported in `agentEnd`).
#[derive(Default)]
struct PhaseLog {
    started: bool,
    messages: Vec<Message>,
}

/// What consuming one provider stream produced.
enum InferenceOutcome {
    Completed(AssistantMessage),
    /// The stream failed; carries the synthetic error assistant.
    Failed(AssistantMessage),
    Cancelled,
}

/// The single-session state machine.
pub struct SessionAgent {
    session_id: SessionId,
    model: Model,
    adapter: Arc<dyn ProviderAdapter>,
    store: Arc<dyn SessionStore>,
    registry: Arc<ToolRegistry>,
    options: RequestOptions,
    config: AgentConfig,
    serial: SerialCell,
    bus: EventBus,
    wake_tx: mpsc::Sender<()>,
    wake_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    started: AtomicBool,
    cancel: CancellationToken,
    last_error: parking_lot::Mutex<Option<String>>,
}

impl SessionAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<SessionId>,
        model: Model,
        adapter: Arc<dyn ProviderAdapter>,
        store: Arc<dyn SessionStore>,
        registry: Arc<ToolRegistry>,
        options: RequestOptions,
        config: AgentConfig,
    ) -> Arc<Self> {
        // Single-slot wake signal: a full channel means the loop is
        // already scheduled to run.
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Arc::new(Self {
            session_id: session_id.into(),
            model,
            adapter,
            store,
            registry,
            options,
            config,
            serial: SerialCell::new(SessionState::default()),
            bus: EventBus::new(),
            wake_tx,
            wake_rx: tokio::sync::Mutex::new(Some(wake_rx)),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            last_error: parking_lot::Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Token the owning task uses to stop the loop.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The most recent loop error (maxTurns, store failure), if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    // ── Public operations ──────────────────────────────────────────

    /// Drive the session until externally cancelled. Callable at most
    /// once.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Unsupported("agent already started".into()));
        }
        let mut wake_rx = self
            .wake_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Unsupported("agent already started".into()))?;

        let loaded = self.store.load_state(&self.session_id).await?;
        self.serial.replace(loaded).await;

        tracing::debug!(session = %self.session_id, "agent loop started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let mut phase = PhaseLog::default();
            if let Err(e) = self.run_active_phase(&mut phase).await {
                tracing::error!(session = %self.session_id, error = %e, "agent loop error");
                *self.last_error.lock() = Some(e.to_string());
            }
            if phase.started {
                self.bus.emit(AgentEvent::AgentEnd {
                    messages: std::mem::take(&mut phase.messages),
                });
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = wake_rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(session = %self.session_id, "agent loop stopped");
        Ok(())
    }

    /// Persist a new queue item, mirror it in memory, and wake the loop.
    pub async fn enqueue(&self, payload: Vec<ContentBlock>, lane: QueueLane) -> Result<String> {
        let item = QueueItem::new(payload);
        let item_id = item.id.clone();

        let store = self.store.clone();
        let sid = self.session_id.clone();
        self.serial
            .run(move |mut st| async move {
                store.insert_queue_item(&sid, item.clone(), lane).await?;
                st.lane_mut(lane).push(item);
                Ok((st, ()))
            })
            .await?;

        let _ = self.wake_tx.try_send(());
        Ok(item_id)
    }

    /// Remove a queued item before it materializes.
    pub async fn cancel_item(&self, item_id: &str, lane: QueueLane) -> Result<()> {
        let store = self.store.clone();
        let sid = self.session_id.clone();
        let id = item_id.to_string();
        self.serial
            .run(move |mut st| async move {
                store.cancel_queue_item(&sid, &id, lane).await?;
                st.lane_mut(lane).retain(|item| item.id != id);
                Ok((st, ()))
            })
            .await
    }

    /// Atomically snapshot state and subscribe to the event stream: no
    /// committed event lands between the two.
    pub async fn observe(
        &self,
    ) -> (SessionState, tokio::sync::broadcast::Receiver<AgentEvent>) {
        self.serial
            .with_lock(|state| (state.clone(), self.bus.subscribe()))
            .await
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.bus.subscribe()
    }

    // ── The turn loop ──────────────────────────────────────────────

    async fn run_active_phase(&self, phase: &mut PhaseLog) -> Result<()> {
        let mut has_tool_results = self.recover_stale_tool_calls(phase).await?;
        let mut turns: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            // Checkpoint: drain the interrupt lanes.
            let drained = self.drain_checkpoint(phase).await?;

            // Idle detection: nothing drained and no tool results to
            // answer -- try the follow-up lane, then go idle.
            if !drained && !has_tool_results {
                let followed = self.drain_follow_up(phase).await?;
                if !followed {
                    if phase.started {
                        self.store.mark_idle(&self.session_id).await?;
                    }
                    return Ok(());
                }
            }
            has_tool_results = false;

            if !phase.started {
                phase.started = true;
                self.store.mark_running(&self.session_id).await?;
                self.bus.emit(AgentEvent::AgentStart);
            }

            turns += 1;
            if let Some(max) = self.config.max_turns {
                if turns > max {
                    return Err(Error::Unsupported(format!(
                        "Agent loop exceeded maxTurns={max}"
                    )));
                }
            }

            // Inference runs off the serialization queue.
            self.bus.emit(AgentEvent::TurnStart);
            let assistant = match self.run_inference().await {
                InferenceOutcome::Completed(message) => message,
                InferenceOutcome::Failed(message) => message,
                InferenceOutcome::Cancelled => return Ok(()),
            };

            self.persist_assistant(&assistant).await?;
            phase.messages.push(Message::Assistant(assistant.clone()));

            if assistant.stop_reason == StopReason::Error {
                self.bus.emit(AgentEvent::TurnEnd {
                    assistant,
                    tool_results: Vec::new(),
                });
                return Ok(());
            }

            let tool_results = self.dispatch_tools(&assistant).await?;
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            has_tool_results = !tool_results.is_empty();
            phase
                .messages
                .extend(tool_results.iter().cloned().map(Message::ToolResult));
            self.bus.emit(AgentEvent::TurnEnd {
                assistant: assistant.clone(),
                tool_results,
            });

            if self.config.compaction.should_compact(assistant.usage.as_ref()) {
                self.run_compaction().await?;
            }
        }
    }

    /// Step 1 of the loop: append error results for tool calls a
    /// previous process left in `started`.
    async fn recover_stale_tool_calls(&self, phase: &mut PhaseLog) -> Result<bool> {
        let stale: Vec<ToolCall> = self.serial.with_lock(|st| st.stale_started_calls()).await;
        if stale.is_empty() {
            return Ok(false);
        }

        if !phase.started {
            phase.started = true;
            self.store.mark_running(&self.session_id).await?;
            self.bus.emit(AgentEvent::AgentStart);
        }

        for call in stale {
            tracing::warn!(
                session = %self.session_id,
                call_id = %call.id,
                tool = %call.name,
                "recovering stale tool call"
            );
            let result = ToolResultMessage {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: vec![ContentBlock::text(RECOVERED_TOOL_MESSAGE)],
                details: serde_json::json!({ "recovered": true }),
                is_error: true,
                timestamp: Utc::now(),
            };
            self.record_tool_result(&result).await?;
            phase.messages.push(Message::ToolResult(result));
        }
        Ok(true)
    }

    /// Materialize system and steer items, ordered by enqueue time with
    /// system winning ties.
    async fn drain_checkpoint(&self, phase: &mut PhaseLog) -> Result<bool> {
        let store = self.store.clone();
        let sid = self.session_id.clone();
        let bus = self.bus.clone();
        let entries = self
            .serial
            .run(move |mut st| async move {
                let mut queued: Vec<(QueueLane, QueueItem)> = st
                    .system_queue
                    .drain(..)
                    .map(|item| (QueueLane::System, item))
                    .chain(st.steer_queue.drain(..).map(|item| (QueueLane::Steer, item)))
                    .collect();
                if queued.is_empty() {
                    return Ok((st, Vec::new()));
                }
                queued.sort_by(|a, b| {
                    a.1.enqueued_at
                        .cmp(&b.1.enqueued_at)
                        .then(a.0.priority().cmp(&b.0.priority()))
                });

                let requests: Vec<MaterializeRequest> = queued
                    .iter()
                    .map(|(lane, item)| MaterializeRequest {
                        item_id: item.id.clone(),
                        lane: *lane,
                    })
                    .collect();
                let entries = store.materialize(&sid, &requests).await?;
                st.transcript.extend(entries.iter().cloned());
                bus.emit(AgentEvent::Committed {
                    action: CommittedAction::Materialized {
                        entries: entries.clone(),
                    },
                });
                Ok((st, entries))
            })
            .await?;

        self.collect_materialized(phase, &entries);
        Ok(!entries.is_empty())
    }

    async fn drain_follow_up(&self, phase: &mut PhaseLog) -> Result<bool> {
        let store = self.store.clone();
        let sid = self.session_id.clone();
        let bus = self.bus.clone();
        let entries = self
            .serial
            .run(move |mut st| async move {
                if st.follow_up_queue.is_empty() {
                    return Ok((st, Vec::new()));
                }
                let requests: Vec<MaterializeRequest> = st
                    .follow_up_queue
                    .drain(..)
                    .map(|item| MaterializeRequest {
                        item_id: item.id,
                        lane: QueueLane::FollowUp,
                    })
                    .collect();
                let entries = store.materialize(&sid, &requests).await?;
                st.transcript.extend(entries.iter().cloned());
                bus.emit(AgentEvent::Committed {
                    action: CommittedAction::Materialized {
                        entries: entries.clone(),
                    },
                });
                Ok((st, entries))
            })
            .await?;

        self.collect_materialized(phase, &entries);
        Ok(!entries.is_empty())
    }

    fn collect_materialized(&self, phase: &mut PhaseLog, entries: &[TranscriptEntry]) {
        for entry in entries {
            if let EntryPayload::Message(message) = &entry.payload {
                phase.messages.push(message.clone());
            }
        }
    }

    // ── Inference ──────────────────────────────────────────────────

    async fn run_inference(&self) -> InferenceOutcome {
        let messages = self.serial.with_lock(|st| st.context_messages()).await;
        let context = Context {
            system_prompt: self.config.system_prompt.clone(),
            messages,
            tools: self.registry.descriptors(),
        };

        let mut stream = match self
            .adapter
            .stream(&self.model, &context, &self.options)
            .await
        {
            Ok(stream) => stream,
            Err(e) => return InferenceOutcome::Failed(self.synthetic_error(None, &e)),
        };

        let mut latest = AssistantMessage::empty(self.model.provider, self.model.id.clone());
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Dropping the stream closes the SSE response and
                    // cancels the underlying request.
                    return InferenceOutcome::Cancelled;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(AssistantMessageEvent::Start { message })) => {
                    latest = message.clone();
                    self.bus.emit(AgentEvent::MessageStart {
                        message: Message::Assistant(message),
                    });
                }
                Some(Ok(AssistantMessageEvent::TextDelta { delta, partial })) => {
                    latest = partial.clone();
                    self.bus.emit(AgentEvent::MessageUpdate {
                        message: Message::Assistant(partial),
                        delta,
                    });
                }
                Some(Ok(AssistantMessageEvent::Done { message })) => {
                    self.bus.emit(AgentEvent::MessageEnd {
                        message: Message::Assistant(message.clone()),
                    });
                    return InferenceOutcome::Completed(message);
                }
                Some(Err(e)) => {
                    return InferenceOutcome::Failed(self.synthetic_error(Some(latest), &e));
                }
                None => {
                    // Adapters always close with Done; treat a bare end
                    // as the aggregate seen so far.
                    return InferenceOutcome::Completed(latest);
                }
            }
        }
    }

    fn synthetic_error(&self, partial: Option<AssistantMessage>, error: &Error) -> AssistantMessage {
        let mut message = partial
            .unwrap_or_else(|| AssistantMessage::empty(self.model.provider, self.model.id.clone()));
        message.stop_reason = StopReason::Error;
        message.error_message = Some(error.to_string());
        message
    }

    // ── Persistence helpers (serialized blocks) ────────────────────

    async fn persist_assistant(&self, assistant: &AssistantMessage) -> Result<EntryId> {
        let store = self.store.clone();
        let sid = self.session_id.clone();
        let bus = self.bus.clone();
        let message = assistant.clone();
        self.serial
            .run(move |mut st| async move {
                let entry_id = store.append_assistant_entry(&sid, &message).await?;
                st.transcript.push(TranscriptEntry {
                    id: entry_id,
                    payload: EntryPayload::Message(Message::Assistant(message.clone())),
                });
                for call in message.tool_calls() {
                    st.tool_call_status
                        .insert(call.id.clone(), ToolCallStatus::Pending);
                }
                bus.emit(AgentEvent::Committed {
                    action: CommittedAction::AssistantAppended {
                        entry_id,
                        message: message.clone(),
                    },
                });
                Ok((st, entry_id))
            })
            .await
    }

    async fn mark_tool_started(&self, call_id: &str) -> Result<()> {
        let store = self.store.clone();
        let sid = self.session_id.clone();
        let bus = self.bus.clone();
        let call_id = call_id.to_string();
        self.serial
            .run(move |mut st| async move {
                store.tool_will_execute(&sid, &call_id).await?;
                st.tool_call_status
                    .insert(call_id.clone(), ToolCallStatus::Started);
                bus.emit(AgentEvent::Committed {
                    action: CommittedAction::ToolStarted { call_id },
                });
                Ok((st, ()))
            })
            .await
    }

    async fn record_tool_result(&self, result: &ToolResultMessage) -> Result<EntryId> {
        let store = self.store.clone();
        let sid = self.session_id.clone();
        let bus = self.bus.clone();
        let message = result.clone();
        self.serial
            .run(move |mut st| async move {
                let entry_id = store
                    .tool_did_execute(&sid, &message.tool_call_id, &message)
                    .await?;
                let status = if message.is_error {
                    ToolCallStatus::Errored
                } else {
                    ToolCallStatus::Completed
                };
                st.tool_call_status
                    .insert(message.tool_call_id.clone(), status);
                st.transcript.push(TranscriptEntry {
                    id: entry_id,
                    payload: EntryPayload::Message(Message::ToolResult(message.clone())),
                });
                bus.emit(AgentEvent::Committed {
                    action: CommittedAction::ToolResultRecorded { entry_id, message },
                });
                Ok((st, entry_id))
            })
            .await
    }

    async fn run_compaction(&self) -> Result<()> {
        let store = self.store.clone();
        let sid = self.session_id.clone();
        let bus = self.bus.clone();
        tracing::debug!(session = %self.session_id, "running compaction");
        self.serial
            .run(move |_st| async move {
                store.perform_compaction(&sid).await?;
                // Re-read so the in-memory transcript picks up the marker.
                let fresh = store.load_state(&sid).await?;
                bus.emit(AgentEvent::Committed {
                    action: CommittedAction::Compacted,
                });
                Ok((fresh, ()))
            })
            .await
    }

    // ── Tool dispatch ──────────────────────────────────────────────

    /// Execute the turn's tool calls in submission order.
    ///
    /// Statuses flip to `started` up front; results are recorded in the
    /// same submission order, so the transcript stays deterministic. A
    /// steer or system arrival lets the in-flight call finish and skips
    /// every call not yet started with a synthetic error result.
    async fn dispatch_tools(
        &self,
        assistant: &AssistantMessage,
    ) -> Result<Vec<ToolResultMessage>> {
        let calls: Vec<ToolCall> = assistant.tool_calls().cloned().collect();
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        for call in &calls {
            self.mark_tool_started(&call.id).await?;
        }

        let mut results: Vec<ToolResultMessage> = Vec::with_capacity(calls.len());
        let mut skip_rest = false;

        for call in &calls {
            if self.cancel.is_cancelled() {
                // Remaining calls stay `started`; restart recovery
                // turns them into error results.
                return Ok(results);
            }

            if !skip_rest && self.serial.with_lock(|st| st.has_interrupt()).await {
                skip_rest = true;
            }

            if skip_rest {
                let result = ToolResultMessage {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    content: vec![ContentBlock::text(SKIPPED_TOOL_MESSAGE)],
                    details: serde_json::json!({ "skipped": true }),
                    is_error: true,
                    timestamp: Utc::now(),
                };
                self.record_tool_result(&result).await?;
                self.bus.emit(AgentEvent::ToolExecutionEnd {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    result: result.content.clone(),
                    is_error: true,
                });
                results.push(result);
                continue;
            }

            self.bus.emit(AgentEvent::ToolExecutionStart {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
            });

            let Some(result) = self.execute_tool(call).await else {
                // Cancelled mid-execution; see above.
                return Ok(results);
            };

            self.bus.emit(AgentEvent::ToolExecutionEnd {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                result: result.content.clone(),
                is_error: result.is_error,
            });
            self.record_tool_result(&result).await?;
            results.push(result);
        }

        Ok(results)
    }

    /// Run one tool off-queue, relaying its progress updates. `None`
    /// means the agent was cancelled while the tool ran.
    async fn execute_tool(&self, call: &ToolCall) -> Option<ToolResultMessage> {
        let (updates, mut update_rx) = ToolUpdates::channel();
        let ctx = ToolContext {
            call_id: call.id.clone(),
            updates,
        };

        let execution = self
            .registry
            .dispatch(&call.name, ctx, call.arguments.clone());
        tokio::pin!(execution);

        let outcome = loop {
            tokio::select! {
                // Drain progress before completion so updates posted
                // just ahead of the result are not lost.
                biased;
                Some(partial) = update_rx.recv() => {
                    self.bus.emit(AgentEvent::ToolExecutionUpdate {
                        call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        partial,
                    });
                }
                _ = self.cancel.cancelled() => return None,
                outcome = &mut execution => break outcome,
            }
        };
        while let Ok(partial) = update_rx.try_recv() {
            self.bus.emit(AgentEvent::ToolExecutionUpdate {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                partial,
            });
        }

        let (content, details, is_error) = match outcome {
            Ok(result) => (result.content, result.details, false),
            Err(e) => {
                tracing::warn!(
                    session = %self.session_id,
                    call_id = %call.id,
                    tool = %call.name,
                    error = %e,
                    "tool execution failed"
                );
                (
                    vec![ContentBlock::text(e.to_string())],
                    Value::Object(serde_json::Map::new()),
                    true,
                )
            }
        };

        Some(ToolResultMessage {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content,
            details,
            is_error,
            timestamp: Utc::now(),
        })
    }
}
