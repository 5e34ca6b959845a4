//! End-to-end tests of the session agent loop against a scripted
//! provider adapter and the in-memory store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use helm_agent::{
    AgentEvent, CommittedAction, EntryPayload, MemoryStore, SessionAgent, SessionManager,
    SessionState, SessionStore, ToolCallStatus,
};
use helm_domain::error::{Error, Result};
use helm_domain::message::{
    AssistantMessage, ContentBlock, Message, StopReason, ToolCall, ToolDescriptor,
    ToolResultMessage,
};
use helm_domain::model::{Model, Provider};
use helm_domain::options::{AgentConfig, RequestOptions};
use helm_domain::queue::{QueueItem, QueueLane};
use helm_domain::stream::{AssistantMessageEvent, BoxStream};
use helm_providers::adapter::{Context, ProviderAdapter};
use helm_tools::{AgentTool, AgentToolResult, ToolContext, ToolRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type Turn = Vec<Result<AssistantMessageEvent>>;

/// Replays pre-built event scripts, one per inference, and records the
/// contexts it was asked to complete.
struct ScriptedAdapter {
    provider: Provider,
    turns: Mutex<VecDeque<Turn>>,
    contexts: Mutex<Vec<Context>>,
}

impl ScriptedAdapter {
    fn new(provider: Provider, turns: Vec<Turn>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            turns: Mutex::new(turns.into()),
            contexts: Mutex::new(Vec::new()),
        })
    }

    fn contexts(&self) -> Vec<Context> {
        self.contexts.lock().clone()
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        _options: &RequestOptions,
    ) -> Result<BoxStream<'static, Result<AssistantMessageEvent>>> {
        self.contexts.lock().push(context.clone());
        let turn = self
            .turns
            .lock()
            .pop_front()
            .unwrap_or_else(|| text_turn(self.provider, &model.id, &[]));
        Ok(Box::pin(futures_util::stream::iter(turn)))
    }
}

fn text_turn(provider: Provider, model_id: &str, chunks: &[&str]) -> Turn {
    let mut message = AssistantMessage::empty(provider, model_id);
    let mut events: Turn = vec![Ok(AssistantMessageEvent::Start {
        message: message.clone(),
    })];
    message.content.push(ContentBlock::text(""));
    for chunk in chunks {
        if let ContentBlock::Text { text, .. } = &mut message.content[0] {
            text.push_str(chunk);
        }
        events.push(Ok(AssistantMessageEvent::TextDelta {
            delta: chunk.to_string(),
            partial: message.clone(),
        }));
    }
    events.push(Ok(AssistantMessageEvent::Done { message }));
    events
}

fn tool_turn(provider: Provider, model_id: &str, calls: &[(&str, &str, Value)]) -> Turn {
    let mut message = AssistantMessage::empty(provider, model_id);
    for (id, name, arguments) in calls {
        message.content.push(ContentBlock::ToolCall(ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.clone(),
        }));
    }
    message.stop_reason = StopReason::ToolUse;
    vec![
        Ok(AssistantMessageEvent::Start {
            message: AssistantMessage::empty(provider, model_id),
        }),
        Ok(AssistantMessageEvent::Done { message }),
    ]
}

fn failing_turn(provider: Provider, model_id: &str) -> Turn {
    vec![
        Ok(AssistantMessageEvent::Start {
            message: AssistantMessage::empty(provider, model_id),
        }),
        Err(Error::HttpStatus {
            status: 529,
            body: "overloaded".into(),
        }),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct EchoTool;

#[async_trait::async_trait]
impl AgentTool for EchoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "echo".into(),
            description: "echoes the text argument".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"],
            }),
        }
    }

    fn label(&self) -> &str {
        "Echo"
    }

    async fn execute(&self, _ctx: ToolContext, args: Value) -> Result<AgentToolResult> {
        Ok(AgentToolResult::text(
            args["text"].as_str().unwrap_or_default(),
        ))
    }
}

/// Announces each invocation, and blocks on `release` when asked to run
/// step "B".
struct GatedTool {
    started: mpsc::UnboundedSender<String>,
    release: Arc<tokio::sync::Notify>,
}

#[async_trait::async_trait]
impl AgentTool for GatedTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "work".into(),
            description: "performs one step".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "which": { "type": "string" } },
            }),
        }
    }

    fn label(&self) -> &str {
        "Work"
    }

    async fn execute(&self, _ctx: ToolContext, args: Value) -> Result<AgentToolResult> {
        let which = args["which"].as_str().unwrap_or_default().to_string();
        let _ = self.started.send(which.clone());
        if which == "B" {
            self.release.notified().await;
        }
        Ok(AgentToolResult::text(format!("done {which}")))
    }
}

/// Never returns; used to park the loop inside a tool execution.
struct HangTool;

#[async_trait::async_trait]
impl AgentTool for HangTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "hang".into(),
            description: "never finishes".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    fn label(&self) -> &str {
        "Hang"
    }

    async fn execute(&self, _ctx: ToolContext, _args: Value) -> Result<AgentToolResult> {
        futures_util::future::pending::<()>().await;
        unreachable!()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    agent: Arc<SessionAgent>,
    task: tokio::task::JoinHandle<Result<()>>,
    /// Subscribed before `start()` runs, so nothing is missed.
    rx: Option<tokio::sync::broadcast::Receiver<AgentEvent>>,
}

fn model_for(provider: Provider) -> Model {
    match provider {
        Provider::Anthropic => Model::new("claude-sonnet-4-20250514", provider),
        _ => Model::new("gpt-4o", provider),
    }
}

fn spawn_agent(
    session: &str,
    adapter: Arc<ScriptedAdapter>,
    store: Arc<MemoryStore>,
    registry: ToolRegistry,
    config: AgentConfig,
) -> Harness {
    let agent = SessionAgent::new(
        session,
        model_for(adapter.provider),
        adapter.clone(),
        store.clone() as Arc<dyn SessionStore>,
        Arc::new(registry),
        RequestOptions::default(),
        config,
    );
    let rx = agent.subscribe();
    let task = tokio::spawn({
        let agent = agent.clone();
        async move { agent.start().await }
    });
    Harness {
        agent,
        task,
        rx: Some(rx),
    }
}

impl Harness {
    fn take_rx(&mut self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.rx.take().expect("event receiver already taken")
    }

    async fn stop(self) {
        self.agent.cancellation().cancel();
        let _ = self.task.await;
    }
}

async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<AgentEvent>) -> AgentEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

/// Collect events until (and including) the next `AgentEnd`.
async fn collect_until_agent_end(
    rx: &mut tokio::sync::broadcast::Receiver<AgentEvent>,
) -> Vec<AgentEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches!(event, AgentEvent::AgentEnd { .. });
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn transcript_messages(state: &SessionState) -> Vec<&Message> {
    state
        .transcript
        .iter()
        .filter_map(|entry| match &entry.payload {
            EntryPayload::Message(msg) => Some(msg),
            EntryPayload::Compaction { .. } => None,
        })
        .collect()
}

fn user_text_of(message: &Message) -> &str {
    match message {
        Message::User(user) => match &user.content[0] {
            ContentBlock::Text { text, .. } => text,
            other => panic!("expected text block, got {other:?}"),
        },
        other => panic!("expected user message, got {other:?}"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn steer_text_only_turn() {
    let adapter = ScriptedAdapter::new(
        Provider::Anthropic,
        vec![text_turn(Provider::Anthropic, "claude-sonnet-4-20250514", &["Hi", " there."])],
    );
    let store = Arc::new(MemoryStore::new());
    let mut harness = spawn_agent("s1", adapter, store.clone(), ToolRegistry::new(), AgentConfig::default());

    let mut rx = harness.take_rx();
    harness
        .agent
        .enqueue(vec![ContentBlock::text("Hello.")], QueueLane::Steer)
        .await
        .unwrap();
    collect_until_agent_end(&mut rx).await;

    let state = store.load_state(&"s1".to_string()).await.unwrap();
    let messages = transcript_messages(&state);
    assert_eq!(messages.len(), 2);
    assert_eq!(user_text_of(messages[0]), "Hello.");
    match messages[1] {
        Message::Assistant(assistant) => {
            assert_eq!(assistant.text(), "Hi there.");
            assert_eq!(assistant.stop_reason, StopReason::Stop);
            assert!(!assistant.has_tool_calls());
        }
        other => panic!("expected assistant, got {other:?}"),
    }
    assert!(state.steer_queue.is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn tool_call_round_trip_starts_a_second_turn() {
    let provider = Provider::Openai;
    let adapter = ScriptedAdapter::new(
        provider,
        vec![
            tool_turn(
                provider,
                "gpt-4o",
                &[("c1|i1", "echo", serde_json::json!({"text": "hi"}))],
            ),
            text_turn(provider, "gpt-4o", &["echoed."]),
        ],
    );
    let store = Arc::new(MemoryStore::new());
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool));
    let mut harness = spawn_agent("s1", adapter.clone(), store.clone(), registry, AgentConfig::default());

    let mut rx = harness.take_rx();
    harness
        .agent
        .enqueue(vec![ContentBlock::text("Call echo.")], QueueLane::Steer)
        .await
        .unwrap();
    collect_until_agent_end(&mut rx).await;

    let state = store.load_state(&"s1".to_string()).await.unwrap();
    let messages = transcript_messages(&state);
    assert_eq!(messages.len(), 4);
    match messages[1] {
        Message::Assistant(assistant) => {
            assert_eq!(assistant.stop_reason, StopReason::ToolUse);
            let calls: Vec<_> = assistant.tool_calls().collect();
            assert_eq!(calls[0].id, "c1|i1");
        }
        other => panic!("expected assistant, got {other:?}"),
    }
    match messages[2] {
        Message::ToolResult(result) => {
            assert_eq!(result.tool_call_id, "c1|i1");
            assert_eq!(result.text(), "hi");
            assert!(!result.is_error);
        }
        other => panic!("expected tool result, got {other:?}"),
    }
    assert_eq!(state.tool_call_status["c1|i1"], ToolCallStatus::Completed);

    // The second inference saw the tool result in its context.
    let contexts = adapter.contexts();
    assert_eq!(contexts.len(), 2);
    assert!(contexts[1]
        .messages
        .iter()
        .any(|m| matches!(m, Message::ToolResult(r) if r.tool_call_id == "c1|i1")));

    harness.stop().await;
}

#[tokio::test]
async fn steer_during_tools_skips_remaining_calls() {
    let provider = Provider::Anthropic;
    let model_id = "claude-sonnet-4-20250514";
    let adapter = ScriptedAdapter::new(
        provider,
        vec![
            tool_turn(
                provider,
                model_id,
                &[
                    ("t-a", "work", serde_json::json!({"which": "A"})),
                    ("t-b", "work", serde_json::json!({"which": "B"})),
                    ("t-c", "work", serde_json::json!({"which": "C"})),
                ],
            ),
            text_turn(provider, model_id, &["interrupted."]),
        ],
    );
    let store = Arc::new(MemoryStore::new());
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(tokio::sync::Notify::new());
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(GatedTool {
        started: started_tx,
        release: release.clone(),
    }));
    let mut harness = spawn_agent("s1", adapter, store.clone(), registry, AgentConfig::default());

    let mut rx = harness.take_rx();
    harness
        .agent
        .enqueue(vec![ContentBlock::text("run the steps")], QueueLane::Steer)
        .await
        .unwrap();

    assert_eq!(started_rx.recv().await.unwrap(), "A");
    assert_eq!(started_rx.recv().await.unwrap(), "B");
    // B is executing; inject a steer, then let B finish.
    harness
        .agent
        .enqueue(vec![ContentBlock::text("stop that")], QueueLane::Steer)
        .await
        .unwrap();
    release.notify_one();

    collect_until_agent_end(&mut rx).await;

    let state = store.load_state(&"s1".to_string()).await.unwrap();
    assert_eq!(state.tool_call_status["t-a"], ToolCallStatus::Completed);
    assert_eq!(state.tool_call_status["t-b"], ToolCallStatus::Completed);
    assert_eq!(state.tool_call_status["t-c"], ToolCallStatus::Errored);

    let messages = transcript_messages(&state);
    // user, assistant(3 calls), result A, result B, skipped C, steer, assistant.
    assert_eq!(messages.len(), 7);
    match messages[4] {
        Message::ToolResult(result) => {
            assert_eq!(result.tool_call_id, "t-c");
            assert!(result.is_error);
            assert_eq!(result.text(), "Skipped due to queued user message.");
        }
        other => panic!("expected skipped result, got {other:?}"),
    }
    // The steer materialized after the skips and before the next turn.
    assert_eq!(user_text_of(messages[5]), "stop that");
    assert!(matches!(messages[6], Message::Assistant(_)));
    // C never ran.
    assert!(started_rx.try_recv().is_err());

    harness.stop().await;
}

#[tokio::test]
async fn crash_recovery_appends_error_results_for_started_calls() {
    let provider = Provider::Anthropic;
    let model_id = "claude-sonnet-4-20250514";
    let sid = "s1".to_string();
    let store = Arc::new(MemoryStore::new());

    // Persisted past: an assistant turn with two calls; t1 finished,
    // t2 was still running when the process died.
    let mut assistant = AssistantMessage::empty(provider, model_id);
    for id in ["t1", "t2"] {
        assistant.content.push(ContentBlock::ToolCall(ToolCall {
            id: id.into(),
            name: "echo".into(),
            arguments: serde_json::json!({"text": "x"}),
        }));
    }
    assistant.stop_reason = StopReason::ToolUse;
    store.append_assistant_entry(&sid, &assistant).await.unwrap();
    store.tool_will_execute(&sid, "t1").await.unwrap();
    store.tool_will_execute(&sid, "t2").await.unwrap();
    store
        .tool_did_execute(
            &sid,
            "t1",
            &ToolResultMessage {
                tool_call_id: "t1".into(),
                tool_name: "echo".into(),
                content: vec![ContentBlock::text("x")],
                details: serde_json::json!({}),
                is_error: false,
                timestamp: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();

    let adapter = ScriptedAdapter::new(
        provider,
        vec![text_turn(provider, model_id, &["picking up where we left off."])],
    );
    let mut harness = spawn_agent("s1", adapter, store.clone(), ToolRegistry::new(), AgentConfig::default());
    let mut rx = harness.take_rx();

    let events = collect_until_agent_end(&mut rx).await;

    // A committed event announced the recovery entry.
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::Committed {
            action: CommittedAction::ToolResultRecorded { message, .. }
        } if message.tool_call_id == "t2" && message.is_error
    )));

    let state = store.load_state(&sid).await.unwrap();
    assert_eq!(state.tool_call_status["t1"], ToolCallStatus::Completed);
    assert_eq!(state.tool_call_status["t2"], ToolCallStatus::Errored);

    let messages = transcript_messages(&state);
    // assistant, result t1, recovery result t2, assistant.
    assert_eq!(messages.len(), 4);
    match messages[2] {
        Message::ToolResult(result) => {
            assert_eq!(result.tool_call_id, "t2");
            assert!(result.is_error);
        }
        other => panic!("expected recovery result, got {other:?}"),
    }

    harness.stop().await;
}

#[tokio::test]
async fn max_turns_exceeded_fails_the_loop_without_persisting() {
    let provider = Provider::Openai;
    let adapter = ScriptedAdapter::new(
        provider,
        vec![
            tool_turn(
                provider,
                "gpt-4o",
                &[("c1", "echo", serde_json::json!({"text": "once"}))],
            ),
            // Never reached: the cap fails the loop first.
            text_turn(provider, "gpt-4o", &["should not happen"]),
        ],
    );
    let store = Arc::new(MemoryStore::new());
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool));
    let config = AgentConfig {
        max_turns: Some(1),
        ..Default::default()
    };
    let mut harness = spawn_agent("s1", adapter.clone(), store.clone(), registry, config);

    let mut rx = harness.take_rx();
    harness
        .agent
        .enqueue(vec![ContentBlock::text("go")], QueueLane::Steer)
        .await
        .unwrap();
    collect_until_agent_end(&mut rx).await;

    assert_eq!(
        harness.agent.last_error().as_deref(),
        Some("unsupported: Agent loop exceeded maxTurns=1")
    );

    // One assistant entry only; the failed second inference never ran
    // and nothing about it was persisted.
    let state = store.load_state(&"s1".to_string()).await.unwrap();
    let assistants = transcript_messages(&state)
        .into_iter()
        .filter(|m| matches!(m, Message::Assistant(_)))
        .count();
    assert_eq!(assistants, 1);
    assert_eq!(adapter.contexts().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn follow_up_drains_after_idle_and_lanes_keep_precedence() {
    let provider = Provider::Anthropic;
    let model_id = "claude-sonnet-4-20250514";
    let adapter = ScriptedAdapter::new(
        provider,
        vec![
            text_turn(provider, model_id, &["first answer"]),
            text_turn(provider, model_id, &["follow-up answer"]),
        ],
    );
    let store = Arc::new(MemoryStore::new());
    // Seed all three lanes before the agent starts so a single
    // checkpoint observes them together.
    let sid = "s1".to_string();
    store
        .insert_queue_item(&sid, QueueItem::text("context update"), QueueLane::System)
        .await
        .unwrap();
    store
        .insert_queue_item(&sid, QueueItem::text("steer question"), QueueLane::Steer)
        .await
        .unwrap();
    store
        .insert_queue_item(&sid, QueueItem::text("and afterwards"), QueueLane::FollowUp)
        .await
        .unwrap();

    let mut harness = spawn_agent("s1", adapter, store.clone(), ToolRegistry::new(), AgentConfig::default());
    let mut rx = harness.take_rx();
    collect_until_agent_end(&mut rx).await;

    let state = store.load_state(&"s1".to_string()).await.unwrap();
    let messages = transcript_messages(&state);
    assert_eq!(messages.len(), 5);
    // One checkpoint drained system+steer (system enqueued first);
    // the follow-up waited for the tool-less turn to finish.
    assert_eq!(user_text_of(messages[0]), "context update");
    assert_eq!(user_text_of(messages[1]), "steer question");
    assert!(matches!(messages[2], Message::Assistant(_)));
    assert_eq!(user_text_of(messages[3]), "and afterwards");
    assert!(matches!(messages[4], Message::Assistant(_)));
    assert!(state.follow_up_queue.is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn adapter_failure_persists_synthetic_error_assistant() {
    let provider = Provider::Anthropic;
    let adapter = ScriptedAdapter::new(
        provider,
        vec![failing_turn(provider, "claude-sonnet-4-20250514")],
    );
    let store = Arc::new(MemoryStore::new());
    let mut harness = spawn_agent("s1", adapter, store.clone(), ToolRegistry::new(), AgentConfig::default());

    let mut rx = harness.take_rx();
    harness
        .agent
        .enqueue(vec![ContentBlock::text("hello?")], QueueLane::Steer)
        .await
        .unwrap();
    let events = collect_until_agent_end(&mut rx).await;

    // turnEnd carried the error assistant and no tool results.
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::TurnEnd { assistant, tool_results }
            if assistant.stop_reason == StopReason::Error && tool_results.is_empty()
    )));

    let state = store.load_state(&"s1".to_string()).await.unwrap();
    let messages = transcript_messages(&state);
    assert_eq!(messages.len(), 2);
    match messages[1] {
        Message::Assistant(assistant) => {
            assert_eq!(assistant.stop_reason, StopReason::Error);
            let err = assistant.error_message.as_deref().unwrap();
            assert!(err.contains("529"), "unexpected error message: {err}");
        }
        other => panic!("expected assistant, got {other:?}"),
    }

    harness.stop().await;
}

#[tokio::test]
async fn streamed_deltas_concatenate_to_the_final_text() {
    let provider = Provider::Anthropic;
    let chunks = ["Str", "eam", "ing ", "wo", "rks"];
    let adapter = ScriptedAdapter::new(
        provider,
        vec![text_turn(provider, "claude-sonnet-4-20250514", &chunks)],
    );
    let store = Arc::new(MemoryStore::new());
    let mut harness = spawn_agent("s1", adapter, store.clone(), ToolRegistry::new(), AgentConfig::default());

    let mut rx = harness.take_rx();
    harness
        .agent
        .enqueue(vec![ContentBlock::text("stream please")], QueueLane::Steer)
        .await
        .unwrap();
    let events = collect_until_agent_end(&mut rx).await;

    let concatenated: String = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::MessageUpdate { delta, .. } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    let final_text = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::MessageEnd {
                message: Message::Assistant(assistant),
            } => Some(assistant.text()),
            _ => None,
        })
        .expect("messageEnd");
    assert_eq!(concatenated, final_text);
    assert_eq!(final_text, "Streaming works");

    harness.stop().await;
}

#[tokio::test]
async fn committed_events_replay_onto_the_snapshot() {
    let provider = Provider::Anthropic;
    let adapter = ScriptedAdapter::new(
        provider,
        vec![text_turn(provider, "claude-sonnet-4-20250514", &["replayable"])],
    );
    let store = Arc::new(MemoryStore::new());
    let harness = spawn_agent("s1", adapter, store.clone(), ToolRegistry::new(), AgentConfig::default());

    let (snapshot, mut rx) = harness.agent.observe().await;
    assert!(snapshot.transcript.is_empty());

    harness
        .agent
        .enqueue(vec![ContentBlock::text("hi")], QueueLane::Steer)
        .await
        .unwrap();
    let events = collect_until_agent_end(&mut rx).await;

    // Rebuild the transcript from the snapshot plus committed events.
    let mut replayed: Vec<u64> = snapshot.transcript.iter().map(|e| e.id).collect();
    for event in &events {
        if let AgentEvent::Committed { action } = event {
            match action {
                CommittedAction::Materialized { entries } => {
                    replayed.extend(entries.iter().map(|e| e.id))
                }
                CommittedAction::AssistantAppended { entry_id, .. }
                | CommittedAction::ToolResultRecorded { entry_id, .. } => {
                    replayed.push(*entry_id)
                }
                CommittedAction::ToolStarted { .. } | CommittedAction::Compacted => {}
            }
        }
    }

    let state = store.load_state(&"s1".to_string()).await.unwrap();
    let actual: Vec<u64> = state.transcript.iter().map(|e| e.id).collect();
    assert_eq!(replayed, actual);

    harness.stop().await;
}

#[tokio::test]
async fn cancellation_leaves_started_calls_for_restart_recovery() {
    let provider = Provider::Anthropic;
    let model_id = "claude-sonnet-4-20250514";
    let store = Arc::new(MemoryStore::new());

    // First life: the turn hangs inside a tool.
    let adapter = ScriptedAdapter::new(
        provider,
        vec![tool_turn(
            provider,
            model_id,
            &[("h1", "hang", serde_json::json!({}))],
        )],
    );
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(HangTool));
    let mut harness = spawn_agent("s1", adapter, store.clone(), registry, AgentConfig::default());

    let mut rx = harness.take_rx();
    harness
        .agent
        .enqueue(vec![ContentBlock::text("hang yourself up")], QueueLane::Steer)
        .await
        .unwrap();

    // Wait until the tool is actually executing, then cancel.
    loop {
        if let AgentEvent::ToolExecutionStart { call_id, .. } = next_event(&mut rx).await {
            assert_eq!(call_id, "h1");
            break;
        }
    }
    harness.stop().await;

    let state = store.load_state(&"s1".to_string()).await.unwrap();
    assert_eq!(state.tool_call_status["h1"], ToolCallStatus::Started);

    // Second life: recovery appends the error result, then the loop
    // resumes with a fresh inference.
    let adapter = ScriptedAdapter::new(
        provider,
        vec![text_turn(provider, model_id, &["back online"])],
    );
    let mut harness = spawn_agent("s1", adapter, store.clone(), ToolRegistry::new(), AgentConfig::default());
    let mut rx = harness.take_rx();
    collect_until_agent_end(&mut rx).await;

    let state = store.load_state(&"s1".to_string()).await.unwrap();
    assert_eq!(state.tool_call_status["h1"], ToolCallStatus::Errored);
    let messages = transcript_messages(&state);
    assert!(messages.iter().any(|m| matches!(
        m,
        Message::ToolResult(r) if r.tool_call_id == "h1" && r.is_error
    )));

    harness.stop().await;
}

#[tokio::test]
async fn tool_updates_surface_on_the_event_bus() {
    struct ProgressTool;

    #[async_trait::async_trait]
    impl AgentTool for ProgressTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "progress".into(),
                description: "reports progress".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }
        }

        fn label(&self) -> &str {
            "Progress"
        }

        async fn execute(&self, ctx: ToolContext, _args: Value) -> Result<AgentToolResult> {
            ctx.updates.post(serde_json::json!({"percent": 50}));
            // Let the relay loop observe the update before we finish.
            tokio::task::yield_now().await;
            Ok(AgentToolResult::text("finished"))
        }
    }

    let provider = Provider::Anthropic;
    let adapter = ScriptedAdapter::new(
        provider,
        vec![
            tool_turn(
                provider,
                "claude-sonnet-4-20250514",
                &[("p1", "progress", serde_json::json!({}))],
            ),
            text_turn(provider, "claude-sonnet-4-20250514", &["ok"]),
        ],
    );
    let store = Arc::new(MemoryStore::new());
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ProgressTool));
    let mut harness = spawn_agent("s1", adapter, store.clone(), registry, AgentConfig::default());

    let mut rx = harness.take_rx();
    harness
        .agent
        .enqueue(vec![ContentBlock::text("show progress")], QueueLane::Steer)
        .await
        .unwrap();
    let events = collect_until_agent_end(&mut rx).await;

    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolExecutionUpdate { call_id, partial, .. }
            if call_id == "p1" && partial["percent"] == 50
    )));

    harness.stop().await;
}

#[tokio::test]
async fn manager_routes_enqueue_and_stops_sessions() {
    let provider = Provider::Anthropic;
    let adapter = ScriptedAdapter::new(
        provider,
        vec![text_turn(provider, "claude-sonnet-4-20250514", &["managed"])],
    );
    let store = Arc::new(MemoryStore::new());
    let manager = SessionManager::new(
        store.clone() as Arc<dyn SessionStore>,
        adapter,
        Arc::new(ToolRegistry::new()),
        model_for(provider),
        RequestOptions::default(),
        AgentConfig::default(),
    );

    let (_, mut rx) = manager.observe("m1").await;
    manager
        .enqueue("m1", vec![ContentBlock::text("hi")], QueueLane::Steer)
        .await
        .unwrap();
    assert!(manager.is_running("m1"));
    collect_until_agent_end(&mut rx).await;

    let state = store.load_state(&"m1".to_string()).await.unwrap();
    assert_eq!(transcript_messages(&state).len(), 2);

    manager.stop("m1").await.unwrap();
    assert!(!manager.is_running("m1"));
    assert!(manager.stop("m1").await.is_err());
}
