//! Anthropic Messages adapter.
//!
//! Translates between the uniform conversation model and the Anthropic
//! Messages API: system prompt in a top-level `system` field, tool use
//! and tool results as content blocks, and streaming via typed SSE
//! events (`content_block_start` / `content_block_delta` / ...).

use std::collections::HashMap;

use serde_json::Value;

use helm_domain::error::{Error, Result};
use helm_domain::json::arguments_or_empty;
use helm_domain::message::{
    AssistantMessage, ContentBlock, Message, StopReason, ToolCall, ToolDescriptor, Usage,
};
use helm_domain::model::{Model, Provider};
use helm_domain::options::RequestOptions;
use helm_domain::stream::{AssistantMessageEvent, BoxStream};

use crate::adapter::{resolve_api_key, Context, ProviderAdapter};
use crate::http::HttpClient;
use crate::sse::{sse_response_stream, SseFrame};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AnthropicAdapter {
    http: HttpClient,
}

impl AnthropicAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shaping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn content_blocks_to_anthropic(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text, .. } => serde_json::json!({
                "type": "text",
                "text": text,
            }),
            ContentBlock::ToolCall(tc) => serde_json::json!({
                "type": "tool_use",
                "id": tc.id,
                "name": tc.name,
                "input": tc.arguments,
            }),
        })
        .collect()
}

/// Project the uniform message list into Anthropic `messages`.
///
/// Tool results become user messages carrying `tool_result` blocks;
/// consecutive tool results collapse into one user message with
/// multiple blocks, which is what the API expects after a parallel
/// tool-use turn.
fn build_messages(messages: &[Message]) -> Vec<Value> {
    let mut api_messages: Vec<Value> = Vec::new();
    let mut last_was_tool_result = false;

    for msg in messages {
        match msg {
            Message::User(user) => {
                api_messages.push(serde_json::json!({
                    "role": "user",
                    "content": content_blocks_to_anthropic(&user.content),
                }));
                last_was_tool_result = false;
            }
            Message::Assistant(assistant) => {
                api_messages.push(serde_json::json!({
                    "role": "assistant",
                    "content": content_blocks_to_anthropic(&assistant.content),
                }));
                last_was_tool_result = false;
            }
            Message::ToolResult(result) => {
                let block = serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": result.tool_call_id,
                    "content": result.text(),
                    "is_error": result.is_error,
                });
                if last_was_tool_result {
                    if let Some(Value::Array(content)) = api_messages
                        .last_mut()
                        .and_then(|m| m.get_mut("content"))
                    {
                        content.push(block);
                        continue;
                    }
                }
                api_messages.push(serde_json::json!({
                    "role": "user",
                    "content": [block],
                }));
                last_was_tool_result = true;
            }
        }
    }

    api_messages
}

fn tool_to_anthropic(tool: &ToolDescriptor) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

fn build_body(model: &Model, context: &Context, options: &RequestOptions) -> Value {
    let mut body = serde_json::json!({
        "model": model.id,
        "stream": true,
        "messages": build_messages(&context.messages),
        "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    });

    if let Some(system) = &context.system_prompt {
        body["system"] = Value::String(system.clone());
    }
    if let Some(temp) = options.temperature {
        body["temperature"] = serde_json::json!(temp);
    }
    if !context.tools.is_empty() {
        let tools: Vec<Value> = context.tools.iter().map(tool_to_anthropic).collect();
        body["tools"] = Value::Array(tools);
    }

    body
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Aggregation state for one streamed assistant turn.
struct StreamState {
    message: AssistantMessage,
    /// Provider block index -> position in `message.content`.
    blocks: HashMap<u64, usize>,
    /// Fallback register when an event omits `index`: the most recently
    /// opened block.
    current: Option<usize>,
    /// Accumulated `partial_json` per tool-use content position.
    arg_buffers: HashMap<usize, String>,
    input_tokens: u32,
    output_tokens: u32,
    done_emitted: bool,
}

impl StreamState {
    fn new(model: &Model) -> Self {
        Self {
            message: AssistantMessage::empty(Provider::Anthropic, model.id.clone()),
            blocks: HashMap::new(),
            current: None,
            arg_buffers: HashMap::new(),
            input_tokens: 0,
            output_tokens: 0,
            done_emitted: false,
        }
    }

    fn resolve(&self, index: Option<u64>) -> Option<usize> {
        match index {
            Some(idx) => self.blocks.get(&idx).copied().or(self.current),
            None => self.current,
        }
    }

    fn open_block(&mut self, index: Option<u64>, block: ContentBlock) {
        self.message.content.push(block);
        let pos = self.message.content.len() - 1;
        if let Some(idx) = index {
            self.blocks.insert(idx, pos);
        }
        self.current = Some(pos);
    }

    fn finalize(&mut self) {
        // Any block left with a pending argument buffer gets the lenient
        // parse (never null, `{}` on failure).
        let pending: Vec<(usize, String)> = self.arg_buffers.drain().collect();
        for (pos, buffer) in pending {
            if let Some(ContentBlock::ToolCall(tc)) = self.message.content.get_mut(pos) {
                if !buffer.trim().is_empty() {
                    tc.arguments = arguments_or_empty(&buffer);
                }
            }
        }
        if self.input_tokens > 0 || self.output_tokens > 0 {
            self.message.usage = Some(Usage {
                input: self.input_tokens,
                output: self.output_tokens,
                total: self.input_tokens + self.output_tokens,
            });
        }
        if self.message.stop_reason == StopReason::Stop && self.message.has_tool_calls() {
            self.message.stop_reason = StopReason::ToolUse;
        }
    }
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "end_turn" | "stop_sequence" => StopReason::Stop,
        "max_tokens" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        "refusal" | "sensitive" => StopReason::Error,
        _ => StopReason::Stop,
    }
}

/// Process one SSE frame (or the end-of-stream flush) into uniform
/// events.
fn parse_frame(
    frame: Option<SseFrame>,
    state: &mut StreamState,
) -> Vec<Result<AssistantMessageEvent>> {
    let mut events = Vec::new();

    let Some(frame) = frame else {
        // Upstream closed without `message_stop`: flush the aggregate.
        if !state.done_emitted {
            state.done_emitted = true;
            state.finalize();
            events.push(Ok(AssistantMessageEvent::Done {
                message: state.message.clone(),
            }));
        }
        return events;
    };

    let v: Value = match serde_json::from_str(&frame.data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Decoding(format!("malformed SSE JSON: {e}"))));
            return events;
        }
    };

    let event_type = v.get("type").and_then(Value::as_str).unwrap_or("");

    match event_type {
        "message_start" => {
            if let Some(input) = v
                .get("message")
                .and_then(|m| m.get("usage"))
                .and_then(|u| u.get("input_tokens"))
                .and_then(Value::as_u64)
            {
                state.input_tokens = input as u32;
            }
        }

        "content_block_start" => {
            let index = v.get("index").and_then(Value::as_u64);
            let Some(block) = v.get("content_block") else {
                return events;
            };
            match block.get("type").and_then(Value::as_str).unwrap_or("") {
                "text" => {
                    state.open_block(index, ContentBlock::text(""));
                }
                "tool_use" => {
                    let id = block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    let arguments = match block.get("input") {
                        Some(input) if input.is_object() => input.clone(),
                        _ => Value::Object(serde_json::Map::new()),
                    };
                    state.open_block(index, ContentBlock::ToolCall(ToolCall {
                        id,
                        name,
                        arguments,
                    }));
                    if let Some(pos) = state.current {
                        state.arg_buffers.insert(pos, String::new());
                    }
                }
                _ => {}
            }
        }

        "content_block_delta" => {
            let index = v.get("index").and_then(Value::as_u64);
            let Some(pos) = state.resolve(index) else {
                return events;
            };
            let Some(delta) = v.get("delta") else {
                return events;
            };
            match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                "text_delta" => {
                    if let Some(text) = delta.get("text").and_then(Value::as_str) {
                        if text.is_empty() {
                            return events;
                        }
                        if let Some(ContentBlock::Text { text: buf, .. }) =
                            state.message.content.get_mut(pos)
                        {
                            buf.push_str(text);
                        }
                        events.push(Ok(AssistantMessageEvent::TextDelta {
                            delta: text.to_string(),
                            partial: state.message.clone(),
                        }));
                    }
                }
                "input_json_delta" => {
                    if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                        state
                            .arg_buffers
                            .entry(pos)
                            .or_default()
                            .push_str(partial);
                    }
                }
                _ => {}
            }
        }

        "content_block_stop" => {
            let index = v.get("index").and_then(Value::as_u64);
            if let Some(pos) = state.resolve(index) {
                if let Some(buffer) = state.arg_buffers.remove(&pos) {
                    if let Some(ContentBlock::ToolCall(tc)) = state.message.content.get_mut(pos)
                    {
                        if !buffer.trim().is_empty() {
                            tc.arguments = arguments_or_empty(&buffer);
                        }
                    }
                }
            }
        }

        "message_delta" => {
            if let Some(reason) = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str)
            {
                state.message.stop_reason = map_stop_reason(reason);
            }
            if let Some(output) = v
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(Value::as_u64)
            {
                state.output_tokens = output as u32;
            }
        }

        "message_stop" => {
            if !state.done_emitted {
                state.done_emitted = true;
                state.finalize();
                events.push(Ok(AssistantMessageEvent::Done {
                    message: state.message.clone(),
                }));
            }
        }

        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error");
            events.push(Err(Error::HttpStatus {
                status: 500,
                body: message.to_string(),
            }));
        }

        _ => {
            // ping and future event types -- ignore.
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &RequestOptions,
    ) -> Result<BoxStream<'static, Result<AssistantMessageEvent>>> {
        let api_key = resolve_api_key(Provider::Anthropic, model, options)?;
        let url = format!("{}/messages", model.base_url.trim_end_matches('/'));
        let body = build_body(model, context, options);

        let mut headers: Vec<(String, String)> = vec![
            ("x-api-key".into(), api_key),
            ("anthropic-version".into(), ANTHROPIC_VERSION.into()),
        ];
        headers.extend(options.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        tracing::debug!(model = %model.id, url = %url, "anthropic stream request");

        let response = self.http.post_sse(&url, &headers, &body, None).await?;

        let mut state = StreamState::new(model);
        let start = AssistantMessageEvent::Start {
            message: state.message.clone(),
        };
        let inner = sse_response_stream(response, move |frame| parse_frame(frame, &mut state));

        Ok(Box::pin(async_stream::stream! {
            yield Ok(start);
            let mut inner = inner;
            while let Some(event) = futures_util::StreamExt::next(&mut inner).await {
                let failed = event.is_err();
                yield event;
                if failed {
                    return;
                }
            }
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
