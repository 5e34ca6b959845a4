//! OpenAI Responses adapter.
//!
//! Translates the uniform conversation model to Responses-API input
//! items and reassembles streamed `response.*` events into assistant
//! messages. The OpenAI family identifies a tool call by two ids (a
//! `call_id` and an output-item `id`); within the uniform model they
//! travel joined as `callId|itemId` and are split back apart only here.

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
// Composite tool-call ids
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Join the two OpenAI identifiers into the opaque uniform id.
pub fn join_tool_call_id(call_id: &str, item_id: &str) -> String {
    if item_id.is_empty() {
        call_id.to_string()
    } else {
        format!("{call_id}|{item_id}")
    }
}

/// Split the uniform id back into `(call_id, item_id)`.
pub fn split_tool_call_id(id: &str) -> (&str, Option<&str>) {
    match id.split_once('|') {
        Some((call_id, item_id)) => (call_id, Some(item_id)),
        None => (id, None),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiResponsesAdapter {
    http: HttpClient,
}

impl OpenAiResponsesAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shaping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn user_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn build_input_items(context: &Context) -> Vec<Value> {
    let mut items: Vec<Value> = Vec::new();

    if let Some(system) = &context.system_prompt {
        items.push(serde_json::json!({
            "role": "system",
            "content": system,
        }));
    }

    for msg in &context.messages {
        match msg {
            Message::User(user) => {
                let text = user_text(&user.content);
                if text.is_empty() {
                    continue;
                }
                items.push(serde_json::json!({
                    "role": "user",
                    "content": [{"type": "input_text", "text": text}],
                }));
            }
            Message::Assistant(assistant) => {
                for block in &assistant.content {
                    match block {
                        ContentBlock::Text { text, signature } => {
                            let mut item = serde_json::json!({
                                "type": "message",
                                "role": "assistant",
                                "status": "completed",
                                "content": [{"type": "output_text", "text": text}],
                            });
                            if let Some(id) = signature {
                                item["id"] = Value::String(id.clone());
                            }
                            items.push(item);
                        }
                        ContentBlock::ToolCall(tc) => {
                            let (call_id, item_id) = split_tool_call_id(&tc.id);
                            let mut item = serde_json::json!({
                                "type": "function_call",
                                "call_id": call_id,
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            });
                            if let Some(id) = item_id {
                                item["id"] = Value::String(id.to_string());
                            }
                            items.push(item);
                        }
                    }
                }
            }
            Message::ToolResult(result) => {
                let (call_id, _) = split_tool_call_id(&result.tool_call_id);
                items.push(serde_json::json!({
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": result.text(),
                }));
            }
        }
    }

    items
}

fn tool_to_responses(tool: &ToolDescriptor) -> Value {
    serde_json::json!({
        "type": "function",
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

fn build_body(model: &Model, context: &Context, options: &RequestOptions) -> Value {
    let mut body = serde_json::json!({
        "model": model.id,
        "input": build_input_items(context),
        "stream": true,
        "store": false,
    });

    if let Some(temp) = options.temperature {
        body["temperature"] = serde_json::json!(temp);
    }
    if let Some(max) = options.max_tokens {
        body["max_output_tokens"] = serde_json::json!(max);
    }
    if let Some(session) = &options.session_id {
        body["prompt_cache_key"] = Value::String(session.clone());
    }
    if !context.tools.is_empty() {
        let tools: Vec<Value> = context.tools.iter().map(tool_to_responses).collect();
        body["tools"] = Value::Array(tools);
    }
    if let Some(effort) = options.reasoning_effort {
        body["reasoning"] = serde_json::json!({"effort": effort.as_str()});
    }

    body
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming state machine (shared with the Codex adapter)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Aggregation state for one streamed Responses turn.
pub(crate) struct ResponsesState {
    message: AssistantMessage,
    /// Provider `output_index` -> position in `message.content`.
    blocks: HashMap<u64, usize>,
    /// Most recently opened block, used when an event omits the index.
    current: Option<usize>,
    /// Argument buffers per tool-call content position.
    arg_buffers: HashMap<usize, String>,
    done_emitted: bool,
}

impl ResponsesState {
    pub(crate) fn new(provider: Provider, model: &Model) -> Self {
        Self {
            message: AssistantMessage::empty(provider, model.id.clone()),
            blocks: HashMap::new(),
            current: None,
            arg_buffers: HashMap::new(),
            done_emitted: false,
        }
    }

    pub(crate) fn empty_message(&self) -> AssistantMessage {
        AssistantMessage::empty(self.message.provider, self.message.model_id.clone())
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
        let pending: Vec<(usize, String)> = self.arg_buffers.drain().collect();
        for (pos, buffer) in pending {
            if let Some(ContentBlock::ToolCall(tc)) = self.message.content.get_mut(pos) {
                tc.arguments = arguments_or_empty(&buffer);
            }
        }
        if self.message.has_tool_calls() {
            self.message.stop_reason = StopReason::ToolUse;
        }
    }
}

fn map_status(status: &str) -> StopReason {
    match status {
        "completed" => StopReason::Stop,
        "incomplete" => StopReason::Length,
        "failed" | "cancelled" => StopReason::Error,
        _ => StopReason::Stop,
    }
}

fn item_texts(item: &Value) -> String {
    item.get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Process one Responses SSE frame (or the end-of-stream flush) into
/// uniform events.
pub(crate) fn parse_responses_frame(
    frame: Option<SseFrame>,
    state: &mut ResponsesState,
) -> Vec<Result<AssistantMessageEvent>> {
    let mut events = Vec::new();

    let Some(frame) = frame else {
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
    let output_index = v.get("output_index").and_then(Value::as_u64);

    match event_type {
        "response.output_item.added" => {
            let Some(item) = v.get("item") else {
                return events;
            };
            match item.get("type").and_then(Value::as_str).unwrap_or("") {
                "message" => {
                    let signature = item
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    state.open_block(
                        output_index,
                        ContentBlock::Text {
                            text: item_texts(item),
                            signature,
                        },
                    );
                }
                "function_call" => {
                    let call_id = item.get("call_id").and_then(Value::as_str).unwrap_or("");
                    let item_id = item.get("id").and_then(Value::as_str).unwrap_or("");
                    let name = item
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    state.open_block(
                        output_index,
                        ContentBlock::ToolCall(ToolCall {
                            id: join_tool_call_id(call_id, item_id),
                            name,
                            arguments: Value::Object(serde_json::Map::new()),
                        }),
                    );
                    let initial = item
                        .get("arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    if let Some(pos) = state.current {
                        state.arg_buffers.insert(pos, initial);
                    }
                }
                _ => {}
            }
        }

        "response.output_text.delta" => {
            let Some(delta) = v.get("delta").and_then(Value::as_str) else {
                return events;
            };
            if delta.is_empty() {
                return events;
            }
            let Some(pos) = state.resolve(output_index) else {
                return events;
            };
            if let Some(ContentBlock::Text { text, .. }) = state.message.content.get_mut(pos) {
                text.push_str(delta);
            }
            events.push(Ok(AssistantMessageEvent::TextDelta {
                delta: delta.to_string(),
                partial: state.message.clone(),
            }));
        }

        "response.function_call_arguments.delta" => {
            if let Some(delta) = v.get("delta").and_then(Value::as_str) {
                if let Some(pos) = state.resolve(output_index) {
                    state.arg_buffers.entry(pos).or_default().push_str(delta);
                }
            }
        }

        "response.function_call_arguments.done" => {
            if let Some(arguments) = v.get("arguments").and_then(Value::as_str) {
                if let Some(pos) = state.resolve(output_index) {
                    state.arg_buffers.insert(pos, arguments.to_string());
                }
            }
        }

        "response.output_item.done" => {
            let Some(item) = v.get("item") else {
                return events;
            };
            let Some(pos) = state.resolve(output_index) else {
                return events;
            };
            match item.get("type").and_then(Value::as_str).unwrap_or("") {
                "function_call" => {
                    let buffer = state.arg_buffers.remove(&pos).unwrap_or_default();
                    if let Some(ContentBlock::ToolCall(tc)) = state.message.content.get_mut(pos)
                    {
                        tc.arguments = arguments_or_empty(&buffer);
                        if let Some(name) = item.get("name").and_then(Value::as_str) {
                            if !name.is_empty() {
                                tc.name = name.to_string();
                            }
                        }
                    }
                }
                "message" => {
                    // The done item carries the provider's exact final
                    // text; prefer it over our concatenation.
                    let final_text = item_texts(item);
                    if !final_text.is_empty() {
                        if let Some(ContentBlock::Text { text, .. }) =
                            state.message.content.get_mut(pos)
                        {
                            *text = final_text;
                        }
                    }
                }
                _ => {}
            }
        }

        "response.completed" => {
            if let Some(response) = v.get("response") {
                if let Some(usage) = response.get("usage") {
                    let input = usage
                        .get("input_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32;
                    let output = usage
                        .get("output_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32;
                    let total = usage
                        .get("total_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or((input + output) as u64) as u32;
                    state.message.usage = Some(Usage { input, output, total });
                }
                if let Some(status) = response.get("status").and_then(Value::as_str) {
                    state.message.stop_reason = map_status(status);
                }
            }
            if !state.done_emitted {
                state.done_emitted = true;
                state.finalize();
                events.push(Ok(AssistantMessageEvent::Done {
                    message: state.message.clone(),
                }));
            }
        }

        "response.failed" | "error" => {
            events.push(Err(Error::HttpStatus {
                status: 500,
                body: frame.data.clone(),
            }));
        }

        _ => {
            // Unhandled lifecycle events (response.created, deltas for
            // modalities we do not model) -- ignore.
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiResponsesAdapter {
    fn provider(&self) -> Provider {
        Provider::Openai
    }

    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &RequestOptions,
    ) -> Result<BoxStream<'static, Result<AssistantMessageEvent>>> {
        let api_key = resolve_api_key(Provider::Openai, model, options)?;
        let url = format!("{}/responses", model.base_url.trim_end_matches('/'));
        let body = build_body(model, context, options);

        let mut headers: Vec<(String, String)> =
            vec![("Authorization".into(), format!("Bearer {api_key}"))];
        headers.extend(options.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        tracing::debug!(model = %model.id, url = %url, "openai responses stream request");

        let response = self.http.post_sse(&url, &headers, &body, None).await?;

        let mut state = ResponsesState::new(Provider::Openai, model);
        let start = AssistantMessageEvent::Start {
            message: state.empty_message(),
        };
        let inner =
            sse_response_stream(response, move |frame| parse_responses_frame(frame, &mut state));

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
