//! OpenAI Codex Responses adapter.
//!
//! Speaks the same `response.*` streaming schema as the standard
//! Responses endpoint (the event machine is shared with
//! [`crate::openai`]) but authenticates with a ChatGPT OAuth token:
//! the account id is lifted out of the JWT's auth claim and sent in the
//! `chatgpt-account-id` header. Message content is collapsed to plain
//! strings and the system prompt travels under `instructions`, which is
//! what this endpoint accepts.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

use helm_domain::error::{Error, Result};
use helm_domain::message::Message;
use helm_domain::model::{Model, Provider};
use helm_domain::options::RequestOptions;
use helm_domain::stream::{AssistantMessageEvent, BoxStream};

use crate::adapter::{resolve_api_key, Context, ProviderAdapter};
use crate::http::HttpClient;
use crate::openai::{parse_responses_frame, ResponsesState};
use crate::sse::sse_response_stream;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CodexAdapter {
    http: HttpClient,
}

impl CodexAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JWT claim extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const AUTH_CLAIM: &str = "https://api.openai.com/auth";

/// Pull the ChatGPT account id out of the bearer token.
///
/// The token is a JWT whose base64url-encoded payload carries the
/// account id under the OpenAI auth claim. Any malformation fails with
/// a decoding error.
fn chatgpt_account_id(token: &str) -> Result<String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Decoding("malformed JWT: missing payload segment".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::Decoding(format!("malformed JWT payload: {e}")))?;
    let claims: Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Decoding(format!("malformed JWT claims: {e}")))?;
    claims
        .get(AUTH_CLAIM)
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Decoding("JWT is missing the chatgpt_account_id claim".into()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shaping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Project messages to the simplified `{role, content: <string>}` items
/// this endpoint accepts. Tool results come back as user-role text,
/// which loses structured tool-call history on replay.
fn build_input_items(context: &Context) -> Vec<Value> {
    let mut items: Vec<Value> = Vec::new();

    for msg in &context.messages {
        let (role, content) = match msg {
            Message::User(user) => ("user", blocks_text(&user.content)),
            Message::Assistant(assistant) => ("assistant", assistant.text()),
            Message::ToolResult(result) => ("user", result.text()),
        };
        if content.is_empty() {
            continue;
        }
        items.push(serde_json::json!({
            "role": role,
            "content": content,
        }));
    }

    items
}

fn blocks_text(blocks: &[helm_domain::message::ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            helm_domain::message::ContentBlock::Text { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn build_body(model: &Model, context: &Context, options: &RequestOptions) -> Value {
    let mut body = serde_json::json!({
        "model": model.id,
        "input": build_input_items(context),
        "stream": true,
        "store": false,
    });

    if let Some(system) = &context.system_prompt {
        body["instructions"] = Value::String(system.clone());
    }
    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    if let Some(effort) = options.reasoning_effort {
        body["reasoning"] = serde_json::json!({"effort": effort.as_str()});
    }

    body
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl ProviderAdapter for CodexAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenaiCodex
    }

    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &RequestOptions,
    ) -> Result<BoxStream<'static, Result<AssistantMessageEvent>>> {
        let token = resolve_api_key(Provider::OpenaiCodex, model, options)?;
        let account_id = chatgpt_account_id(&token)?;
        let url = format!("{}/codex/responses", model.base_url.trim_end_matches('/'));
        let body = build_body(model, context, options);

        let mut headers: Vec<(String, String)> = vec![
            ("Authorization".into(), format!("Bearer {token}")),
            ("chatgpt-account-id".into(), account_id),
            ("OpenAI-Beta".into(), "responses=experimental".into()),
            ("originator".into(), "pi".into()),
        ];
        if let Some(session) = &options.session_id {
            headers.push(("conversation_id".into(), session.clone()));
            headers.push(("session_id".into(), session.clone()));
        }
        headers.extend(options.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        tracing::debug!(model = %model.id, url = %url, "codex responses stream request");

        let response = self.http.post_sse(&url, &headers, &body, None).await?;

        let mut state = ResponsesState::new(Provider::OpenaiCodex, model);
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
