//! OpenAI-compatible chat-completions provider.
//!
//! Calls `POST {host}/v1/chat/completions`. This covers OpenAI itself and
//! the compatible endpoints exposed by Ollama, LM Studio and most hosted
//! gateways.
//!
//! Notes on the wire format:
//! - The system prompt travels as the first `role: "system"` message.
//! - `tool_calls[].function.arguments` is usually a JSON string, but some
//!   servers send an object; both are normalized to a string.
//! - Missing tool call ids are synthesized as `call_{index}`.
//! - Models without native tool calling sometimes answer with a fenced
//!   JSON block `{"name": .., "arguments": ..}`; when tools were offered,
//!   that block is promoted to a single tool call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::client::LlmClient;
use super::{LlmResponse, Message, ToolCall, ToolDefinition, Usage};
use crate::config::LlmConfig;
use crate::error::LlmError;

/// Default base URL for a local Ollama server.
const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

/// Default base URL for the OpenAI API.
const DEFAULT_OPENAI_HOST: &str = "https://api.openai.com";

// ── Request types ────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
}

// ── Response types ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

// ── OpenAiCompatClient ───────────────────────────────────

/// Client for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiCompatClient {
    client: Client,
    config: LlmConfig,
    host: String,
}

impl OpenAiCompatClient {
    /// Creates a new client from configuration.
    ///
    /// Without an explicit `host`, provider `"ollama"` points at
    /// `http://localhost:11434`, anything else at the OpenAI API.
    pub fn new(config: LlmConfig) -> Self {
        let host = config.host.clone().unwrap_or_else(|| {
            if config.provider == "ollama" {
                DEFAULT_OLLAMA_HOST.to_string()
            } else {
                DEFAULT_OPENAI_HOST.to_string()
            }
        });
        let host = host.trim_end_matches('/').to_string();

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            config,
            host,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.host)
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse, LlmError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens_per_request,
            tools,
        };

        debug!(
            "Calling chat completions ({}) with {} messages{}",
            self.config.model,
            messages.len(),
            if tools.is_some() { " + tools" } else { "" }
        );

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), body));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let parsed = normalize_response(body, tools.is_some_and(|t| !t.is_empty()))?;

        info!(
            "LLM response: {} in / {} out tokens",
            parsed.usage.prompt_tokens, parsed.usage.completion_tokens
        );

        Ok(parsed)
    }

    fn description(&self) -> String {
        format!("{} ({})", self.config.provider, self.config.model)
    }
}

// ── Response normalization ───────────────────────────────

fn normalize_response(body: ChatResponse, tools_offered: bool) -> Result<LlmResponse, LlmError> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))?;

    let mut content = choice.message.content.unwrap_or_default();

    let mut tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, tc)| {
            let arguments = match tc.function.arguments {
                Value::String(s) => s,
                Value::Null => "{}".to_string(),
                other => other.to_string(),
            };
            ToolCall::new(
                tc.id.unwrap_or_else(|| format!("call_{i}")),
                tc.function.name,
                arguments,
            )
        })
        .collect();

    if tool_calls.is_empty() && tools_offered {
        if let Some(call) = parse_fenced_tool_call(&content) {
            debug!("Promoted fenced JSON block to tool call: {}", call.name());
            tool_calls.push(call);
            content.clear();
        }
    }

    let usage = body
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
        .unwrap_or_default();

    Ok(LlmResponse {
        message: Message::assistant_with_tools(content, tool_calls),
        usage,
    })
}

/// Extracts a `{"name": .., "arguments": ..}` object from the first
/// fenced code block that holds one.
fn parse_fenced_tool_call(content: &str) -> Option<ToolCall> {
    let mut rest = content;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let body_start = after.find(|c: char| c == '{' || c == '`')?;
        let end = after.find("```")?;
        let block = &after[body_start.min(end)..end];

        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(block.trim()) {
            if let (Some(Value::String(name)), Some(arguments)) = (obj.get("name"), obj.get("arguments")) {
                let arguments = match arguments {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                return Some(ToolCall::new("call_parsed_0", name.clone(), arguments));
            }
        }
        rest = &after[end + 3..];
    }
    None
}
