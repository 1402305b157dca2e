//! Chat-completion types shared by every LLM backend.
//!
//! The transcript uses the OpenAI-compatible wire shape: assistant
//! messages carry `tool_calls`, tool results are `role: "tool"` messages
//! keyed by `tool_call_id`.

pub mod client;
pub mod openai;
pub mod retry;

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use client::LlmClient;
pub use openai::OpenAiCompatClient;
pub use retry::RetryingClient;

/// One entry of the conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    /// Assistant turn that requests tool calls.
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain("assistant", content)
        }
    }

    /// Result of one tool call, fed back to the model.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain("tool", content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A tool call as emitted by the model:
/// `{id, type: "function", function: {name, arguments: "<json string>"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON text, exactly as the model produced it.
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Parses the argument string into a JSON object.
    ///
    /// Malformed JSON, or JSON that is not an object, degrades to `{}`.
    pub fn parsed_arguments(&self) -> Value {
        match serde_json::from_str::<Value>(&self.function.arguments) {
            Ok(Value::Object(map)) => Value::Object(map),
            _ => Value::Object(Map::new()),
        }
    }
}

/// Tool definition advertised to the model (OpenAI function format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_type: function_type(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// Token usage reported by one (or several, summed) completion calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

/// LLM response with metadata
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// The assistant message, possibly carrying tool calls.
    pub message: Message,
    pub usage: Usage,
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_call_wire_shape_deserializes() {
        let raw = json!({
            "id": "call_1",
            "type": "function",
            "function": {"name": "web_search", "arguments": "{\"query\":\"rust\"}"}
        });
        let call: ToolCall = serde_json::from_value(raw).unwrap();
        assert_eq!(call.name(), "web_search");
        assert_eq!(call.parsed_arguments()["query"], "rust");
    }

    #[test]
    fn test_tool_call_type_defaults_to_function() {
        let raw = json!({"id": "c", "function": {"name": "x", "arguments": "{}"}});
        let call: ToolCall = serde_json::from_value(raw).unwrap();
        assert_eq!(call.call_type, "function");
    }

    #[test]
    fn test_malformed_arguments_degrade_to_empty_object() {
        let call = ToolCall::new("c1", "run_python", "{not json");
        assert_eq!(call.parsed_arguments(), json!({}));
    }

    #[test]
    fn test_non_object_arguments_degrade_to_empty_object() {
        let call = ToolCall::new("c1", "run_python", "[1, 2]");
        assert_eq!(call.parsed_arguments(), json!({}));
    }

    #[test]
    fn test_tool_result_message_shape() {
        let msg = Message::tool_result("call_7", "42");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"role": "tool", "content": "42", "tool_call_id": "call_7"}));
    }

    #[test]
    fn test_plain_message_omits_tool_fields() {
        let value = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(value.get("tool_calls").is_none());
        assert!(value.get("tool_call_id").is_none());
    }

    #[test]
    fn test_tool_definition_serialization() {
        let def = ToolDefinition::function("run_python", "Run code", json!({"type": "object"}));
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["name"], "run_python");
        assert_eq!(value["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = Usage::default();
        total += Usage {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
        };
        total += Usage {
            prompt_tokens: 7,
            completion_tokens: 1,
            total_tokens: 8,
        };
        assert_eq!(total.prompt_tokens, 10);
        assert_eq!(total.completion_tokens, 3);
        assert_eq!(total.total_tokens, 13);
    }
}
