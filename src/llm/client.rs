//! `LlmClient` trait: abstraction over LLM backends.
//!
//! Backends (OpenAI-compatible HTTP, the retrying wrapper, test doubles)
//! implement this trait so the orchestrator never depends on a concrete
//! provider.

use async_trait::async_trait;

use super::{LlmResponse, Message, ToolDefinition};
use crate::error::LlmError;

/// Abstraction over LLM backends.
///
/// Each backend translates the shared message/tool types into its own
/// wire format and normalizes responses back into [`LlmResponse`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends a conversation to the LLM and returns the response.
    ///
    /// When `tools` is `Some`, tool definitions are included and the
    /// response may carry tool calls.
    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse, LlmError>;

    /// Human-readable description of the provider and model.
    ///
    /// Used in status output, e.g. `"ollama (llama3.1)"`.
    fn description(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time verification that `LlmClient` is object-safe.
    #[test]
    fn test_llm_client_is_object_safe() {
        fn _assert_object_safe(_: &dyn LlmClient) {}
    }
}
