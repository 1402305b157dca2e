use serde_json::Value;
use tracing::info;

use crate::llm::Usage;

/// Receives an entry for every tool call and every finished exchange.
pub trait AuditSink: Send + Sync {
    fn log_tool_call(&self, user_id: i64, tool_name: &str, arguments: &Value);

    fn log_llm_usage(&self, user_id: i64, model: &str, usage: Usage, rounds: usize);
}

/// Writes audit entries to the `audit` tracing target.
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn log_tool_call(&self, user_id: i64, tool_name: &str, arguments: &Value) {
        let keys: Vec<&str> = arguments
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        info!(target: "audit", user_id, tool = tool_name, ?keys, "tool call");
    }

    fn log_llm_usage(&self, user_id: i64, model: &str, usage: Usage, rounds: usize) {
        info!(
            target: "audit",
            user_id,
            model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            rounds,
            "llm usage"
        );
    }
}
