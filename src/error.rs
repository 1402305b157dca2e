//! Error taxonomy shared by the tool-execution engine.
//!
//! Approval outcomes never appear here as tool errors: the router turns
//! them into plain result text before anything reaches the orchestrator.

use thiserror::Error;

/// Failure of a single LLM completion call.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("authentication failed ({status}): {body}")]
    Auth { status: u16, body: String },

    #[error("model or endpoint not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("request rejected ({status}): {body}")]
    Request { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("LLM completion failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<LlmError> },
}

impl LlmError {
    /// Transient failures worth another attempt: connection problems,
    /// timeouts, rate limiting and 5xx responses.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Transport(_) | LlmError::RateLimited(_) | LlmError::Server { .. }
        )
    }

    /// Maps a non-success HTTP status to the matching error class.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => LlmError::Auth { status, body },
            404 => LlmError::NotFound(body),
            429 => LlmError::RateLimited(body),
            500..=599 => LlmError::Server { status, body },
            _ => LlmError::Request { status, body },
        }
    }
}

/// Failure of one sandboxed container run.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Container exited with code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i64, stderr: String },

    #[error("Sandbox image not found: {0}")]
    ImageNotFound(String),

    #[error("Container timed out after {0}s")]
    Timeout(u64),

    #[error("Container engine error: {0}")]
    Engine(String),

    #[error("Sandbox execution failed: {0}")]
    Execution(String),
}

impl SandboxError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout(_))
    }
}

/// A skill or sandbox call failed; carries the owning skill name.
#[derive(Debug, Error)]
#[error("Tool {skill} failed: {cause}")]
pub struct ToolError {
    pub skill: String,
    pub cause: String,
}

impl ToolError {
    pub fn new(skill: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self {
            skill: skill.into(),
            cause: cause.to_string(),
        }
    }
}

/// An approval request that ended without a user decision.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Approval for {tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("approval prompt for {tool} could not be delivered: {reason}")]
    Presentation { tool: String, reason: String },

    #[error("approval request for {tool} was cancelled")]
    Cancelled { tool: String },
}

/// Failures that abort processing of the current message.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Exceeded max tool rounds ({0})")]
    RoundLimit(usize),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("storage error: {0}")]
    Storage(String),
}
