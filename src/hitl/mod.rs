//! Human-in-the-loop approval gate.
//!
//! A request moves Pending (prompt being delivered) → Awaiting (prompt
//! shown, waiting for a button press) → resolved or expired. Pending
//! requests live in a map keyed by a short random id; resolving or
//! expiring a request removes it, so a late or duplicate callback finds
//! nothing and is ignored.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::ApprovalError;

/// How long a request waits for the user before it expires.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Cap on the rendered argument preview.
const ARGS_PREVIEW_CHARS: usize = 500;

/// Cap on the source-code preview shown for code-carrying calls.
const CODE_PREVIEW_CHARS: usize = 1_000;

// ── Decisions and presentation contract ──────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
    /// Approve and stop asking for this skill.
    Trust,
}

impl ApprovalDecision {
    pub fn as_action(&self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "approve",
            ApprovalDecision::Deny => "deny",
            ApprovalDecision::Trust => "trust",
        }
    }

    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "approve" => Some(ApprovalDecision::Approve),
            "deny" => Some(ApprovalDecision::Deny),
            "trust" => Some(ApprovalDecision::Trust),
            _ => None,
        }
    }
}

/// Formatting requested from the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFormat {
    /// Markdown with code blocks.
    Rich,
    Plain,
}

/// One button offered to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalChoice {
    pub label: String,
    /// `"<action>:<request_id>"`, echoed back in the callback.
    pub callback_data: String,
}

/// Handle to a delivered prompt, used to update it once resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRef(pub String);

/// Inbound button press: `{request_id, chosen_action}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalEvent {
    pub request_id: String,
    pub action: String,
}

impl ApprovalEvent {
    /// Parses `"<action>:<request_id>"` callback data.
    pub fn parse(data: &str) -> Option<Self> {
        let (action, request_id) = data.split_once(':')?;
        if action.is_empty() || request_id.is_empty() {
            return None;
        }
        Some(Self {
            request_id: request_id.to_string(),
            action: action.to_string(),
        })
    }
}

/// Delivers approval prompts to the user. Implemented by the chat gateway.
#[async_trait]
pub trait ApprovalPresenter: Send + Sync {
    /// Shows `text` with the given choices. Returning an error for
    /// [`PromptFormat::Rich`] makes the manager retry with plain text.
    async fn present(
        &self,
        text: &str,
        format: PromptFormat,
        choices: &[ApprovalChoice],
    ) -> anyhow::Result<MessageRef>;

    /// Replaces the prompt with a final status line once it is settled.
    async fn finish(&self, _message: &MessageRef, _text: &str) {}
}

// ── Manager ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Awaiting,
}

/// Snapshot of an outstanding request, for status output.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub id: String,
    pub tool_name: String,
    pub created_at: DateTime<Utc>,
    pub state: RequestState,
}

struct PendingRequest {
    tool_name: String,
    created_at: DateTime<Utc>,
    state: RequestState,
    allow_trust: bool,
    responder: oneshot::Sender<ApprovalDecision>,
}

pub struct HitlManager {
    timeout: Duration,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

/// Purges the request from the map however `request_approval` exits.
struct PendingGuard<'a> {
    manager: &'a HitlManager,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.manager.lock().remove(&self.id);
    }
}

impl HitlManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `request` under the first id from `next_id` that is not
    /// already pending. Short ids can collide; the older request keeps its id.
    fn insert_pending(
        &self,
        request: PendingRequest,
        mut next_id: impl FnMut() -> String,
    ) -> String {
        let mut pending = self.lock();
        loop {
            let id = next_id();
            if let Entry::Vacant(slot) = pending.entry(id.clone()) {
                slot.insert(request);
                return id;
            }
            debug!("Approval id {id} already pending, drawing another");
        }
    }

    /// Asks the user to approve a tool call and waits for the answer.
    ///
    /// `allow_trust` adds a third "always allow" choice (user-created
    /// skills only). Exactly one decision is ever returned per request.
    pub async fn request_approval(
        &self,
        presenter: &dyn ApprovalPresenter,
        tool_name: &str,
        arguments: &Value,
        allow_trust: bool,
    ) -> Result<ApprovalDecision, ApprovalError> {
        let (tx, rx) = oneshot::channel();
        let id = self.insert_pending(
            PendingRequest {
                tool_name: tool_name.to_string(),
                created_at: Utc::now(),
                state: RequestState::Pending,
                allow_trust,
                responder: tx,
            },
            new_request_id,
        );
        let _guard = PendingGuard {
            manager: self,
            id: id.clone(),
        };

        let choices = choices_for(&id, allow_trust);
        let message = self
            .present(presenter, tool_name, arguments, &choices)
            .await?;

        if let Some(req) = self.lock().get_mut(&id) {
            req.state = RequestState::Awaiting;
        }
        info!("Approval {id} requested for {tool_name}");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => {
                let status = match decision {
                    ApprovalDecision::Approve => format!("Approved: {tool_name}"),
                    ApprovalDecision::Trust => format!("Approved and trusted: {tool_name}"),
                    ApprovalDecision::Deny => format!("Denied: {tool_name}"),
                };
                presenter.finish(&message, &status).await;
                Ok(decision)
            }
            Ok(Err(_)) => Err(ApprovalError::Cancelled {
                tool: tool_name.to_string(),
            }),
            Err(_) => {
                warn!("Approval {id} for {tool_name} expired");
                presenter
                    .finish(&message, "This approval request has expired.")
                    .await;
                Err(ApprovalError::Timeout {
                    tool: tool_name.to_string(),
                    secs: self.timeout.as_secs(),
                })
            }
        }
    }

    async fn present(
        &self,
        presenter: &dyn ApprovalPresenter,
        tool_name: &str,
        arguments: &Value,
        choices: &[ApprovalChoice],
    ) -> Result<MessageRef, ApprovalError> {
        let rich = render_prompt(tool_name, arguments, PromptFormat::Rich);
        match presenter.present(&rich, PromptFormat::Rich, choices).await {
            Ok(message) => return Ok(message),
            Err(e) => debug!("Rich approval prompt rejected, falling back to plain text: {e}"),
        }

        let plain = render_prompt(tool_name, arguments, PromptFormat::Plain);
        presenter
            .present(&plain, PromptFormat::Plain, choices)
            .await
            .map_err(|e| ApprovalError::Presentation {
                tool: tool_name.to_string(),
                reason: e.to_string(),
            })
    }

    /// Delivers a decision. Returns `false` when the id is unknown
    /// (already resolved, expired, or never issued).
    pub fn resolve(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        let Some(req) = self.lock().remove(request_id) else {
            debug!("Ignoring decision for unknown approval {request_id}");
            return false;
        };

        let decision = match decision {
            ApprovalDecision::Trust if !req.allow_trust => ApprovalDecision::Approve,
            other => other,
        };
        info!(
            "User chose {} for {} ({request_id})",
            decision.as_action(),
            req.tool_name
        );
        req.responder.send(decision).is_ok()
    }

    /// Resolves from a raw inbound event; unknown actions are ignored.
    pub fn handle_event(&self, event: &ApprovalEvent) -> bool {
        match ApprovalDecision::from_action(&event.action) {
            Some(decision) => self.resolve(&event.request_id, decision),
            None => {
                warn!("Unknown approval action: {}", event.action);
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut list: Vec<PendingApproval> = self
            .lock()
            .iter()
            .map(|(id, req)| PendingApproval {
                id: id.clone(),
                tool_name: req.tool_name.clone(),
                created_at: req.created_at,
                state: req.state,
            })
            .collect();
        list.sort_by_key(|p| p.created_at);
        list
    }
}

impl Default for HitlManager {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_TIMEOUT)
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn choices_for(id: &str, allow_trust: bool) -> Vec<ApprovalChoice> {
    let mut decisions = vec![ApprovalDecision::Approve, ApprovalDecision::Deny];
    if allow_trust {
        decisions.push(ApprovalDecision::Trust);
    }
    decisions
        .into_iter()
        .map(|d| ApprovalChoice {
            label: match d {
                ApprovalDecision::Approve => "Approve".to_string(),
                ApprovalDecision::Deny => "Deny".to_string(),
                ApprovalDecision::Trust => "Always allow".to_string(),
            },
            callback_data: format!("{}:{id}", d.as_action()),
        })
        .collect()
}

fn truncate_preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("\n...");
    out
}

/// Renders the prompt text. A string `code` argument is pulled out of
/// the argument dump and shown as its own capped preview.
fn render_prompt(tool_name: &str, arguments: &Value, format: PromptFormat) -> String {
    let mut args = arguments.clone();
    let code = args
        .as_object_mut()
        .filter(|map| map.get("code").is_some_and(Value::is_string))
        .and_then(|map| map.remove("code"))
        .and_then(|v| v.as_str().map(str::to_string));

    let has_other_args = args.as_object().map_or(true, |m| !m.is_empty());
    let args_preview = if has_other_args {
        let pretty = serde_json::to_string_pretty(&args).unwrap_or_else(|_| args.to_string());
        Some(truncate_preview(&pretty, ARGS_PREVIEW_CHARS))
    } else {
        None
    };
    let code_preview = code.map(|c| truncate_preview(&c, CODE_PREVIEW_CHARS));

    let mut text = match format {
        PromptFormat::Rich => format!("*Approval required:* `{tool_name}`\n"),
        PromptFormat::Plain => format!("Approval required for: {tool_name}\n"),
    };
    if let Some(preview) = args_preview {
        match format {
            PromptFormat::Rich => text.push_str(&format!("\n*Arguments:*\n```json\n{preview}\n```\n")),
            PromptFormat::Plain => text.push_str(&format!("\nArguments:\n{preview}\n")),
        }
    }
    if let Some(preview) = code_preview {
        match format {
            PromptFormat::Rich => text.push_str(&format!("\n*Code:*\n```python\n{preview}\n```\n")),
            PromptFormat::Plain => text.push_str(&format!("\nCode:\n{preview}\n")),
        }
    }
    text.push_str("\nThis action requires your approval.");
    text
}

#[cfg(test)]
pub(crate) mod testing {
    //! Presentation doubles for approval tests.

    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct PresentedPrompt {
        pub text: String,
        pub format: PromptFormat,
        pub choices: Vec<ApprovalChoice>,
    }

    impl PresentedPrompt {
        pub fn request_id(&self) -> String {
            ApprovalEvent::parse(&self.choices[0].callback_data)
                .unwrap()
                .request_id
        }
    }

    /// Records prompts and optionally answers them straight away.
    pub struct RecordingPresenter {
        pub prompts: Mutex<Vec<PresentedPrompt>>,
        pub finished: Mutex<Vec<String>>,
        pub reject_rich: bool,
        pub reject_all: bool,
        auto: Option<(Arc<HitlManager>, ApprovalDecision)>,
        notify: Option<mpsc::UnboundedSender<String>>,
    }

    impl RecordingPresenter {
        pub fn new() -> Self {
            Self {
                prompts: Mutex::new(Vec::new()),
                finished: Mutex::new(Vec::new()),
                reject_rich: false,
                reject_all: false,
                auto: None,
                notify: None,
            }
        }

        /// Resolves every prompt with `decision` as soon as it is shown.
        pub fn answering(manager: Arc<HitlManager>, decision: ApprovalDecision) -> Self {
            Self {
                auto: Some((manager, decision)),
                ..Self::new()
            }
        }

        /// Sends each presented request id on the returned channel.
        pub fn notifying() -> (Self, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    notify: Some(tx),
                    ..Self::new()
                },
                rx,
            )
        }

        pub fn prompt_count(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }

        pub fn last_prompt(&self) -> PresentedPrompt {
            self.prompts.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ApprovalPresenter for RecordingPresenter {
        async fn present(
            &self,
            text: &str,
            format: PromptFormat,
            choices: &[ApprovalChoice],
        ) -> anyhow::Result<MessageRef> {
            if self.reject_all || (self.reject_rich && format == PromptFormat::Rich) {
                anyhow::bail!("can't parse entities");
            }
            let prompt = PresentedPrompt {
                text: text.to_string(),
                format,
                choices: choices.to_vec(),
            };
            let id = prompt.request_id();
            self.prompts.lock().unwrap().push(prompt);

            if let Some((manager, decision)) = &self.auto {
                manager.resolve(&id, *decision);
            }
            if let Some(tx) = &self.notify {
                let _ = tx.send(id.clone());
            }
            Ok(MessageRef(id))
        }

        async fn finish(&self, _message: &MessageRef, text: &str) {
            self.finished.lock().unwrap().push(text.to_string());
        }
    }
}
