//! The tool loop: one incoming message in, one reply out.
//!
//! ```text
//! user text ─▶ redact ─▶ [system, history…, user] ─▶ LLM
//!                              ▲                      │
//!                              │   tool calls?  ──────┤ no ─▶ reply
//!                              │                      │ yes
//!                              └── tool results ◀── router (in order)
//! ```
//!
//! Every round appends the assistant turn and one tool-result message per
//! call before the model is asked again, so round N+1 always sees all of
//! round N.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::agent::audit::{AuditSink, TracingAudit};
use crate::agent::conversation::{ConversationStore, InMemoryConversationStore};
use crate::agent::memory::{FactStore, NewFact, DEFAULT_CATEGORY, DEFAULT_IMPORTANCE};
use crate::agent::redaction::Redactor;
use crate::agent::router::{RequestContext, ToolRouter};
use crate::agent::token_guard::TokenGuard;
use crate::config::Config;
use crate::error::AgentError;
use crate::llm::{LlmClient, Message, ToolCall, Usage};

/// Reply used when the model ends on an empty message.
pub const EMPTY_REPLY: &str = "I processed your request but have nothing to add.";

/// Shorter messages are not worth a memory extraction pass.
const MIN_EXTRACTION_CHARS: usize = 10;

/// How many stored facts are injected into the system prompt.
const PROMPT_FACTS: usize = 20;

const EXTRACTION_SYSTEM: &str =
    "You extract structured memories from conversations. Return only valid JSON.";

/// Outcome of one processed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    /// Summed over every LLM call made for the message.
    pub usage: Usage,
    /// Tool rounds that ran.
    pub rounds: usize,
}

pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    router: Arc<ToolRouter>,
    guard: TokenGuard,
    redactor: Arc<Redactor>,
    conversations: Arc<dyn ConversationStore>,
    audit: Arc<dyn AuditSink>,
    facts: Option<Arc<dyn FactStore>>,
    system_prompt: String,
    model: String,
    history_window: usize,
    tool_errors_abort_message: bool,
    memory_extraction: bool,
}

impl Orchestrator {
    pub fn new(config: &Config, llm: Arc<dyn LlmClient>, router: Arc<ToolRouter>) -> Self {
        Self {
            llm,
            router,
            guard: TokenGuard::new(config.agent.max_tool_rounds, config.agent.max_result_chars),
            redactor: Arc::new(Redactor::new(
                config.sensitive_values(),
                &config.redaction.patterns,
            )),
            conversations: Arc::new(InMemoryConversationStore::new(config.agent.history_window)),
            audit: Arc::new(TracingAudit),
            facts: None,
            system_prompt: config.agent.system_prompt.clone(),
            model: config.llm.model.clone(),
            history_window: config.agent.history_window,
            tool_errors_abort_message: config.agent.tool_errors_abort_message,
            memory_extraction: config.agent.memory_extraction,
        }
    }

    pub fn with_facts(mut self, facts: Arc<dyn FactStore>) -> Self {
        self.facts = Some(facts);
        self
    }

    pub fn with_conversations(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = store;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    pub fn conversations(&self) -> &Arc<dyn ConversationStore> {
        &self.conversations
    }

    /// Runs the full tool loop for one message.
    ///
    /// Fails with [`AgentError::RoundLimit`] once the model asks for more
    /// tool rounds than allowed, which bounds the loop to
    /// `max_tool_rounds + 1` LLM calls.
    pub async fn process_message(
        &self,
        text: &str,
        ctx: &RequestContext,
    ) -> Result<Reply, AgentError> {
        let user_id = ctx.user_id;
        let user_text = self.redactor.redact(text);

        let history = self
            .conversations
            .history(user_id, self.history_window)
            .await
            .map_err(|e| AgentError::Storage(e.to_string()))?;

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(self.build_system_prompt(user_id).await));
        messages.extend(history);
        messages.push(Message::user(user_text.clone()));

        let tools = self.router.registry().tool_definitions();
        let tools = (!tools.is_empty()).then_some(tools.as_slice());

        let mut usage = Usage::default();
        let mut rounds = 0;

        let final_text = loop {
            let response = self.llm.complete(&messages, tools).await?;
            usage += response.usage;
            let assistant = response.message;

            if !assistant.has_tool_calls() {
                break assistant.content;
            }

            rounds += 1;
            if !self.guard.allow_round(rounds) {
                warn!(
                    "User {user_id}: model asked for tool round {rounds}, limit is {}",
                    self.guard.max_tool_rounds()
                );
                return Err(AgentError::RoundLimit(self.guard.max_tool_rounds()));
            }

            let calls = assistant.tool_calls.clone();
            messages.push(assistant);
            for call in &calls {
                let result = self.run_tool_call(call, ctx).await?;
                messages.push(Message::tool_result(&call.id, result));
            }
        };

        let reply = if final_text.trim().is_empty() {
            EMPTY_REPLY.to_string()
        } else {
            final_text
        };
        let reply = self.redactor.redact(&reply);

        if let Err(e) = self
            .conversations
            .append(
                user_id,
                vec![Message::user(user_text.clone()), Message::assistant(reply.clone())],
            )
            .await
        {
            warn!("Could not save conversation for user {user_id}: {e}");
        }

        if usage.total_tokens > 0 {
            self.audit.log_llm_usage(user_id, &self.model, usage, rounds);
        }
        info!(
            "Reply to user {user_id}: {} chars, {rounds} tool round(s), {} tokens",
            reply.len(),
            usage.total_tokens
        );

        if self.memory_extraction && user_text.chars().count() >= MIN_EXTRACTION_CHARS {
            if let Some(facts) = &self.facts {
                spawn_extraction(
                    Arc::clone(&self.llm),
                    Arc::clone(facts),
                    user_id,
                    user_text,
                    reply.clone(),
                );
            }
        }

        Ok(Reply {
            text: reply,
            usage,
            rounds,
        })
    }

    /// Executes one call and returns the (truncated, redacted) result text.
    async fn run_tool_call(&self, call: &ToolCall, ctx: &RequestContext) -> Result<String, AgentError> {
        let arguments = call.parsed_arguments();
        info!("Tool call: {}({arguments})", call.name());
        self.audit.log_tool_call(ctx.user_id, call.name(), &arguments);

        let result = match self.router.execute(call.name(), arguments, ctx).await {
            Ok(result) => result,
            Err(e) if self.tool_errors_abort_message => return Err(e.into()),
            Err(e) => format!("Error: {e}"),
        };
        Ok(self.redactor.redact(&self.guard.truncate_result(result)))
    }

    /// Forgets the user's conversation history.
    pub async fn reset(&self, user_id: i64) -> Result<(), AgentError> {
        self.conversations
            .clear(user_id)
            .await
            .map_err(|e| AgentError::Storage(e.to_string()))
    }

    async fn build_system_prompt(&self, user_id: i64) -> String {
        let mut prompt = self.system_prompt.clone();
        let Some(facts) = &self.facts else {
            return prompt;
        };
        match facts.list(user_id, None).await {
            Ok(mut known) if !known.is_empty() => {
                known.sort_by(|a, b| b.importance.cmp(&a.importance));
                prompt.push_str("\n\n## What you know about the user\n");
                for fact in known.iter().take(PROMPT_FACTS) {
                    prompt.push_str(&format!("- {}: {}\n", fact.title, fact.content));
                }
            }
            Ok(_) => {}
            Err(e) => debug!("Could not load facts for user {user_id}: {e}"),
        }
        prompt
    }
}

// ── Memory extraction ────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExtractedFact {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    importance: Option<i64>,
}

/// Detached: never delays the reply, never reports failure upward.
fn spawn_extraction(
    llm: Arc<dyn LlmClient>,
    facts: Arc<dyn FactStore>,
    user_id: i64,
    user_text: String,
    assistant_text: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match extract_memories(llm.as_ref(), facts.as_ref(), user_id, &user_text, &assistant_text).await {
            Ok(0) => {}
            Ok(saved) => debug!("Extracted {saved} memories for user {user_id}"),
            Err(e) => debug!("Memory extraction failed (non-critical): {e}"),
        }
    })
}

async fn extract_memories(
    llm: &dyn LlmClient,
    facts: &dyn FactStore,
    user_id: i64,
    user_text: &str,
    assistant_text: &str,
) -> anyhow::Result<usize> {
    let titles = facts.titles(user_id).await?;
    let existing = if titles.is_empty() {
        "(none)".to_string()
    } else {
        titles.iter().map(|t| format!("- {t}")).collect::<Vec<_>>().join("\n")
    };

    let prompt = format!(
        "Analyze the latest user/assistant exchange and decide what's worth remembering \
         long-term about the user.\n\n\
         Existing memory titles (avoid duplicates):\n{existing}\n\n\
         Latest exchange:\nUser: {user_text}\nAssistant: {assistant_text}\n\n\
         Return a JSON array of memories to save. Each object has \"title\", \"content\", \
         \"category\" (one of \"preference\", \"fact\", \"people\", \"goal\", \"general\") and \
         \"importance\" (1-10).\n\
         If nothing is worth remembering, return an empty array: []\n\
         Return ONLY valid JSON, no other text."
    );
    let messages = [Message::system(EXTRACTION_SYSTEM), Message::user(prompt)];
    let response = llm.complete(&messages, None).await?;

    let extracted: Vec<ExtractedFact> = serde_json::from_str(strip_code_fence(&response.message.content))?;

    let mut saved = 0;
    for item in extracted {
        let (title, content) = (item.title.trim(), item.content.trim());
        if title.is_empty() || content.is_empty() || titles.iter().any(|t| t == title) {
            continue;
        }
        let fact = NewFact::new(title, content, "auto")
            .category(item.category.as_deref().unwrap_or(DEFAULT_CATEGORY))
            .importance(item.importance.unwrap_or(DEFAULT_IMPORTANCE as i64));
        facts.save(user_id, fact).await?;
        saved += 1;
    }
    Ok(saved)
}

/// Strips a surrounding markdown code fence, if any.
fn strip_code_fence(raw: &str) -> &str {
    let raw = raw.trim();
    let Some(rest) = raw.strip_prefix("```") else {
        return raw;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.rsplit_once("```").map_or(body, |(inner, _)| inner).trim()
}
