use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::gateway::{ChannelNotifier, GatewayCommand, GatewayEvent, IncomingMessage, Notifier};
use crate::hitl::HitlManager;

use super::orchestrator::Orchestrator;
use super::router::RequestContext;

/// The agent runtime: receives gateway events, runs each message through
/// the orchestrator on its own task, and sends the replies back.
pub struct AgentRuntime {
    config: Config,
    orchestrator: Arc<Orchestrator>,
    hitl: Arc<HitlManager>,
    llm_description: String,
    start_time: Instant,
}

impl AgentRuntime {
    pub fn new(
        config: Config,
        orchestrator: Arc<Orchestrator>,
        hitl: Arc<HitlManager>,
        llm_description: String,
    ) -> Self {
        Self {
            config,
            orchestrator,
            hitl,
            llm_description,
            start_time: Instant::now(),
        }
    }

    /// Main agent loop. Returns when the gateway closes its event channel.
    pub async fn run(
        self: Arc<Self>,
        mut event_rx: mpsc::Receiver<GatewayEvent>,
        cmd_tx: mpsc::Sender<GatewayCommand>,
    ) -> Result<()> {
        info!("Agent runtime started, waiting for messages...");
        let notifier = ChannelNotifier::new(cmd_tx);

        while let Some(event) = event_rx.recv().await {
            match event {
                GatewayEvent::Connected => {
                    info!("Agent is online and ready");
                }
                GatewayEvent::ApprovalCallback(event) => {
                    if !self.hitl.handle_event(&event) {
                        info!("Approval {} is no longer pending", event.request_id);
                    }
                }
                GatewayEvent::Message(msg) => {
                    if !self.config.is_allowed(msg.user_id) {
                        warn!("Unauthorized message from user {}, ignoring", msg.user_id);
                        continue;
                    }
                    let runtime = Arc::clone(&self);
                    let notifier = notifier.clone();
                    tokio::spawn(async move {
                        runtime.handle(msg, notifier).await;
                    });
                }
            }
        }

        info!("Gateway closed, agent runtime stopping");
        Ok(())
    }

    async fn handle(&self, msg: IncomingMessage, notifier: ChannelNotifier) {
        let chat_id = msg.chat_id;
        let text = if msg.text.starts_with('/') && msg.upload.is_none() {
            self.handle_command(msg.user_id, &msg.text).await
        } else {
            self.handle_message(msg, &notifier).await
        };
        if let Err(e) = notifier.send(chat_id, &text).await {
            error!("Could not deliver reply to chat {chat_id}: {e}");
        }
    }

    async fn handle_message(&self, msg: IncomingMessage, notifier: &ChannelNotifier) -> String {
        info!("Processing message from user {}: {} chars", msg.user_id, msg.text.len());
        let ctx = RequestContext::new(msg.user_id, msg.chat_id)
            .with_presenter(Arc::new(notifier.presenter(msg.chat_id)))
            .with_upload(msg.upload);

        match self.orchestrator.process_message(&msg.text, &ctx).await {
            Ok(reply) => reply.text,
            Err(e) => {
                error!("Error processing message from user {}: {e}", msg.user_id);
                format!("Sorry, something went wrong: {e}")
            }
        }
    }

    // ── Slash commands ────────────────────────────────────

    /// These are intercepted by the runtime and never reach the LLM.
    async fn handle_command(&self, user_id: i64, body: &str) -> String {
        let command = body.split_whitespace().next().unwrap_or(body).to_lowercase();
        info!("Slash command from user {user_id}: {command}");

        match command.as_str() {
            "/new" | "/reset" => match self.orchestrator.reset(user_id).await {
                Ok(()) => "Conversation history cleared.".to_string(),
                Err(e) => format!("Sorry, something went wrong: {e}"),
            },
            "/status" => self.cmd_status(user_id).await,
            "/help" => cmd_help(),
            "/ping" => "pong".to_string(),
            _ => format!("Unknown command: {command}\nType /help for available commands."),
        }
    }

    /// /status: agent status overview
    async fn cmd_status(&self, user_id: i64) -> String {
        let uptime = self.start_time.elapsed();
        let hours = uptime.as_secs() / 3600;
        let minutes = (uptime.as_secs() % 3600) / 60;

        let messages = self
            .orchestrator
            .conversations()
            .message_count(user_id)
            .await
            .unwrap_or(0);
        let router = self.orchestrator.router();

        format!(
            "{} status\n\
             Uptime: {hours}h {minutes}m\n\
             LLM: {}\n\
             Skills: {} ({} tools)\n\
             Sandbox: {}\n\
             Pending approvals: {}\n\
             Your session: {messages} messages",
            self.config.agent.name,
            self.llm_description,
            router.registry().len(),
            router.registry().tool_definitions().len(),
            if router.has_sandbox() { "enabled" } else { "disabled" },
            self.hitl.pending_count(),
        )
    }
}

/// /help: available commands
fn cmd_help() -> String {
    "\
Commands:\n\
  /new     Start a new conversation\n\
  /reset   Clear the conversation history\n\
  /status  Agent info, uptime, session stats\n\
  /ping    Check if the agent is alive\n\
  /help    This message"
        .to_string()
}
