mod agent;
mod backoff;
mod config;
mod error;
mod gateway;
mod hitl;
mod llm;
mod sandbox;
mod skills;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::memory::{FactStore, InMemoryFactStore};
use crate::agent::{AgentRuntime, Orchestrator, ToolRouter};
use crate::config::Config;
use crate::gateway::{console, ChannelNotifier};
use crate::hitl::HitlManager;
use crate::llm::{LlmClient, OpenAiCompatClient, RetryingClient};
use crate::sandbox::{DockerCli, SandboxExecutor};
use crate::skills::{builtin, InMemoryUserSkillStore, SkillRegistry, UserSkillStore};

/// The console gateway speaks for a single local user.
const CONSOLE_USER_ID: i64 = 1;

fn print_help() {
    println!(
        "\
senti-agent v{}

Personal assistant runtime: LLM tool loop, container sandbox and
human-in-the-loop approvals, driven from the console.

USAGE:
    senti-agent [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/agent.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

CONSOLE:
    /approve <id>            Approve a pending tool call
    /deny <id>               Deny a pending tool call
    /trust <id>              Approve and always allow (user-created skills)
    /upload <path> [text]    Send a file along with a message
    /help, /status, /reset   Agent commands

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG          Log level filter for tracing
                      (e.g. debug, senti_agent=debug,warn)
    LLM_API_KEY       API key for the OpenAI-compatible endpoint
    BRAVE_API_KEY     API key for the web_search sandbox

EXAMPLES:
    senti-agent                          # uses config/agent.toml
    senti-agent /etc/senti/agent.toml    # custom config path
    RUST_LOG=debug senti-agent           # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("senti-agent v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr so they don't interleave with console replies
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("senti_agent=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/agent.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    info!("Agent: {}", config.agent.name);
    info!("LLM: {} ({})", config.llm.provider, config.llm.model);
    if !config.is_allowed(CONSOLE_USER_ID) {
        warn!(
            "Console user {CONSOLE_USER_ID} is not in allowed_users; messages will be ignored"
        );
    }

    // ── Phase 1: collaborators ─────────────────────────────
    let llm: Arc<dyn LlmClient> = Arc::new(RetryingClient::new(
        Arc::new(OpenAiCompatClient::new(config.llm.clone())),
        config.llm.max_retries,
        Duration::from_millis(config.llm.retry_initial_delay_ms),
        Duration::from_millis(config.llm.retry_max_delay_ms),
    ));
    let llm_description = llm.description();

    let registry = Arc::new(SkillRegistry::new(&config.sandbox.python_image));
    builtin::register_enabled(&registry, &config)?;

    let user_skills: Arc<dyn UserSkillStore> = Arc::new(InMemoryUserSkillStore::new());
    for record in user_skills.list_all_enabled().await? {
        if let Err(e) = registry.register_user_skill(&record) {
            warn!("Skipping user skill {}: {e}", record.name);
        }
    }
    info!(
        "Skills: {} registered ({})",
        registry.len(),
        registry.skill_names().join(", ")
    );

    let facts: Arc<dyn FactStore> = Arc::new(InMemoryFactStore::new());
    let hitl = Arc::new(HitlManager::new(Duration::from_secs(
        config.approval.timeout_secs,
    )));

    let (event_rx, cmd_tx) = console::connect(CONSOLE_USER_ID);
    let notifier = Arc::new(ChannelNotifier::new(cmd_tx.clone()));

    // ── Phase 2: wiring ────────────────────────────────────
    let mut router = ToolRouter::new(Arc::clone(&registry), &config)
        .with_hitl(Arc::clone(&hitl))
        .with_facts(Arc::clone(&facts))
        .with_notifier(notifier)
        .with_user_skills(user_skills);
    if config.sandbox.is_enabled() {
        info!("Sandbox: {} (image {})", config.sandbox.engine, config.sandbox.python_image);
        let engine = Arc::new(DockerCli::new(&config.sandbox.engine));
        router = router.with_sandbox(Arc::new(SandboxExecutor::new(engine)));
    } else {
        warn!("Sandbox disabled: sandboxed skills will only report that they are unavailable");
    }

    let orchestrator = Arc::new(
        Orchestrator::new(&config, Arc::clone(&llm), Arc::new(router)).with_facts(facts),
    );
    let runtime = Arc::new(AgentRuntime::new(
        config,
        orchestrator,
        hitl,
        llm_description,
    ));

    println!("Type a message, or /help. Ctrl-D to quit.");
    tokio::select! {
        result = runtime.run(event_rx, cmd_tx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            Ok(())
        }
    }
}
