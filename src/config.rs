use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// "openai", "ollama", or any OpenAI-compatible endpoint name
    pub provider: String,
    pub model: String,
    /// Supports ${ENV_VAR} substitution; empty for keyless local servers
    #[serde(default)]
    pub api_key: String,
    /// Base URL; defaults per provider
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens_per_request: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Total attempts per completion, first call included
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    /// Number of past messages replayed to the LLM
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// User ids allowed to talk to the agent; "*" allows everyone
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// Abort the whole message when a tool fails; when false the error
    /// text is fed back to the model instead
    #[serde(default = "default_true")]
    pub tool_errors_abort_message: bool,
    /// Extract long-term memories from each exchange in the background
    #[serde(default = "default_true")]
    pub memory_extraction: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Container engine CLI binary; `"none"` disables the sandbox
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Interpreter image used for run_python and user-created skills
    #[serde(default = "default_python_image")]
    pub python_image: String,
    #[serde(default = "default_search_image")]
    pub search_image: String,
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_mem_limit")]
    pub mem_limit: String,
    /// Memory ceiling when a file is injected into the container
    #[serde(default = "default_upload_mem_limit")]
    pub upload_mem_limit: String,
    /// CFS quota per 100ms period (50000 = half a core)
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: i64,
    /// Size of the noexec tmpfs mounted on /tmp
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApprovalConfig {
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SkillsConfig {
    /// Builtin skill ids to register at startup
    #[serde(default = "default_enabled_skills")]
    pub enabled: Vec<String>,
    /// Secret environment per sandboxed skill, e.g.
    /// `[skills.secrets.web_search] BRAVE_API_KEY = "${BRAVE_API_KEY}"`
    #[serde(default)]
    pub secrets: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedactionConfig {
    /// Case-insensitive regexes replaced with `[REDACTED]`
    #[serde(default)]
    pub patterns: Vec<String>,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_agent_name() -> String {
    "Senti".to_string()
}

fn default_system_prompt() -> String {
    "You are Senti, a helpful personal assistant. Use the available tools when they help \
     answer the user. Be concise."
        .to_string()
}

fn default_max_tool_rounds() -> usize {
    10
}

fn default_max_result_chars() -> usize {
    4000
}

fn default_history_window() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_python_image() -> String {
    "senti-python:latest".to_string()
}

fn default_search_image() -> String {
    "senti-search:latest".to_string()
}

fn default_sandbox_timeout_secs() -> u64 {
    30
}

fn default_mem_limit() -> String {
    "128m".to_string()
}

fn default_upload_mem_limit() -> String {
    "256m".to_string()
}

fn default_cpu_quota() -> i64 {
    50_000
}

fn default_tmpfs_size() -> String {
    "10m".to_string()
}

fn default_approval_timeout_secs() -> u64 {
    120
}

fn default_enabled_skills() -> Vec<String> {
    ["datetime", "memory", "python_runner", "skillsmith", "reminder"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            system_prompt: default_system_prompt(),
            max_tool_rounds: default_max_tool_rounds(),
            max_result_chars: default_max_result_chars(),
            history_window: default_history_window(),
            allowed_users: Vec::new(),
            tool_errors_abort_message: true,
            memory_extraction: true,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            python_image: default_python_image(),
            search_image: default_search_image(),
            timeout_secs: default_sandbox_timeout_secs(),
            mem_limit: default_mem_limit(),
            upload_mem_limit: default_upload_mem_limit(),
            cpu_quota: default_cpu_quota(),
            tmpfs_size: default_tmpfs_size(),
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout_secs(),
        }
    }
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_skills(),
            secrets: BTreeMap::new(),
        }
    }
}

impl SandboxConfig {
    /// An empty engine, or `"none"`, turns the sandbox off.
    pub fn is_enabled(&self) -> bool {
        let engine = self.engine.trim();
        !engine.is_empty() && engine != "none"
    }
}

impl SkillsConfig {
    /// Non-empty secrets declared for one skill.
    pub fn secrets_for(&self, skill: &str) -> BTreeMap<String, String> {
        self.secrets
            .get(skill)
            .map(|env| {
                env.iter()
                    .filter(|(_, v)| !v.is_empty())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${BRAVE_API_KEY}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Checks if a user id is allowed to talk to the agent
    pub fn is_allowed(&self, user_id: i64) -> bool {
        let id = user_id.to_string();
        self.agent
            .allowed_users
            .iter()
            .any(|allowed| allowed.trim() == id || allowed == "*")
    }

    /// Minimal local config used by unit tests across the crate.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Config {
            llm: LlmConfig {
                provider: "ollama".to_string(),
                model: "llama3.1".to_string(),
                api_key: "test-key".to_string(),
                host: None,
                max_tokens_per_request: 4096,
                request_timeout_secs: 120,
                max_retries: 3,
                retry_initial_delay_ms: 1_000,
                retry_max_delay_ms: 30_000,
            },
            agent: AgentConfig::default(),
            sandbox: SandboxConfig::default(),
            approval: ApprovalConfig::default(),
            skills: SkillsConfig::default(),
            redaction: RedactionConfig::default(),
        }
    }

    /// Secret values that must never reach the LLM or the user verbatim.
    /// Very short values are skipped to avoid redacting common words.
    pub fn sensitive_values(&self) -> BTreeSet<String> {
        std::iter::once(&self.llm.api_key)
            .chain(self.skills.secrets.values().flat_map(|env| env.values()))
            .filter(|v| v.len() > 4)
            .cloned()
            .collect()
    }
}
