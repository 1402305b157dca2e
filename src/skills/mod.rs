pub mod builtin;
pub mod registry;
pub mod user_skills;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::memory::FactStore;
use crate::gateway::Notifier;
use crate::llm::ToolDefinition;
use crate::sandbox::NETWORK_NONE;

pub use registry::{ResolvedSkill, SkillRegistry};
pub use user_skills::{InMemoryUserSkillStore, UserSkillProxy, UserSkillRecord, UserSkillStore};

/// Runtime context passed to in-process skill execution.
///
/// Carries the caller's identity plus the collaborators a skill may need.
/// Collaborators are optional; a skill reports "not available" when its
/// collaborator is missing rather than failing.
#[derive(Clone)]
pub struct SkillContext {
    pub user_id: i64,
    pub chat_id: i64,
    pub facts: Option<Arc<dyn FactStore>>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub user_skills: Option<Arc<dyn UserSkillStore>>,
    pub registry: Arc<SkillRegistry>,
}

/// A skill that the LLM can invoke through one or more tool functions.
///
/// Builtin and user-created skills implement this trait. Sandboxed skills
/// still implement `execute`, but the router only reaches it when no
/// sandbox is configured.
#[async_trait]
pub trait Skill: Send + Sync {
    /// Unique skill identifier (e.g. "python_runner").
    fn name(&self) -> &str;

    /// Tool functions this skill exposes to the LLM.
    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    /// Executes one function and returns a text result for the LLM.
    async fn execute(
        &self,
        function: &str,
        params: Value,
        context: &SkillContext,
    ) -> anyhow::Result<String>;
}

/// Execution and approval policy of a skill.
///
/// Immutable once registered, except `trusted`, which the registry flips
/// when the user picks "always allow".
#[derive(Debug, Clone, PartialEq)]
pub struct SkillDefinition {
    pub name: String,
    pub description: String,
    pub sandboxed: bool,
    pub sandbox_image: String,
    pub network_mode: String,
    pub requires_approval: bool,
    pub requires_approval_functions: BTreeSet<String>,
    /// Environment keys the sandbox receives from the skill's configured secrets.
    pub secret_keys: Vec<String>,
    pub trusted: bool,
    pub user_created: bool,
    pub code: Option<String>,
}

impl SkillDefinition {
    /// A skill that runs inside the agent process.
    pub fn in_process(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            sandboxed: false,
            sandbox_image: String::new(),
            network_mode: NETWORK_NONE.to_string(),
            requires_approval: false,
            requires_approval_functions: BTreeSet::new(),
            secret_keys: Vec::new(),
            trusted: false,
            user_created: false,
            code: None,
        }
    }

    /// A skill whose functions run in `image`, attached to `network_mode`.
    pub fn sandboxed(
        name: impl Into<String>,
        description: impl Into<String>,
        image: impl Into<String>,
        network_mode: impl Into<String>,
    ) -> Self {
        Self {
            sandboxed: true,
            sandbox_image: image.into(),
            network_mode: network_mode.into(),
            ..Self::in_process(name, description)
        }
    }

    /// A skill written by the user; always sandboxed, always gated until trusted.
    pub fn user_created(record: &UserSkillRecord, image: impl Into<String>) -> Self {
        Self {
            requires_approval: true,
            trusted: record.trusted,
            user_created: true,
            code: Some(record.code.clone()),
            ..Self::sandboxed(&record.name, &record.description, image, NETWORK_NONE)
        }
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn requiring_approval_for(mut self, functions: &[&str]) -> Self {
        self.requires_approval_functions
            .extend(functions.iter().map(|f| f.to_string()));
        self
    }

    pub fn with_secrets(mut self, keys: &[&str]) -> Self {
        self.secret_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Whether calling `function` must wait for user approval.
    ///
    /// Trusted user-created skills never ask. Otherwise a per-function
    /// entry or the blanket flag makes approval mandatory.
    pub fn needs_approval(&self, function: &str) -> bool {
        if self.user_created && self.trusted {
            return false;
        }
        self.requires_approval_functions.contains(function) || self.requires_approval
    }
}

/// Reads a required string parameter.
pub(crate) fn required_str<'a>(params: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    params[key]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(trusted: bool) -> UserSkillRecord {
        UserSkillRecord {
            id: 1,
            user_id: 7,
            name: "word_count".to_string(),
            description: "Count words".to_string(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            code: "def run(args):\n    return '3'".to_string(),
            trusted,
            enabled: true,
        }
    }

    #[test]
    fn test_in_process_needs_no_approval_by_default() {
        let def = SkillDefinition::in_process("datetime", "clock");
        assert!(!def.needs_approval("get_current_datetime"));
        assert!(!def.sandboxed);
        assert_eq!(def.network_mode, "none");
    }

    #[test]
    fn test_blanket_approval_flag() {
        let def = SkillDefinition::sandboxed("python_runner", "py", "senti-python:latest", "none")
            .requiring_approval();
        assert!(def.needs_approval("run_python"));
    }

    #[test]
    fn test_per_function_approval() {
        let def = SkillDefinition::in_process("skillsmith", "tools")
            .requiring_approval_for(&["create_skill"]);
        assert!(def.needs_approval("create_skill"));
        assert!(!def.needs_approval("list_user_skills"));
        assert!(!def.needs_approval("delete_skill"));
    }

    #[test]
    fn test_untrusted_user_skill_needs_approval() {
        let def = SkillDefinition::user_created(&record(false), "senti-python:latest");
        assert!(def.user_created);
        assert!(def.sandboxed);
        assert!(def.needs_approval("word_count"));
        assert_eq!(def.code.as_deref(), Some("def run(args):\n    return '3'"));
    }

    #[test]
    fn test_trusted_user_skill_skips_approval() {
        let def = SkillDefinition::user_created(&record(true), "senti-python:latest");
        assert!(!def.needs_approval("word_count"));
    }

    #[test]
    fn test_trust_flag_ignored_for_builtin() {
        let mut def = SkillDefinition::sandboxed("python_runner", "py", "img", "none").requiring_approval();
        def.trusted = true;
        assert!(def.needs_approval("run_python"));
    }

    #[test]
    fn test_required_str() {
        let params = serde_json::json!({"name": "x", "n": 3});
        assert_eq!(required_str(&params, "name").unwrap(), "x");
        let err = required_str(&params, "n").unwrap_err();
        assert_eq!(err.to_string(), "Missing required parameter: n");
        assert!(required_str(&params, "missing").is_err());
    }
}
