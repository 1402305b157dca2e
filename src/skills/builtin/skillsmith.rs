//! Builtin skill: lets the user turn Python snippets into reusable tools.
//!
//! Created skills are stored through [`UserSkillStore`] and registered on
//! the fly; they always run in the sandbox and ask for approval until the
//! user trusts them.
//!
//! [`UserSkillStore`]: crate::skills::UserSkillStore

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

use crate::llm::ToolDefinition;
use crate::skills::{Skill, SkillContext, SkillDefinition};

pub const MAX_CODE_CHARS: usize = 10_000;

/// Function names a user skill may never take.
pub const RESERVED_NAMES: &[&str] = &[
    "run_python",
    "web_search",
    "web_fetch",
    "save_memory",
    "search_memories",
    "list_memories",
    "delete_memory",
    "get_current_datetime",
    "schedule_reminder",
    "create_skill",
    "list_user_skills",
    "delete_skill",
];

pub struct SkillsmithSkill;

// 2-40 chars of [a-z0-9_], starting with a letter. A pattern that fails to
// compile rejects every name.
static SKILL_NAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{1,39}$").ok());

fn is_valid_name(name: &str) -> bool {
    SKILL_NAME_RE.as_ref().is_some_and(|re| re.is_match(name))
}

impl SkillsmithSkill {
    pub fn definition() -> SkillDefinition {
        SkillDefinition::in_process("skillsmith", "Create and manage user-defined tools")
            .requiring_approval_for(&["create_skill"])
    }
}

/// Checks a proposed skill; returns the user-facing rejection reason.
pub fn validate(name: &str, code: &str) -> Result<(), String> {
    if !is_valid_name(name) {
        return Err(format!(
            "Invalid skill name '{name}'. Must be 2-40 chars, \
             lowercase letters/digits/underscores, starting with a letter."
        ));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(format!("Name '{name}' is reserved and cannot be used."));
    }
    if code.is_empty() {
        return Err("No code provided.".to_string());
    }
    let len = code.chars().count();
    if len > MAX_CODE_CHARS {
        return Err(format!("Code too long ({len} chars, max {MAX_CODE_CHARS})."));
    }
    if !code.contains("def run(") {
        return Err("Code must define a 'def run(' function.".to_string());
    }
    Ok(())
}

#[async_trait]
impl Skill for SkillsmithSkill {
    fn name(&self) -> &str {
        "skillsmith"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                "create_skill",
                "Create a reusable user-defined tool. The code must define a 'def run(args)' \
                 function that takes a dict of arguments and returns a string result. The tool \
                 will be executed in a secure Python sandbox with numpy and pandas available.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "Tool name: lowercase letters, digits, underscores. \
                                            2-40 chars, must start with a letter."
                        },
                        "description": {
                            "type": "string",
                            "description": "What this tool does (shown to the LLM)"
                        },
                        "parameters": {
                            "type": "object",
                            "description": "JSON Schema for the tool's parameters. \
                                            Must be an object with 'type': 'object' and 'properties'."
                        },
                        "code": {
                            "type": "string",
                            "description": "Python source code. Must define 'def run(args): ...' \
                                            that takes a dict and returns a string."
                        }
                    },
                    "required": ["name", "description", "code"]
                }),
            ),
            ToolDefinition::function(
                "list_user_skills",
                "List all user-created tools.",
                json!({"type": "object", "properties": {}}),
            ),
            ToolDefinition::function(
                "delete_skill",
                "Delete a user-created tool by name.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Name of the skill to delete"}
                    },
                    "required": ["name"]
                }),
            ),
        ]
    }

    async fn execute(
        &self,
        function: &str,
        params: Value,
        context: &SkillContext,
    ) -> anyhow::Result<String> {
        let Some(store) = &context.user_skills else {
            return Ok("Skill management not available.".to_string());
        };
        let user_id = context.user_id;
        let name = params["name"].as_str().unwrap_or_default().trim();

        match function {
            "create_skill" => {
                let description = params["description"].as_str().unwrap_or_default().trim();
                let code = params["code"].as_str().unwrap_or_default();
                let parameters = match &params["parameters"] {
                    Value::Object(_) => params["parameters"].clone(),
                    _ => json!({"type": "object", "properties": {}}),
                };

                if let Err(reason) = validate(name, code) {
                    return Ok(reason);
                }

                let record = match store
                    .create(user_id, name, description, parameters, code)
                    .await
                {
                    Ok(record) => record,
                    Err(e) => return Ok(e.to_string()),
                };

                if let Err(e) = context.registry.register_user_skill(&record) {
                    warn!("Could not register user skill {name}: {e}");
                    store.delete(user_id, name).await?;
                    return Ok(format!("Could not register skill '{name}': {e}"));
                }
                Ok(format!(
                    "Skill '{name}' created and registered. It will require approval on first use."
                ))
            }
            "list_user_skills" => {
                let skills = store.list_for_user(user_id).await?;
                if skills.is_empty() {
                    return Ok("No user-created skills.".to_string());
                }
                Ok(skills
                    .iter()
                    .map(|s| {
                        let trusted = if s.trusted { " (trusted)" } else { "" };
                        format!("- {}: {}{trusted}", s.name, s.description)
                    })
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "delete_skill" => {
                if name.is_empty() {
                    return Ok("Missing skill name.".to_string());
                }
                if !store.delete(user_id, name).await? {
                    return Ok(format!("Skill '{name}' not found or not owned by you."));
                }
                context.registry.unregister_user_skill(name);
                Ok(format!("Skill '{name}' deleted."))
            }
            other => Ok(format!("Unknown function: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::skills::{InMemoryUserSkillStore, SkillRegistry, UserSkillStore};

    const CODE: &str = "def run(args):\n    return str(len(args.get('text', '').split()))";

    fn context() -> (SkillContext, Arc<InMemoryUserSkillStore>) {
        let store = Arc::new(InMemoryUserSkillStore::new());
        let ctx = SkillContext {
            user_id: 7,
            chat_id: 7,
            facts: None,
            notifier: None,
            user_skills: Some(store.clone()),
            registry: Arc::new(SkillRegistry::new("senti-python:latest")),
        };
        (ctx, store)
    }

    #[test]
    fn test_name_validation() {
        assert!(validate("word_count", CODE).is_ok());
        assert!(validate("w", CODE).unwrap_err().starts_with("Invalid skill name"));
        assert!(validate("WordCount", CODE).is_err());
        assert!(validate("1abc", CODE).is_err());
        assert!(validate(&"a".repeat(41), CODE).is_err());
        assert!(validate(&"a".repeat(40), CODE).is_ok());
    }

    #[test]
    fn test_name_pattern_rejects_odd_characters() {
        assert!(is_valid_name("ab"));
        assert!(is_valid_name("a_1"));
        assert!(!is_valid_name("word-count"));
        assert!(!is_valid_name("wörd"));
        assert!(!is_valid_name("ab\n"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn test_reserved_names() {
        let err = validate("run_python", CODE).unwrap_err();
        assert_eq!(err, "Name 'run_python' is reserved and cannot be used.");
    }

    #[test]
    fn test_code_validation() {
        assert_eq!(validate("tool_a", "").unwrap_err(), "No code provided.");
        assert_eq!(
            validate("tool_a", "print(1)").unwrap_err(),
            "Code must define a 'def run(' function."
        );
        let long = format!("def run(args):\n    return 'x'\n#{}", "x".repeat(MAX_CODE_CHARS));
        assert!(validate("tool_a", &long).unwrap_err().starts_with("Code too long"));
    }

    #[test]
    fn test_only_create_needs_approval() {
        let def = SkillsmithSkill::definition();
        assert!(def.needs_approval("create_skill"));
        assert!(!def.needs_approval("list_user_skills"));
        assert!(!def.needs_approval("delete_skill"));
    }

    #[tokio::test]
    async fn test_create_registers_skill() {
        let (ctx, store) = context();
        let out = SkillsmithSkill
            .execute(
                "create_skill",
                json!({"name": "word_count", "description": "Count words", "code": CODE}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(
            out,
            "Skill 'word_count' created and registered. It will require approval on first use."
        );

        let resolved = ctx.registry.resolve("word_count").unwrap();
        assert!(resolved.definition.user_created);
        assert!(resolved.definition.needs_approval("word_count"));
        assert!(store.get(7, "word_count").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_create_stores_nothing() {
        let (ctx, store) = context();
        let out = SkillsmithSkill
            .execute(
                "create_skill",
                json!({"name": "Bad Name", "description": "x", "code": CODE}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.starts_with("Invalid skill name"));
        assert!(store.list_for_user(7).await.unwrap().is_empty());
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_create_reports_store_error() {
        let (ctx, _) = context();
        let args = json!({"name": "word_count", "description": "d", "code": CODE});
        SkillsmithSkill.execute("create_skill", args.clone(), &ctx).await.unwrap();
        let out = SkillsmithSkill.execute("create_skill", args, &ctx).await.unwrap();
        assert_eq!(out, "Skill 'word_count' already exists");
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (ctx, store) = context();
        SkillsmithSkill
            .execute(
                "create_skill",
                json!({"name": "word_count", "description": "Count words", "code": CODE}),
                &ctx,
            )
            .await
            .unwrap();
        store.set_trusted(7, "word_count", true).await.unwrap();

        let listed = SkillsmithSkill
            .execute("list_user_skills", json!({}), &ctx)
            .await
            .unwrap();
        assert_eq!(listed, "- word_count: Count words (trusted)");

        let deleted = SkillsmithSkill
            .execute("delete_skill", json!({"name": "word_count"}), &ctx)
            .await
            .unwrap();
        assert_eq!(deleted, "Skill 'word_count' deleted.");
        assert!(ctx.registry.resolve("word_count").is_none());

        let again = SkillsmithSkill
            .execute("delete_skill", json!({"name": "word_count"}), &ctx)
            .await
            .unwrap();
        assert_eq!(again, "Skill 'word_count' not found or not owned by you.");
    }

    #[tokio::test]
    async fn test_without_store() {
        let (mut ctx, _) = context();
        ctx.user_skills = None;
        let out = SkillsmithSkill
            .execute("list_user_skills", json!({}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, "Skill management not available.");
    }
}
