use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::memory::{NewFact, DEFAULT_IMPORTANCE};
use crate::llm::ToolDefinition;
use crate::skills::{required_str, Skill, SkillContext, SkillDefinition};

/// Skill that stores and recalls long-term facts about the user.
///
/// The LLM calls these tools to persist preferences, personal details or
/// project context, and to look them up in later conversations. Storage
/// is per user; there is no cross-user leakage.
pub struct MemorySkill;

impl MemorySkill {
    pub fn definition() -> SkillDefinition {
        SkillDefinition::in_process("memory", "Long-term memory about the user")
    }
}

#[async_trait]
impl Skill for MemorySkill {
    fn name(&self) -> &str {
        "memory"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                "save_memory",
                "Save an important fact about the user for later. Use this for preferences, \
                 personal details, ongoing projects, or corrections to your behaviour.",
                json!({
                    "type": "object",
                    "properties": {
                        "title": {"type": "string", "description": "Short title, e.g. 'Timezone'"},
                        "content": {"type": "string", "description": "The fact itself"},
                        "category": {
                            "type": "string",
                            "description": "e.g. 'preferences', 'personal', 'work' (default 'general')"
                        },
                        "importance": {"type": "integer", "description": "1-10 (default 5)"}
                    },
                    "required": ["title", "content"]
                }),
            ),
            ToolDefinition::function(
                "search_memories",
                "Search saved memories by keywords.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Keywords to look for"},
                        "category": {"type": "string", "description": "Optional category filter"}
                    },
                    "required": ["query"]
                }),
            ),
            ToolDefinition::function(
                "list_memories",
                "List all saved memories, grouped by category.",
                json!({
                    "type": "object",
                    "properties": {
                        "category": {"type": "string", "description": "Optional category filter"}
                    }
                }),
            ),
            ToolDefinition::function(
                "delete_memory",
                "Delete a saved memory by ID.",
                json!({
                    "type": "object",
                    "properties": {
                        "memory_id": {"type": "integer", "description": "ID of the memory to delete"}
                    },
                    "required": ["memory_id"]
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
        let Some(facts) = &context.facts else {
            return Ok("Memory store not available.".to_string());
        };
        let user_id = context.user_id;
        let category = params["category"].as_str().filter(|c| !c.is_empty());

        match function {
            "save_memory" => {
                let title = required_str(&params, "title")?;
                let content = required_str(&params, "content")?;
                let importance = params["importance"]
                    .as_i64()
                    .unwrap_or(DEFAULT_IMPORTANCE as i64);
                let mut fact = NewFact::new(title, content, "tool").importance(importance);
                if let Some(category) = category {
                    fact = fact.category(category);
                }
                let saved = facts.save(user_id, fact).await?;
                Ok(format!(
                    "Saved memory #{}: {} [{}]",
                    saved.id, saved.title, saved.category
                ))
            }
            "search_memories" => {
                let query = required_str(&params, "query")?;
                let found = facts.search(user_id, query, category).await?;
                if found.is_empty() {
                    return Ok("No memories found matching that query.".to_string());
                }
                Ok(found
                    .iter()
                    .map(|m| format!("- #{} [{}] {}: {}", m.id, m.category, m.title, m.content))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "list_memories" => {
                let listed = facts.list(user_id, category).await?;
                if listed.is_empty() {
                    return Ok("No memories stored.".to_string());
                }
                let mut lines = Vec::new();
                let mut current: Option<&str> = None;
                for m in &listed {
                    if current != Some(m.category.as_str()) {
                        current = Some(m.category.as_str());
                        lines.push(format!("[{}]", m.category));
                    }
                    lines.push(format!("  #{}: {} (importance: {})", m.id, m.title, m.importance));
                }
                Ok(lines.join("\n"))
            }
            "delete_memory" => {
                let id = params["memory_id"]
                    .as_u64()
                    .ok_or_else(|| anyhow::anyhow!("Missing required parameter: memory_id"))?;
                if facts.delete(user_id, id).await? {
                    Ok(format!("Deleted memory #{id}."))
                } else {
                    Ok("Memory not found.".to_string())
                }
            }
            other => Ok(format!("Unknown function: {other}")),
        }
    }
}
