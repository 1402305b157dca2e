use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::Config;
use crate::llm::ToolDefinition;
use crate::skills::{Skill, SkillContext, SkillDefinition};

/// Network allowed for the search container.
pub const SEARCH_NETWORK: &str = "senti_search_net";

/// Web search through the Brave API, run in a container that only has
/// the search network and the API key.
pub struct WebSearchSkill;

impl WebSearchSkill {
    pub fn definition(config: &Config) -> SkillDefinition {
        SkillDefinition::sandboxed(
            "web_search",
            "Web search",
            &config.sandbox.search_image,
            SEARCH_NETWORK,
        )
        .with_secrets(&["BRAVE_API_KEY"])
    }
}

#[async_trait]
impl Skill for WebSearchSkill {
    fn name(&self) -> &str {
        "web_search"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::function(
            "web_search",
            "Search the web for current information. Returns titles, URLs and snippets \
             of the top results.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The search query"},
                    "count": {"type": "integer", "description": "Number of results (1-10, default 5)"}
                },
                "required": ["query"]
            }),
        )]
    }

    async fn execute(
        &self,
        _function: &str,
        _params: Value,
        _context: &SkillContext,
    ) -> anyhow::Result<String> {
        Ok("Web search requires the sandbox container. \
            Please ensure the container engine is available."
            .to_string())
    }
}
