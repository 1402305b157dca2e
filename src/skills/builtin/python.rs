use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::Config;
use crate::llm::ToolDefinition;
use crate::sandbox::NETWORK_NONE;
use crate::skills::{Skill, SkillContext, SkillDefinition};

/// Arbitrary Python in the sandbox. Always asks for approval.
pub struct PythonSkill;

impl PythonSkill {
    pub fn definition(config: &Config) -> SkillDefinition {
        SkillDefinition::sandboxed(
            "python_runner",
            "Sandboxed Python execution",
            &config.sandbox.python_image,
            NETWORK_NONE,
        )
        .requiring_approval()
    }
}

#[async_trait]
impl Skill for PythonSkill {
    fn name(&self) -> &str {
        "python_runner"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::function(
            "run_python",
            "Execute Python code in a secure sandbox. Has numpy and pandas available. \
             Use print() to produce output. When the user uploads a file, it's available \
             at /data/upload/<filename>. No network access. Max 10K chars of code.",
            json!({
                "type": "object",
                "properties": {
                    "code": {"type": "string", "description": "Python code to execute"}
                },
                "required": ["code"]
            }),
        )]
    }

    async fn execute(
        &self,
        _function: &str,
        _params: Value,
        _context: &SkillContext,
    ) -> anyhow::Result<String> {
        Ok("Python execution requires the sandbox container. \
            Please ensure the container engine is available."
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_is_sandboxed_and_gated() {
        let mut config = Config::for_tests();
        config.sandbox.python_image = "my-python:3.12".into();

        let def = PythonSkill::definition(&config);
        assert!(def.sandboxed);
        assert_eq!(def.sandbox_image, "my-python:3.12");
        assert_eq!(def.network_mode, "none");
        assert!(def.needs_approval("run_python"));
        assert!(def.secret_keys.is_empty());
    }
}
