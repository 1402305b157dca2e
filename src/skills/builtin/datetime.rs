use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::llm::ToolDefinition;
use crate::skills::{Skill, SkillContext, SkillDefinition};

/// Current date and time in UTC.
pub struct DateTimeSkill;

impl DateTimeSkill {
    pub fn definition() -> SkillDefinition {
        SkillDefinition::in_process("datetime", "Current date and time")
    }
}

fn format_now(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d %H:%M:%S UTC (%A)").to_string()
}

#[async_trait]
impl Skill for DateTimeSkill {
    fn name(&self) -> &str {
        "datetime"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::function(
            "get_current_datetime",
            "Get the current date and time in UTC.",
            json!({"type": "object", "properties": {}}),
        )]
    }

    async fn execute(
        &self,
        function: &str,
        _params: Value,
        _context: &SkillContext,
    ) -> anyhow::Result<String> {
        match function {
            "get_current_datetime" => Ok(format_now(Utc::now())),
            other => Ok(format!("Unknown function: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        assert_eq!(format_now(now), "2026-03-14 09:26:53 UTC (Saturday)");
    }

    #[test]
    fn test_single_tool() {
        let tools = DateTimeSkill.tool_definitions();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "get_current_datetime");
    }
}
