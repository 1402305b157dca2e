use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::llm::ToolDefinition;
use crate::skills::{required_str, Skill, SkillContext, SkillDefinition};

/// One week.
pub const MAX_DELAY_MINUTES: i64 = 10_080;

/// One-shot reminders delivered through the injected notifier.
pub struct ReminderSkill;

impl ReminderSkill {
    pub fn definition() -> SkillDefinition {
        SkillDefinition::in_process("reminder", "One-shot reminders")
    }
}

#[async_trait]
impl Skill for ReminderSkill {
    fn name(&self) -> &str {
        "reminder"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::function(
            "schedule_reminder",
            "Send the user a reminder message after a delay.",
            json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "What to remind the user about"},
                    "delay_minutes": {
                        "type": "integer",
                        "description": "Minutes from now (1-10080)"
                    }
                },
                "required": ["message", "delay_minutes"]
            }),
        )]
    }

    async fn execute(
        &self,
        _function: &str,
        params: Value,
        context: &SkillContext,
    ) -> anyhow::Result<String> {
        let Some(notifier) = context.notifier.clone() else {
            return Ok("Reminders not available.".to_string());
        };
        let message = required_str(&params, "message")?.trim().to_string();
        if message.is_empty() {
            return Ok("Reminder message is empty.".to_string());
        }
        let minutes = params["delay_minutes"].as_i64().unwrap_or(0);
        if !(1..=MAX_DELAY_MINUTES).contains(&minutes) {
            return Ok(format!(
                "Delay must be between 1 and {MAX_DELAY_MINUTES} minutes."
            ));
        }

        let chat_id = context.chat_id;
        let delay = Duration::from_secs(minutes as u64 * 60);
        let text = format!("Reminder: {message}");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match notifier.send(chat_id, &text).await {
                Ok(()) => debug!("Reminder delivered to chat {chat_id}"),
                Err(e) => warn!("Reminder for chat {chat_id} not delivered: {e}"),
            }
        });

        Ok(format!("Reminder set for {minutes} minute(s) from now."))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::gateway::testing::RecordingNotifier;
    use crate::skills::SkillRegistry;

    fn context(notifier: Option<Arc<RecordingNotifier>>) -> SkillContext {
        SkillContext {
            user_id: 3,
            chat_id: 42,
            facts: None,
            notifier: notifier.map(|n| n as Arc<dyn crate::gateway::Notifier>),
            user_skills: None,
            registry: Arc::new(SkillRegistry::new("senti-python:latest")),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reminder_fires_after_delay() {
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = context(Some(notifier.clone()));

        let out = ReminderSkill
            .execute(
                "schedule_reminder",
                json!({"message": "stretch", "delay_minutes": 5}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out, "Reminder set for 5 minute(s) from now.");

        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        assert!(notifier.messages().is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(notifier.messages(), vec![(42, "Reminder: stretch".to_string())]);
    }

    #[tokio::test]
    async fn test_delay_bounds() {
        let ctx = context(Some(Arc::new(RecordingNotifier::default())));
        for minutes in [0, MAX_DELAY_MINUTES + 1] {
            let out = ReminderSkill
                .execute(
                    "schedule_reminder",
                    json!({"message": "x", "delay_minutes": minutes}),
                    &ctx,
                )
                .await
                .unwrap();
            assert_eq!(out, "Delay must be between 1 and 10080 minutes.");
        }
    }

    #[tokio::test]
    async fn test_without_notifier() {
        let out = ReminderSkill
            .execute(
                "schedule_reminder",
                json!({"message": "x", "delay_minutes": 1}),
                &context(None),
            )
            .await
            .unwrap();
        assert_eq!(out, "Reminders not available.");
    }
}
