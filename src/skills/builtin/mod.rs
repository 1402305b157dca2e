pub mod datetime;
pub mod memory;
pub mod python;
pub mod reminder;
pub mod search;
pub mod skillsmith;

use std::sync::Arc;

use anyhow::anyhow;
use tracing::info;

use crate::config::Config;
use crate::skills::{Skill, SkillDefinition, SkillRegistry};

pub use datetime::DateTimeSkill;
pub use memory::MemorySkill;
pub use python::PythonSkill;
pub use reminder::ReminderSkill;
pub use search::WebSearchSkill;
pub use skillsmith::SkillsmithSkill;

/// Ids accepted in `[skills] enabled`.
pub const BUILTIN_IDS: &[&str] = &[
    "datetime",
    "memory",
    "python_runner",
    "web_search",
    "skillsmith",
    "reminder",
];

fn entry<S: Skill + 'static>(skill: S, definition: SkillDefinition) -> (Arc<dyn Skill>, SkillDefinition) {
    let skill: Arc<dyn Skill> = Arc::new(skill);
    (skill, definition)
}

/// Builds the builtin registered under `id`, with its policy.
pub fn build(id: &str, config: &Config) -> Option<(Arc<dyn Skill>, SkillDefinition)> {
    let built = match id {
        "datetime" => entry(DateTimeSkill, DateTimeSkill::definition()),
        "memory" => entry(MemorySkill, MemorySkill::definition()),
        "python_runner" => entry(PythonSkill, PythonSkill::definition(config)),
        "web_search" => entry(WebSearchSkill, WebSearchSkill::definition(config)),
        "skillsmith" => entry(SkillsmithSkill, SkillsmithSkill::definition()),
        "reminder" => entry(ReminderSkill, ReminderSkill::definition()),
        _ => return None,
    };
    Some(built)
}

/// Registers the builtins listed in `config.skills.enabled`.
///
/// An unknown id is a configuration error.
pub fn register_enabled(registry: &SkillRegistry, config: &Config) -> anyhow::Result<()> {
    for id in &config.skills.enabled {
        let (skill, definition) = build(id, config)
            .ok_or_else(|| anyhow!("Unknown skill in [skills] enabled: {id}"))?;
        info!("Registering builtin skill: {id}");
        registry.register(skill, definition)?;
    }
    Ok(())
}
