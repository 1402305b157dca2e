//! Skill registry: maps tool-function names to their owning skill.
//!
//! Lookups vastly outnumber changes, so the registry is copy-on-write:
//! readers clone an `Arc` to the current snapshot and never block on a
//! writer; writers build a new snapshot and swap it in. User-created
//! skills are the only entries added or removed after startup.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::bail;
use tracing::{debug, info};

use super::{Skill, SkillDefinition, UserSkillProxy, UserSkillRecord};
use crate::llm::ToolDefinition;

struct Entry {
    skill: Arc<dyn Skill>,
    definition: SkillDefinition,
    tools: Vec<ToolDefinition>,
}

#[derive(Default, Clone)]
struct Snapshot {
    /// Skill name → entry
    skills: HashMap<String, Arc<Entry>>,
    /// Function name → skill name
    functions: HashMap<String, String>,
}

/// A looked-up skill together with its current policy.
#[derive(Clone)]
pub struct ResolvedSkill {
    pub skill: Arc<dyn Skill>,
    pub definition: SkillDefinition,
}

pub struct SkillRegistry {
    current: RwLock<Arc<Snapshot>>,
    /// Interpreter image for user-created skills.
    user_skill_image: String,
}

impl SkillRegistry {
    pub fn new(user_skill_image: impl Into<String>) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            user_skill_image: user_skill_image.into(),
        }
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies `change` to a copy of the current snapshot and publishes it.
    /// The write lock serializes writers; readers keep the old snapshot.
    fn update<T>(&self, change: impl FnOnce(&mut Snapshot) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Snapshot::clone(&guard);
        let out = change(&mut next)?;
        *guard = Arc::new(next);
        Ok(out)
    }

    /// Registers a skill. Fails if the skill name or any of its function
    /// names is already taken, so a tool call never resolves to two skills.
    pub fn register(&self, skill: Arc<dyn Skill>, definition: SkillDefinition) -> anyhow::Result<()> {
        let name = definition.name.clone();
        let tools = skill.tool_definitions();
        self.update(|snap| {
            if snap.skills.contains_key(&name) {
                bail!("Skill already registered: {name}");
            }
            insert(snap, skill, definition, tools)
        })?;
        info!("Registered skill: {name}");
        Ok(())
    }

    /// Registers (or replaces) a user-created skill. A user skill can never
    /// shadow a builtin.
    pub fn register_user_skill(&self, record: &UserSkillRecord) -> anyhow::Result<()> {
        let proxy: Arc<dyn Skill> = Arc::new(UserSkillProxy::new(record.clone()));
        let definition = SkillDefinition::user_created(record, &self.user_skill_image);
        let tools = proxy.tool_definitions();
        let name = record.name.clone();

        self.update(|snap| {
            if let Some(existing) = snap.skills.get(&name) {
                if !existing.definition.user_created {
                    bail!("Name '{name}' belongs to a builtin skill");
                }
                remove(snap, &name);
            }
            insert(snap, proxy, definition, tools)
        })?;
        info!("Registered user skill: {name}");
        Ok(())
    }

    /// Removes a user-created skill. Builtins are never removed.
    pub fn unregister_user_skill(&self, name: &str) -> bool {
        self.update(|snap| {
            let is_user = snap
                .skills
                .get(name)
                .is_some_and(|e| e.definition.user_created);
            if is_user {
                remove(snap, name);
            }
            Ok(is_user)
        })
        .unwrap_or(false)
    }

    /// Flips the trust flag of a user-created skill.
    pub fn set_user_skill_trusted(&self, name: &str, trusted: bool) -> bool {
        self.update(|snap| {
            let Some(entry) = snap.skills.get(name).cloned() else {
                return Ok(false);
            };
            if !entry.definition.user_created {
                return Ok(false);
            }
            let mut definition = entry.definition.clone();
            definition.trusted = trusted;
            snap.skills.insert(
                name.to_string(),
                Arc::new(Entry {
                    skill: entry.skill.clone(),
                    definition,
                    tools: entry.tools.clone(),
                }),
            );
            Ok(true)
        })
        .unwrap_or(false)
    }

    /// Finds the skill owning a tool function.
    pub fn resolve(&self, function: &str) -> Option<ResolvedSkill> {
        let snap = self.snapshot();
        let entry = snap
            .functions
            .get(function)
            .and_then(|skill| snap.skills.get(skill))?;
        Some(ResolvedSkill {
            skill: entry.skill.clone(),
            definition: entry.definition.clone(),
        })
    }

    /// All tool definitions, sorted by function name.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let snap = self.snapshot();
        let mut tools: Vec<ToolDefinition> = snap
            .skills
            .values()
            .flat_map(|e| e.tools.iter().cloned())
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Number of registered skills.
    pub fn len(&self) -> usize {
        self.snapshot().skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn skill_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().skills.keys().cloned().collect();
        names.sort();
        names
    }
}

fn insert(
    snap: &mut Snapshot,
    skill: Arc<dyn Skill>,
    definition: SkillDefinition,
    tools: Vec<ToolDefinition>,
) -> anyhow::Result<()> {
    for tool in &tools {
        if let Some(owner) = snap.functions.get(tool.name()) {
            bail!("Function {} already provided by skill {owner}", tool.name());
        }
    }
    let name = definition.name.clone();
    for tool in &tools {
        snap.functions.insert(tool.name().to_string(), name.clone());
    }
    debug!("Skill {name} exposes {} function(s)", tools.len());
    snap.skills.insert(
        name,
        Arc::new(Entry {
            skill,
            definition,
            tools,
        }),
    );
    Ok(())
}

fn remove(snap: &mut Snapshot, name: &str) {
    snap.skills.remove(name);
    snap.functions.retain(|_, owner| owner != name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::builtin::datetime::DateTimeSkill;
    use crate::skills::SkillContext;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    fn registry() -> SkillRegistry {
        SkillRegistry::new("senti-python:latest")
    }

    fn record(name: &str) -> UserSkillRecord {
        UserSkillRecord {
            id: 1,
            user_id: 7,
            name: name.to_string(),
            description: "A user tool".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
            code: "def run(args):\n    return 'ok'".to_string(),
            trusted: false,
            enabled: true,
        }
    }

    /// Exposes a function name that collides with the datetime builtin.
    struct Impostor;

    #[async_trait]
    impl Skill for Impostor {
        fn name(&self) -> &str {
            "impostor"
        }

        fn tool_definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition::function("get_current_datetime", "fake", json!({}))]
        }

        async fn execute(&self, _: &str, _: Value, _: &SkillContext) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let reg = registry();
        reg.register(Arc::new(DateTimeSkill), DateTimeSkill::definition())
            .unwrap();

        let resolved = reg.resolve("get_current_datetime").unwrap();
        assert_eq!(resolved.skill.name(), "datetime");
        assert_eq!(resolved.definition.name, "datetime");
        assert!(reg.resolve("foo_bar").is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_duplicate_skill_rejected() {
        let reg = registry();
        reg.register(Arc::new(DateTimeSkill), DateTimeSkill::definition())
            .unwrap();
        assert!(reg
            .register(Arc::new(DateTimeSkill), DateTimeSkill::definition())
            .is_err());
    }

    #[test]
    fn test_function_collision_rejected() {
        let reg = registry();
        reg.register(Arc::new(DateTimeSkill), DateTimeSkill::definition())
            .unwrap();
        let err = reg
            .register(Arc::new(Impostor), SkillDefinition::in_process("impostor", "x"))
            .unwrap_err();
        assert!(err.to_string().contains("already provided by skill datetime"));
        assert_eq!(reg.resolve("get_current_datetime").unwrap().skill.name(), "datetime");
    }

    #[test]
    fn test_user_skill_lifecycle() {
        let reg = registry();
        reg.register_user_skill(&record("word_count")).unwrap();

        let resolved = reg.resolve("word_count").unwrap();
        assert!(resolved.definition.user_created);
        assert!(resolved.definition.sandboxed);
        assert_eq!(resolved.definition.sandbox_image, "senti-python:latest");
        assert!(!resolved.definition.trusted);

        assert!(reg.set_user_skill_trusted("word_count", true));
        assert!(reg.resolve("word_count").unwrap().definition.trusted);

        assert!(reg.unregister_user_skill("word_count"));
        assert!(reg.resolve("word_count").is_none());
        assert!(!reg.unregister_user_skill("word_count"));
    }

    #[test]
    fn test_user_skill_cannot_shadow_builtin() {
        let reg = registry();
        reg.register(Arc::new(DateTimeSkill), DateTimeSkill::definition())
            .unwrap();
        assert!(reg.register_user_skill(&record("datetime")).is_err());
        assert!(reg.register_user_skill(&record("get_current_datetime")).is_err());
        assert!(!reg.unregister_user_skill("datetime"));
        assert!(!reg.set_user_skill_trusted("datetime", true));
    }

    #[test]
    fn test_user_skill_reregistration_replaces() {
        let reg = registry();
        reg.register_user_skill(&record("word_count")).unwrap();
        let mut updated = record("word_count");
        updated.code = "def run(args):\n    return 'v2'".to_string();
        reg.register_user_skill(&updated).unwrap();

        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.resolve("word_count").unwrap().definition.code.as_deref(),
            Some("def run(args):\n    return 'v2'")
        );
    }

    #[test]
    fn test_tool_definitions_sorted() {
        let reg = registry();
        reg.register_user_skill(&record("zeta_tool")).unwrap();
        reg.register(Arc::new(DateTimeSkill), DateTimeSkill::definition())
            .unwrap();
        reg.register_user_skill(&record("alpha_tool")).unwrap();

        let names: Vec<String> = reg
            .tool_definitions()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["alpha_tool", "get_current_datetime", "zeta_tool"]);
    }

    #[test]
    fn test_snapshot_survives_concurrent_change() {
        let reg = registry();
        reg.register_user_skill(&record("word_count")).unwrap();
        let resolved = reg.resolve("word_count").unwrap();

        reg.unregister_user_skill("word_count");

        // A lookup taken before removal keeps working.
        assert_eq!(resolved.skill.name(), "word_count");
        assert!(reg.is_empty());
    }

    #[test]
    fn test_concurrent_lookups_and_mutations() {
        let reg = Arc::new(registry());
        reg.register(Arc::new(DateTimeSkill), DateTimeSkill::definition())
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    let name = format!("tool_{i}");
                    for _ in 0..50 {
                        reg.register_user_skill(&record(&name)).unwrap();
                        assert!(reg.resolve("get_current_datetime").is_some());
                        reg.unregister_user_skill(&name);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.skill_names(), vec!["datetime"]);
    }
}
