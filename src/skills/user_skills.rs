//! User-created skills: persistence seam and the registry proxy.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Skill, SkillContext};
use crate::llm::ToolDefinition;

/// Maximum number of skills a single user may create.
pub const MAX_SKILLS_PER_USER: usize = 50;

/// A stored user-created skill.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSkillRecord {
    pub id: u64,
    pub user_id: i64,
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool parameters
    pub parameters: Value,
    /// Python source defining `run(args)`
    pub code: String,
    pub trusted: bool,
    pub enabled: bool,
}

/// Persistence for user-created skills and their trust flag.
#[async_trait]
pub trait UserSkillStore: Send + Sync {
    /// Stores a new skill. Fails on a duplicate name for the same user or
    /// when the per-user limit is reached.
    async fn create(
        &self,
        user_id: i64,
        name: &str,
        description: &str,
        parameters: Value,
        code: &str,
    ) -> anyhow::Result<UserSkillRecord>;

    async fn get(&self, user_id: i64, name: &str) -> anyhow::Result<Option<UserSkillRecord>>;

    async fn list_for_user(&self, user_id: i64) -> anyhow::Result<Vec<UserSkillRecord>>;

    /// Every enabled skill, across users. Loaded into the registry at startup.
    async fn list_all_enabled(&self) -> anyhow::Result<Vec<UserSkillRecord>>;

    async fn delete(&self, user_id: i64, name: &str) -> anyhow::Result<bool>;

    async fn set_trusted(&self, user_id: i64, name: &str, trusted: bool) -> anyhow::Result<bool>;
}

/// Process-local [`UserSkillStore`].
#[derive(Default)]
pub struct InMemoryUserSkillStore {
    records: Mutex<Vec<UserSkillRecord>>,
}

impl InMemoryUserSkillStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Vec<UserSkillRecord>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl UserSkillStore for InMemoryUserSkillStore {
    async fn create(
        &self,
        user_id: i64,
        name: &str,
        description: &str,
        parameters: Value,
        code: &str,
    ) -> anyhow::Result<UserSkillRecord> {
        let mut records = self.records();
        let owned = records.iter().filter(|r| r.user_id == user_id).count();
        if owned >= MAX_SKILLS_PER_USER {
            anyhow::bail!("Skill limit reached ({MAX_SKILLS_PER_USER})");
        }
        if records.iter().any(|r| r.user_id == user_id && r.name == name) {
            anyhow::bail!("Skill '{name}' already exists");
        }

        let id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let record = UserSkillRecord {
            id,
            user_id,
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            code: code.to_string(),
            trusted: false,
            enabled: true,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn get(&self, user_id: i64, name: &str) -> anyhow::Result<Option<UserSkillRecord>> {
        Ok(self
            .records()
            .iter()
            .find(|r| r.user_id == user_id && r.name == name)
            .cloned())
    }

    async fn list_for_user(&self, user_id: i64) -> anyhow::Result<Vec<UserSkillRecord>> {
        Ok(self
            .records()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_all_enabled(&self) -> anyhow::Result<Vec<UserSkillRecord>> {
        Ok(self.records().iter().filter(|r| r.enabled).cloned().collect())
    }

    async fn delete(&self, user_id: i64, name: &str) -> anyhow::Result<bool> {
        let mut records = self.records();
        let before = records.len();
        records.retain(|r| !(r.user_id == user_id && r.name == name));
        Ok(records.len() != before)
    }

    async fn set_trusted(&self, user_id: i64, name: &str, trusted: bool) -> anyhow::Result<bool> {
        let mut records = self.records();
        match records
            .iter_mut()
            .find(|r| r.user_id == user_id && r.name == name)
        {
            Some(record) => {
                record.trusted = trusted;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Registry entry for a user-created skill.
///
/// Advertises the tool to the LLM; actual execution goes through the
/// sandbox, so `execute` is only reached when no sandbox is configured.
pub struct UserSkillProxy {
    record: UserSkillRecord,
}

impl UserSkillProxy {
    pub fn new(record: UserSkillRecord) -> Self {
        Self { record }
    }
}

#[async_trait]
impl Skill for UserSkillProxy {
    fn name(&self) -> &str {
        &self.record.name
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let parameters = match &self.record.parameters {
            Value::Object(map) if !map.is_empty() => self.record.parameters.clone(),
            _ => json!({"type": "object", "properties": {}}),
        };
        vec![ToolDefinition::function(
            &self.record.name,
            &self.record.description,
            parameters,
        )]
    }

    async fn execute(
        &self,
        _function: &str,
        _params: Value,
        _context: &SkillContext,
    ) -> anyhow::Result<String> {
        Ok("User skill execution requires the sandbox container. \
            Please ensure the container engine is available."
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Value {
        json!({"type": "object", "properties": {"text": {"type": "string"}}})
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryUserSkillStore::new();
        let rec = store
            .create(7, "word_count", "Count words", schema(), "def run(args): pass")
            .await
            .unwrap();
        assert_eq!(rec.id, 1);
        assert!(!rec.trusted);
        assert!(rec.enabled);

        let got = store.get(7, "word_count").await.unwrap().unwrap();
        assert_eq!(got, rec);
        assert!(store.get(8, "word_count").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_per_user() {
        let store = InMemoryUserSkillStore::new();
        store.create(7, "dup", "d", schema(), "def run(a): pass").await.unwrap();
        let err = store
            .create(7, "dup", "d", schema(), "def run(a): pass")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Skill 'dup' already exists");
        // Another user may reuse the name.
        store.create(8, "dup", "d", schema(), "def run(a): pass").await.unwrap();
    }

    #[tokio::test]
    async fn test_per_user_limit() {
        let store = InMemoryUserSkillStore::new();
        for i in 0..MAX_SKILLS_PER_USER {
            store
                .create(1, &format!("tool_{i}"), "t", schema(), "def run(a): pass")
                .await
                .unwrap();
        }
        let err = store
            .create(1, "one_more", "t", schema(), "def run(a): pass")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("limit reached"));
    }

    #[tokio::test]
    async fn test_trust_and_delete() {
        let store = InMemoryUserSkillStore::new();
        store.create(7, "tool_a", "t", schema(), "def run(a): pass").await.unwrap();

        assert!(store.set_trusted(7, "tool_a", true).await.unwrap());
        assert!(store.get(7, "tool_a").await.unwrap().unwrap().trusted);
        assert!(!store.set_trusted(8, "tool_a", true).await.unwrap());

        assert!(!store.delete(8, "tool_a").await.unwrap());
        assert!(store.delete(7, "tool_a").await.unwrap());
        assert!(store.list_for_user(7).await.unwrap().is_empty());
    }

    #[test]
    fn test_proxy_tool_definition() {
        let proxy = UserSkillProxy::new(UserSkillRecord {
            id: 1,
            user_id: 7,
            name: "word_count".to_string(),
            description: "Count words".to_string(),
            parameters: json!({}),
            code: String::new(),
            trusted: false,
            enabled: true,
        });
        let tools = proxy.tool_definitions();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "word_count");
        assert_eq!(tools[0].function.parameters["type"], "object");
    }
}
