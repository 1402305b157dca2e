//! Long-term memory: facts the assistant keeps about each user.
//!
//! Facts are written by the `memory` skill (explicit requests) and by the
//! background extractor after each exchange. Storage is per user; one
//! user's facts are never visible to another.

use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub const DEFAULT_CATEGORY: &str = "general";
pub const DEFAULT_IMPORTANCE: u8 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub id: u64,
    pub user_id: i64,
    pub title: String,
    pub content: String,
    pub category: String,
    /// 1 (trivia) to 10 (critical)
    pub importance: u8,
    /// "tool" when saved on request, "auto" when extracted
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Fields of a fact about to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFact {
    pub title: String,
    pub content: String,
    pub category: String,
    pub importance: u8,
    pub source: String,
}

impl NewFact {
    pub fn new(title: impl Into<String>, content: impl Into<String>, source: &str) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            category: DEFAULT_CATEGORY.to_string(),
            importance: DEFAULT_IMPORTANCE,
            source: source.to_string(),
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Clamped to 1..=10.
    pub fn importance(mut self, importance: i64) -> Self {
        self.importance = importance.clamp(1, 10) as u8;
        self
    }
}

/// Per-user fact storage.
#[async_trait]
pub trait FactStore: Send + Sync {
    async fn save(&self, user_id: i64, fact: NewFact) -> Result<Fact>;

    /// Facts whose title or content contains every word of `query`
    /// (case-insensitive), most important first.
    async fn search(&self, user_id: i64, query: &str, category: Option<&str>) -> Result<Vec<Fact>>;

    /// All facts grouped by category, most important first within each.
    async fn list(&self, user_id: i64, category: Option<&str>) -> Result<Vec<Fact>>;

    async fn delete(&self, user_id: i64, id: u64) -> Result<bool>;

    async fn titles(&self, user_id: i64) -> Result<Vec<String>>;
}

#[derive(Default)]
pub struct InMemoryFactStore {
    facts: Mutex<Vec<Fact>>,
}

impl InMemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn facts(&self) -> std::sync::MutexGuard<'_, Vec<Fact>> {
        self.facts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owned(&self, user_id: i64, category: Option<&str>) -> Vec<Fact> {
        self.facts()
            .iter()
            .filter(|f| f.user_id == user_id)
            .filter(|f| category.map_or(true, |c| f.category.eq_ignore_ascii_case(c)))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn save(&self, user_id: i64, fact: NewFact) -> Result<Fact> {
        let mut facts = self.facts();
        let id = facts.iter().map(|f| f.id).max().unwrap_or(0) + 1;
        let stored = Fact {
            id,
            user_id,
            title: fact.title,
            content: fact.content,
            category: fact.category,
            importance: fact.importance,
            source: fact.source,
            created_at: Utc::now(),
        };
        facts.push(stored.clone());
        Ok(stored)
    }

    async fn search(&self, user_id: i64, query: &str, category: Option<&str>) -> Result<Vec<Fact>> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        let mut found: Vec<Fact> = self
            .owned(user_id, category)
            .into_iter()
            .filter(|f| {
                let haystack = format!("{} {}", f.title, f.content).to_lowercase();
                terms.iter().all(|t| haystack.contains(t.as_str()))
            })
            .collect();
        found.sort_by(|a, b| b.importance.cmp(&a.importance).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn list(&self, user_id: i64, category: Option<&str>) -> Result<Vec<Fact>> {
        let mut facts = self.owned(user_id, category);
        facts.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then(b.importance.cmp(&a.importance))
                .then(a.id.cmp(&b.id))
        });
        Ok(facts)
    }

    async fn delete(&self, user_id: i64, id: u64) -> Result<bool> {
        let mut facts = self.facts();
        let before = facts.len();
        facts.retain(|f| !(f.user_id == user_id && f.id == id));
        Ok(facts.len() != before)
    }

    async fn titles(&self, user_id: i64) -> Result<Vec<String>> {
        Ok(self
            .owned(user_id, None)
            .into_iter()
            .map(|f| f.title)
            .collect())
    }
}
