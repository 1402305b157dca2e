//! Short-term conversation history.
//!
//! Only plain user/assistant turns are kept; tool traffic stays inside the
//! message that produced it.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::Message;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The last `limit` turns for `user_id`, oldest first.
    async fn history(&self, user_id: i64, limit: usize) -> anyhow::Result<Vec<Message>>;

    async fn append(&self, user_id: i64, messages: Vec<Message>) -> anyhow::Result<()>;

    async fn clear(&self, user_id: i64) -> anyhow::Result<()>;

    async fn message_count(&self, user_id: i64) -> anyhow::Result<usize>;
}

/// In-memory store that keeps at most `window` turns per user.
pub struct InMemoryConversationStore {
    window: usize,
    turns: Mutex<HashMap<i64, Vec<Message>>>,
}

impl InMemoryConversationStore {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            turns: Mutex::new(HashMap::new()),
        }
    }

    fn turns(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Vec<Message>>> {
        self.turns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn history(&self, user_id: i64, limit: usize) -> anyhow::Result<Vec<Message>> {
        let turns = self.turns();
        let Some(list) = turns.get(&user_id) else {
            return Ok(Vec::new());
        };
        let start = list.len().saturating_sub(limit);
        Ok(list[start..].to_vec())
    }

    async fn append(&self, user_id: i64, messages: Vec<Message>) -> anyhow::Result<()> {
        let mut turns = self.turns();
        let list = turns.entry(user_id).or_default();
        list.extend(messages);
        if list.len() > self.window {
            let excess = list.len() - self.window;
            list.drain(..excess);
        }
        Ok(())
    }

    async fn clear(&self, user_id: i64) -> anyhow::Result<()> {
        self.turns().remove(&user_id);
        Ok(())
    }

    async fn message_count(&self, user_id: i64) -> anyhow::Result<usize> {
        Ok(self.turns().get(&user_id).map_or(0, Vec::len))
    }
}
