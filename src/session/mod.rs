//! Session persistence
//!
//! Conversation histories keyed by session id. A turn works on a copy of the
//! history and the store is written only once the turn has completed.

use crate::memory::ConversationHistory;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod postgres;
pub use postgres::PgSessionStore;

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// History of the session; empty for an unknown session
    async fn load(&self, session_id: Uuid) -> Result<ConversationHistory>;

    /// Replace the stored history of `history.session_id`
    async fn save(&self, history: &ConversationHistory) -> Result<()>;
}

/// In-memory session store for development and tests
pub struct InMemorySessionStore {
    histories: Arc<RwLock<HashMap<Uuid, ConversationHistory>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            histories: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: Uuid) -> Result<ConversationHistory> {
        let histories = self.histories.read().await;
        Ok(histories
            .get(&session_id)
            .cloned()
            .unwrap_or_else(|| ConversationHistory::new(session_id)))
    }

    async fn save(&self, history: &ConversationHistory) -> Result<()> {
        let mut histories = self.histories.write().await;
        histories.insert(history.session_id, history.clone());
        Ok(())
    }
}
