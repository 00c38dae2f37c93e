//! Memory Manager
//!
//! Keeps the rolling conversation history inside its token budget. Runs once
//! at the very end of a turn: when both watermarks are crossed, everything
//! except the most recent entries is replaced by a single summary.

pub mod context_manager;
pub mod store;
pub mod summarizer;

pub use context_manager::{ContextConfig, ContextManager};
pub use store::{ConversationHistory, EntryContent, HistoryEntry};
pub use summarizer::ContextSummarizer;

use crate::llm::LanguageModel;
use tracing::{info, warn};

pub struct MemoryManager {
    context_manager: ContextManager,
}

impl MemoryManager {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            context_manager: ContextManager::with_config(config),
        }
    }

    /// Compact `history` in place when needed. Returns whether it was compacted.
    ///
    /// A failed summary leaves the history untouched; the turn's answer is
    /// already produced and compaction is retried on the next turn.
    pub async fn compact(&self, model: &dyn LanguageModel, history: &mut ConversationHistory) -> bool {
        if !self.context_manager.should_compact(history) {
            return false;
        }

        let archived = self.context_manager.entries_to_archive(history);
        match ContextSummarizer::summarize(model, &archived).await {
            Ok(summary) => {
                let keep = self.context_manager.config().preserve_recent_count;
                history.replace_older_with(summary, keep);
                info!(
                    archived = archived.len(),
                    tokens = history.total_tokens(),
                    "History compacted"
                );
                true
            }
            Err(e) => {
                warn!("Failed to summarize history: {}. Continuing without compaction", e);
                false
            }
        }
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}
