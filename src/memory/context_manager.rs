//! History watermarks
//!
//! Decides when the rolling history must be compacted and which entries
//! the summary replaces.

use crate::config::EngineConfig;
use crate::memory::store::{ConversationHistory, HistoryEntry};
use tracing::info;

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// High watermark
    pub token_watermark: usize,
    /// Low watermark: entries that are never summarized
    pub preserve_recent_count: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_watermark: 1000,
            preserve_recent_count: 4,
        }
    }
}

impl From<&EngineConfig> for ContextConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            token_watermark: config.history_token_watermark,
            preserve_recent_count: config.history_turns_kept,
        }
    }
}

pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new() -> Self {
        Self {
            config: ContextConfig::default(),
        }
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Both watermarks crossed
    pub fn should_compact(&self, history: &ConversationHistory) -> bool {
        let current_tokens = history.total_tokens();
        let should = current_tokens >= self.config.token_watermark
            && history.len() > self.config.preserve_recent_count;

        if should {
            info!(
                tokens = current_tokens,
                watermark = self.config.token_watermark,
                entries = history.len(),
                "History over watermark, compaction needed"
            );
        }

        should
    }

    /// Entries the summary will replace
    pub fn entries_to_archive(&self, history: &ConversationHistory) -> Vec<HistoryEntry> {
        history.older_than(self.config.preserve_recent_count)
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn history(turns: usize, answer_len: usize) -> ConversationHistory {
        let mut history = ConversationHistory::new(Uuid::new_v4());
        for i in 0..turns {
            history.push_turn(format!("Question {}", i), "x".repeat(answer_len));
        }
        history
    }

    #[test]
    fn test_compaction_needs_both_watermarks() {
        let manager = ContextManager::new();

        // many tokens, few entries
        assert!(!manager.should_compact(&history(4, 2000)));
        // many entries, few tokens
        assert!(!manager.should_compact(&history(10, 10)));
        // both
        assert!(manager.should_compact(&history(5, 1000)));
    }

    #[test]
    fn test_entries_to_archive_keeps_last_four() {
        let manager = ContextManager::new();
        let h = history(6, 10);
        let archived = manager.entries_to_archive(&h);
        assert_eq!(archived.len(), 2);
        assert_eq!(archived[0], *h.entries().next().unwrap());
    }

    #[test]
    fn test_config_from_engine_config() {
        let engine = EngineConfig {
            history_token_watermark: 50,
            history_turns_kept: 2,
            ..EngineConfig::default()
        };
        let manager = ContextManager::with_config(ContextConfig::from(&engine));
        assert!(manager.should_compact(&history(3, 100)));
    }
}
