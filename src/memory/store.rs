//! Conversation history storage
//!
//! Ordered (question, answer) entries with token counts. A compacted
//! history starts with a single summary entry.

use crate::tokens::estimate_tokens;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryContent {
    Turn { question: String, answer: String },
    Summary { text: String },
}

/// A single entry in the conversation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub entry_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub content: EntryContent,
    /// Approximate token count for watermark checks
    pub token_count: usize,
}

impl HistoryEntry {
    pub fn turn(question: String, answer: String) -> Self {
        let token_count = estimate_tokens(&question) + estimate_tokens(&answer);

        Self {
            entry_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            content: EntryContent::Turn { question, answer },
            token_count,
        }
    }

    pub fn summary(text: String) -> Self {
        let token_count = estimate_tokens(&text);

        Self {
            entry_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            content: EntryContent::Summary { text },
            token_count,
        }
    }

    pub fn is_summary(&self) -> bool {
        matches!(self.content, EntryContent::Summary { .. })
    }
}

/// Conversation history of one session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationHistory {
    pub session_id: Uuid,
    entries: VecDeque<HistoryEntry>,
    total_tokens: usize,
}

impl ConversationHistory {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            entries: VecDeque::new(),
            total_tokens: 0,
        }
    }

    pub fn push_turn(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        self.push(HistoryEntry::turn(question.into(), answer.into()));
    }

    /// Append an entry loaded from persistent storage or built elsewhere
    pub fn push(&mut self, entry: HistoryEntry) {
        self.total_tokens += entry.token_count;
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    /// All entries except the `keep` most recent
    pub fn older_than(&self, keep: usize) -> Vec<HistoryEntry> {
        let cut = self.entries.len().saturating_sub(keep);
        self.entries.iter().take(cut).cloned().collect()
    }

    /// Replace everything but the `keep` most recent entries with `summary`
    pub fn replace_older_with(&mut self, summary: HistoryEntry, keep: usize) {
        while self.entries.len() > keep {
            self.entries.pop_front();
        }
        self.entries.push_front(summary);
        self.recompute_total_tokens();
    }

    /// Recompute token count (prevents drift)
    fn recompute_total_tokens(&mut self) {
        self.total_tokens = self.entries.iter().map(|e| e.token_count).sum();
    }

    /// History as prompt text
    pub fn formatted(&self) -> String {
        format_entries(self.entries.iter())
    }
}

pub fn format_entries<'a>(entries: impl Iterator<Item = &'a HistoryEntry>) -> String {
    let mut text = String::new();

    for entry in entries {
        match &entry.content {
            EntryContent::Turn { question, answer } => {
                text.push_str(&format!("User: {}\nAssistant: {}\n", question, answer));
            }
            EntryContent::Summary { text: summary } => {
                text.push_str(&format!("[Summary of earlier conversation] {}\n", summary));
            }
        }
    }

    text
}
