//! Context summarization
//!
//! Distills archived history entries into one summary entry through the
//! language-model collaborator.

use crate::error::OrchestrationError;
use crate::llm::{invoke_structured, HistorySummary, LanguageModel, PromptKind};
use crate::memory::store::{format_entries, HistoryEntry};
use serde_json::json;
use tracing::info;

pub struct ContextSummarizer;

impl ContextSummarizer {
    pub async fn summarize(
        model: &dyn LanguageModel,
        entries: &[HistoryEntry],
    ) -> crate::Result<HistoryEntry> {
        if entries.is_empty() {
            return Err(OrchestrationError::MalformedOutput(
                "Cannot summarize empty history".to_string(),
            ));
        }

        let conversation = format_entries(entries.iter());
        info!(entries = entries.len(), "Summarizing conversation history");

        let summary: HistorySummary = invoke_structured(
            model,
            PromptKind::HistorySummary,
            json!({
                "conversation": conversation,
                "max_tokens": 400,
            }),
        )
        .await?;

        Ok(HistoryEntry::summary(summary.summary))
    }
}
