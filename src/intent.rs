//! Intent Resolver
//!
//! Turns the (possibly rewritten) question into analytical intents. A
//! term-detected ambiguity short-circuits to clarification and a glossary
//! substitution skips the model's clear/ambiguous check.

use crate::config::EngineConfig;
use crate::error::OrchestrationError;
use crate::llm::{
    invoke_structured, AmbiguityAnalysis, AnalyticalIntents, Clarity, ClarityVerdict, LanguageModel,
    PromptKind,
};
use crate::models::{AmbiguitySource, DataPath, Scenario, TurnState};
use crate::Result;
use serde_json::json;
use tracing::{debug, info};

/// Candidate questions surfaced for a model-detected ambiguity
const MAX_CANDIDATES: usize = 3;

pub struct IntentResolver<'a> {
    model: &'a dyn LanguageModel,
    config: &'a EngineConfig,
}

impl<'a> IntentResolver<'a> {
    pub fn new(model: &'a dyn LanguageModel, config: &'a EngineConfig) -> Self {
        Self { model, config }
    }

    /// Fill `intents`, `scenario` and, for ambiguity, the explanation and options
    pub async fn resolve(&self, state: &mut TurnState, schema_context: &str) -> Result<()> {
        if let Some((explanation, options)) = state.term_resolution.clarification() {
            info!(options = options.len(), "Term-detected ambiguity, skipping model checks");
            state.scenario = Scenario::Ambiguous(AmbiguitySource::TermDetected);
            state.ambiguity_explanation = Some(explanation);
            state.follow_ups = options;
            state.intents.clear();
            return Ok(());
        }

        let question = state
            .term_resolution
            .effective_question(&state.question)
            .to_string();
        let substituted = state.term_resolution.is_substituted();
        let params = json!({
            "question": question,
            "history": state.history.formatted(),
            "schema": format!("{}{}", schema_context, state.term_resolution.key_terms_context()),
        });

        let clarity = if substituted {
            debug!("Glossary substitution applied, skipping clarity check");
            Clarity::Clear
        } else {
            let verdict: ClarityVerdict =
                invoke_structured(self.model, PromptKind::Clarity, params.clone()).await?;
            verdict.clarity
        };

        match clarity {
            Clarity::Clear => {
                let generated: AnalyticalIntents =
                    invoke_structured(self.model, PromptKind::IntentGeneration, params).await?;
                let intents = clean(generated.intents, self.config.max_intents);
                if intents.is_empty() {
                    return Err(OrchestrationError::MalformedOutput(
                        "intent generation returned no intents".to_string(),
                    ));
                }

                info!(intents = intents.len(), "Analytical intents resolved");
                state.intents = intents;
                state.scenario = Scenario::DirectData(if substituted {
                    DataPath::Substituted
                } else {
                    DataPath::Direct
                });
            }
            Clarity::Ambiguous => {
                let analysis: AmbiguityAnalysis =
                    invoke_structured(self.model, PromptKind::AmbiguityAnalysis, params).await?;
                let candidates = clean(analysis.candidate_questions, MAX_CANDIDATES);
                if candidates.is_empty() {
                    return Err(OrchestrationError::MalformedOutput(
                        "ambiguity analysis returned no candidate questions".to_string(),
                    ));
                }

                info!(candidates = candidates.len(), "Model-detected ambiguity");
                state.scenario = Scenario::Ambiguous(AmbiguitySource::ModelDetected);
                state.ambiguity_explanation = Some(analysis.explanation);
                state.follow_ups = candidates.clone();
                state.intents = candidates;
            }
        }

        Ok(())
    }
}

/// Trimmed, non-empty, at most `limit`
fn clean(items: Vec<String>, limit: usize) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glossary::fixtures::sample_store;
    use crate::glossary::TermResolver;
    use crate::llm::ScriptedModel;
    use crate::memory::ConversationHistory;
    use uuid::Uuid;

    fn state_for(question: &str) -> TurnState {
        let store = sample_store();
        let mut state = TurnState::new(question, ConversationHistory::new(Uuid::new_v4()));
        state.term_resolution = TermResolver::new(&store, 0.85).resolve(question);
        state
    }

    #[tokio::test]
    async fn test_term_detected_ambiguity_makes_no_model_calls() {
        let model = ScriptedModel::new();
        let config = EngineConfig::default();
        let mut state = state_for("total payout by advisor");

        IntentResolver::new(&model, &config)
            .resolve(&mut state, "schema")
            .await
            .unwrap();

        assert_eq!(state.scenario, Scenario::Ambiguous(AmbiguitySource::TermDetected));
        assert_eq!(state.follow_ups.len(), 3);
        assert!(state.intents.is_empty());
        assert!(state.ambiguity_explanation.is_some());
        assert_eq!(model.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_substitution_skips_clarity_check() {
        let model = ScriptedModel::new().respond(
            PromptKind::IntentGeneration,
            json!({"intents": ["Total assets under management by region"]}),
        );
        let config = EngineConfig::default();
        let mut state = state_for("aum by region");

        IntentResolver::new(&model, &config)
            .resolve(&mut state, "schema")
            .await
            .unwrap();

        assert_eq!(model.calls(PromptKind::Clarity), 0);
        assert_eq!(state.scenario, Scenario::DirectData(DataPath::Substituted));
        assert_eq!(state.intents.len(), 1);

        let request = &model.requests_for(PromptKind::IntentGeneration)[0];
        assert!(request.params["question"]
            .as_str()
            .unwrap()
            .contains("Assets Under Management"));
        assert!(request.params["schema"].as_str().unwrap().contains("Key Terms:"));
    }

    #[tokio::test]
    async fn test_clear_question_generates_capped_intents() {
        let model = ScriptedModel::new()
            .respond(PromptKind::Clarity, json!({"clarity": "clear"}))
            .respond(
                PromptKind::IntentGeneration,
                json!({"intents": ["a", "b", " ", "c", "d", "e", "f"]}),
            );
        let config = EngineConfig::default();
        let mut state = state_for("explore net revenue");

        IntentResolver::new(&model, &config)
            .resolve(&mut state, "schema")
            .await
            .unwrap();

        assert_eq!(state.intents, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(state.scenario, Scenario::DirectData(DataPath::Direct));
    }

    #[tokio::test]
    async fn test_model_ambiguity_is_one_merged_call() {
        let model = ScriptedModel::new()
            .respond(PromptKind::Clarity, json!({"clarity": "ambiguous"}))
            .respond(
                PromptKind::AmbiguityAnalysis,
                json!({
                    "explanation": "\"Best\" could mean highest revenue or most households.",
                    "candidate_questions": [
                        "Which advisor has the highest net revenue?",
                        "Which advisor serves the most households?"
                    ]
                }),
            );
        let config = EngineConfig::default();
        let mut state = state_for("who is the best advisor");

        IntentResolver::new(&model, &config)
            .resolve(&mut state, "schema")
            .await
            .unwrap();

        assert_eq!(state.scenario, Scenario::Ambiguous(AmbiguitySource::ModelDetected));
        assert_eq!(state.follow_ups.len(), 2);
        assert_eq!(model.calls(PromptKind::AmbiguityAnalysis), 1);
        assert_eq!(model.calls(PromptKind::IntentGeneration), 0);
    }

    #[tokio::test]
    async fn test_empty_intents_are_malformed() {
        let model = ScriptedModel::new()
            .respond(PromptKind::Clarity, json!({"clarity": "clear"}))
            .respond(PromptKind::IntentGeneration, json!({"intents": []}));
        let config = EngineConfig::default();
        let mut state = state_for("net revenue");

        let result = IntentResolver::new(&model, &config)
            .resolve(&mut state, "schema")
            .await;
        assert!(matches!(result, Err(OrchestrationError::MalformedOutput(_))));
    }
}
