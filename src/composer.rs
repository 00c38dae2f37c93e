//! Answer Composer
//!
//! Picks the scenario template, gathers exactly the fields that scenario
//! needs, asks the model for the wording and, for data answers, appends the
//! key-assumptions block.
//!
//! | Scenario        | Fields beyond question and history          |
//! |-----------------|---------------------------------------------|
//! | DirectData      | insights, transparency notes, follow-ups    |
//! | Conversational  | follow-ups                                  |
//! | DataUnavailable | unavailability details, follow-ups          |
//! | Ambiguous       | ambiguity explanation, follow-ups (options) |

use crate::config::EngineConfig;
use crate::error::OrchestrationError;
use crate::llm::{invoke_structured, FollowUps, LanguageModel, PromptKind, WordedAnswer};
use crate::models::{DataPath, QueryRecord, Scenario, TurnState};
use crate::Result;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

pub struct AnswerComposer<'a> {
    model: &'a dyn LanguageModel,
    config: &'a EngineConfig,
}

impl<'a> AnswerComposer<'a> {
    pub fn new(model: &'a dyn LanguageModel, config: &'a EngineConfig) -> Self {
        Self { model, config }
    }

    pub async fn compose(&self, state: &mut TurnState, schema_context: &str) -> Result<String> {
        if state.scenario == Scenario::Undetermined {
            return Err(OrchestrationError::UndeterminedScenario);
        }

        if !state.scenario.is_ambiguous() {
            state.follow_ups = self.suggest_follow_ups(state, schema_context).await?;
        }

        let fields = required_fields(state);
        debug!(
            scenario = %state.scenario,
            fields = ?fields.keys().collect::<Vec<_>>(),
            "Composing answer"
        );

        let worded: WordedAnswer = invoke_structured(
            self.model,
            PromptKind::AnswerWording,
            json!({
                "scenario": state.scenario,
                "template": template(state.scenario),
                "fields": fields,
            }),
        )
        .await?;

        let mut answer = worded.answer.trim().to_string();
        if matches!(state.scenario, Scenario::DirectData(_)) {
            answer.push_str(&key_assumptions_block(state.transparency_notes.as_slice()));
        }

        info!(scenario = %state.scenario, "Answer composed");
        Ok(answer)
    }

    async fn suggest_follow_ups(&self, state: &TurnState, schema_context: &str) -> Result<Vec<String>> {
        let mut params = json!({
            "question": state.question,
            "history": state.history.formatted(),
            "schema": schema_context,
            "scenario": state.scenario,
            "max_suggestions": self.config.max_follow_ups,
        });
        if matches!(state.scenario, Scenario::DirectData(_)) {
            params["insights"] = insights(&state.queries);
        }

        let suggested: FollowUps =
            invoke_structured(self.model, PromptKind::FollowUps, params).await?;

        Ok(suggested
            .suggestions
            .into_iter()
            .map(|s| s.question.trim().to_string())
            .filter(|q| !q.is_empty())
            .take(self.config.max_follow_ups)
            .collect())
    }
}

fn template(scenario: Scenario) -> &'static str {
    match scenario {
        Scenario::DirectData(DataPath::Direct) => {
            "Answer the question from the query insights and results. Mention any query that could not be run."
        }
        Scenario::DirectData(DataPath::Substituted) => {
            "Answer the question from the query insights and results. Say which business term was used in place of the one asked for."
        }
        Scenario::Conversational => {
            "Continue the conversation: reply to the pleasantry or answer from the conversation history. Offer the follow-ups."
        }
        Scenario::DataUnavailable(_) => {
            "Explain which information is not available using the details, and suggest the follow-ups as analyses the data does support."
        }
        Scenario::Ambiguous(_) => {
            "Acknowledge what makes the question ambiguous, present the options as possible interpretations and ask which one the user wants."
        }
        Scenario::Undetermined => "",
    }
}

/// Exactly the fields of the scenario's row, plus question and history
fn required_fields(state: &TurnState) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("question".into(), json!(state.question));
    fields.insert("history".into(), json!(state.history.formatted()));

    match state.scenario {
        Scenario::DirectData(_) => {
            fields.insert("insights".into(), insights(&state.queries));
            fields.insert(
                "transparency_notes".into(),
                json!(state.transparency_notes.as_slice()),
            );
            fields.insert("follow_ups".into(), json!(state.follow_ups));
        }
        Scenario::Conversational => {
            fields.insert("follow_ups".into(), json!(state.follow_ups));
        }
        Scenario::DataUnavailable(_) => {
            let details = state
                .term_resolution
                .unavailable_note()
                .or_else(|| state.route_note.clone())
                .unwrap_or_default();
            fields.insert("details".into(), json!(details));
            fields.insert("follow_ups".into(), json!(state.follow_ups));
        }
        Scenario::Ambiguous(_) => {
            fields.insert(
                "ambiguity_explanation".into(),
                json!(state.ambiguity_explanation.clone().unwrap_or_default()),
            );
            fields.insert("follow_ups".into(), json!(state.follow_ups));
        }
        Scenario::Undetermined => {}
    }

    fields
}

/// Per-query insight, raw result and status, in intent order
fn insights(queries: &[QueryRecord]) -> Value {
    Value::Array(
        queries
            .iter()
            .map(|q| {
                json!({
                    "intent": q.intent,
                    "status": q.status,
                    "insight": q.insight,
                    "result": q.result.as_ref().map(|r| r.render()),
                    "error": q.last_error,
                })
            })
            .collect(),
    )
}

/// Bulleted transparency notes; empty when there are none
pub fn key_assumptions_block(notes: &[String]) -> String {
    if notes.is_empty() {
        return String::new();
    }

    let bullets: Vec<String> = notes.iter().map(|n| format!("• {}", n)).collect();
    format!("\n\n**Key Assumptions:**\n{}", bullets.join("\n"))
}
