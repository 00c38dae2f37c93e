//! Language-model collaborator
//!
//! The core never sees prompt wording. It asks for a `PromptKind` with
//! structured parameters and receives JSON that must match the schema of
//! the expected output type. Anything else is `MalformedOutput`.

use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tracing::debug;

pub mod mock;
pub use mock::ScriptedModel;

/// Every model capability the turn pipeline uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Route,
    Clarity,
    IntentGeneration,
    AmbiguityAnalysis,
    SqlSynthesis,
    SqlCorrection,
    SqlRefinement,
    QueryInsight,
    FollowUps,
    AnswerWording,
    HistorySummary,
}

impl PromptKind {
    /// One-line task statement handed to the provider with the parameters
    pub fn instruction(&self) -> &'static str {
        match self {
            PromptKind::Route => "Decide whether the question is small talk or already answered in the history (conversational), asks for data the schema cannot provide (data_unavailable), or needs analysis (continue).",
            PromptKind::Clarity => "Decide whether the question has a single obvious analytical interpretation against the schema (clear) or several (ambiguous).",
            PromptKind::IntentGeneration => "Rewrite the question as analytical intents for a SQL developer: one intent normally, 3 to 5 when the question is exploratory.",
            PromptKind::AmbiguityAnalysis => "Explain briefly what makes the question ambiguous and list 2 to 3 alternative analytical intents phrased as questions.",
            PromptKind::SqlSynthesis => "Write one read-only SQL query in the given dialect answering the intent. Multi-step intents become one query with staged CTEs.",
            PromptKind::SqlCorrection => "Correct the failing SQL query using the error message and schema.",
            PromptKind::SqlRefinement => "Rewrite the SQL query so its result is smaller: aggregate instead of listing, coarsen grouping, bucket, filter, or add a top-N limit.",
            PromptKind::QueryInsight => "State the key finding of the query result in plain language and list 0 to 3 short highlights (filters applied, time range, row limit).",
            PromptKind::FollowUps => "Suggest at most 2 next questions from the taxonomy that the schema supports.",
            PromptKind::AnswerWording => "Write the reply to the user for the given scenario using only the provided fields.",
            PromptKind::HistorySummary => "Distill the conversation into one summary paragraph of at most 400 tokens keeping specific details.",
        }
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{}", s)
    }
}

/// One collaborator call
#[derive(Debug, Clone, Serialize)]
pub struct ModelRequest {
    pub kind: PromptKind,
    /// JSON schema the response must satisfy
    pub schema: Value,
    pub params: Value,
}

/// Opaque structured-output capability
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn invoke(&self, request: ModelRequest) -> Result<Value>;
}

/// Output type of a prompt kind
pub trait StructuredOutput: DeserializeOwned {
    fn schema() -> Value;
}

/// Invoke the model and decode the result into `T`
pub async fn invoke_structured<T: StructuredOutput>(
    model: &dyn LanguageModel,
    kind: PromptKind,
    params: Value,
) -> Result<T> {
    debug!(prompt = %kind, "Invoking language model");

    let request = ModelRequest {
        kind,
        schema: T::schema(),
        params,
    };
    let raw = model.invoke(request).await?;

    serde_json::from_value(raw).map_err(|e| {
        OrchestrationError::MalformedOutput(format!("{} response: {}", kind, e))
    })
}

//
// ================= Structured outputs =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStep {
    Conversational,
    DataUnavailable,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub next_step: RouteStep,
    /// Alternative-analysis suggestion when data is unavailable
    #[serde(default)]
    pub note: Option<String>,
}

impl StructuredOutput for RouteDecision {
    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "next_step": {"type": "string", "enum": ["conversational", "data_unavailable", "continue"]},
                "note": {"type": "string"}
            },
            "required": ["next_step"]
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clarity {
    Clear,
    Ambiguous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarityVerdict {
    pub clarity: Clarity,
}

impl StructuredOutput for ClarityVerdict {
    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"clarity": {"type": "string", "enum": ["clear", "ambiguous"]}},
            "required": ["clarity"]
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticalIntents {
    pub intents: Vec<String>,
}

impl StructuredOutput for AnalyticalIntents {
    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"intents": {"type": "array", "items": {"type": "string"}, "minItems": 1, "maxItems": 5}},
            "required": ["intents"]
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbiguityAnalysis {
    pub explanation: String,
    pub candidate_questions: Vec<String>,
}

impl StructuredOutput for AmbiguityAnalysis {
    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "explanation": {"type": "string"},
                "candidate_questions": {"type": "array", "items": {"type": "string"}, "minItems": 2, "maxItems": 3}
            },
            "required": ["explanation", "candidate_questions"]
        })
    }
}

/// Synthesized, corrected or refined SQL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlText {
    pub query: String,
}

impl StructuredOutput for SqlText {
    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryInsight {
    pub insight: String,
    #[serde(default)]
    pub highlights: Vec<String>,
}

impl StructuredOutput for QueryInsight {
    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "insight": {"type": "string"},
                "highlights": {"type": "array", "items": {"type": "string"}, "maxItems": 3}
            },
            "required": ["insight"]
        })
    }
}

/// Follow-up suggestion taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpKind {
    TrendOverTime,
    DrillDown,
    TopContributors,
    CauseExploration,
    GranularityChange,
    TimeFiltering,
    AttributeFiltering,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpSuggestion {
    pub kind: FollowUpKind,
    pub question: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUps {
    pub suggestions: Vec<FollowUpSuggestion>,
}

impl StructuredOutput for FollowUps {
    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "suggestions": {
                    "type": "array",
                    "maxItems": 2,
                    "items": {
                        "type": "object",
                        "properties": {
                            "kind": {"type": "string", "enum": [
                                "trend_over_time", "drill_down", "top_contributors", "cause_exploration",
                                "granularity_change", "time_filtering", "attribute_filtering"
                            ]},
                            "question": {"type": "string"}
                        },
                        "required": ["kind", "question"]
                    }
                }
            },
            "required": ["suggestions"]
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordedAnswer {
    pub answer: String,
}

impl StructuredOutput for WordedAnswer {
    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"answer": {"type": "string"}},
            "required": ["answer"]
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySummary {
    pub summary: String,
}

impl StructuredOutput for HistorySummary {
    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"summary": {"type": "string"}},
            "required": ["summary"]
        })
    }
}
