//! Core data models for a conversational turn

use crate::error::OrchestrationError;
use crate::glossary::TermResolution;
use crate::memory::ConversationHistory;
use crate::sql::QueryRows;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

//
// ================= Phase =================
//

/// Turn progress marker. Strictly monotonic within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Started,
    IntentResolved,
    QueriesExecuted,
    Answered,
}

impl Phase {
    /// Move forward to `to`; any backward or repeated transition is rejected
    pub fn advance(&mut self, to: Phase) -> crate::Result<()> {
        if to <= *self {
            return Err(OrchestrationError::InvalidPhaseTransition {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Started => "Started",
            Phase::IntentResolved => "IntentResolved",
            Phase::QueriesExecuted => "QueriesExecuted",
            Phase::Answered => "Answered",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Scenario =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataPath {
    Direct,
    /// A glossary substitution changed the executed question
    Substituted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnavailableReason {
    /// The requested key term exists but has no available substitute
    Exhausted,
    /// The schema cannot answer the question at all
    NotInSchema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AmbiguitySource {
    ModelDetected,
    TermDetected,
}

/// Response mode of a turn. Starts `Undetermined`, never absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scenario {
    #[default]
    Undetermined,
    DirectData(DataPath),
    Conversational,
    DataUnavailable(UnavailableReason),
    Ambiguous(AmbiguitySource),
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Undetermined => "Undetermined",
            Scenario::DirectData(DataPath::Direct) => "DirectData",
            Scenario::DirectData(DataPath::Substituted) => "DirectData.Substituted",
            Scenario::Conversational => "Conversational",
            Scenario::DataUnavailable(UnavailableReason::Exhausted) => "DataUnavailable.Exhausted",
            Scenario::DataUnavailable(UnavailableReason::NotInSchema) => "DataUnavailable",
            Scenario::Ambiguous(AmbiguitySource::ModelDetected) => "Ambiguous.ModelDetected",
            Scenario::Ambiguous(AmbiguitySource::TermDetected) => "Ambiguous.TermDetected",
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Scenario::Ambiguous(_))
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Scenario {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

//
// ================= Queries =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Pending,
    Succeeded,
    Failed,
    Degraded,
}

/// One intent's query through synthesis, execution and insight
#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub intent: String,
    pub text: String,
    pub status: QueryStatus,
    pub result: Option<QueryRows>,
    pub insight: Option<String>,
    /// Corrected re-executions, across all cycles
    pub correction_attempts: u32,
    pub refinement_attempts: u32,
    pub last_error: Option<String>,
    /// Highlights, filters and date ranges for this query
    pub notes: Vec<String>,
}

impl QueryRecord {
    pub fn pending(intent: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            text: text.into(),
            status: QueryStatus::Pending,
            result: None,
            insight: None,
            correction_attempts: 0,
            refinement_attempts: 0,
            last_error: None,
            notes: Vec::new(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self.status, QueryStatus::Succeeded | QueryStatus::Degraded)
    }
}

//
// ================= Transparency =================
//

/// Append-only, de-duplicated in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransparencyNotes(Vec<String>);

impl TransparencyNotes {
    pub fn push(&mut self, note: impl Into<String>) {
        let note = note.into();
        let trimmed = note.trim();
        if trimmed.is_empty() || self.0.iter().any(|n| n == trimmed) {
            return;
        }
        self.0.push(trimmed.to_string());
    }

    pub fn extend<I, S>(&mut self, notes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for note in notes {
            self.push(note);
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }
}

//
// ================= Turn State =================
//

/// Everything one turn reads and writes. Created per turn, never shared.
#[derive(Debug, Clone)]
pub struct TurnState {
    pub question: String,
    pub history: ConversationHistory,
    pub phase: Phase,
    pub scenario: Scenario,
    pub intents: Vec<String>,
    pub queries: Vec<QueryRecord>,
    pub transparency_notes: TransparencyNotes,
    pub follow_ups: Vec<String>,
    pub ambiguity_explanation: Option<String>,
    pub term_resolution: TermResolution,
    /// Alternative-analysis suggestion from routing
    pub route_note: Option<String>,
}

impl TurnState {
    pub fn new(question: impl Into<String>, history: ConversationHistory) -> Self {
        Self {
            question: question.into(),
            history,
            phase: Phase::Started,
            scenario: Scenario::Undetermined,
            intents: Vec::new(),
            queries: Vec::new(),
            transparency_notes: TransparencyNotes::default(),
            follow_ups: Vec::new(),
            ambiguity_explanation: None,
            term_resolution: TermResolution::empty(),
            route_note: None,
        }
    }
}

//
// ================= Turn Output =================
//

/// What the UI boundary receives
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutput {
    pub scenario: Scenario,
    pub answer: String,
    pub transparency_notes: Vec<String>,
    pub follow_ups: Vec<String>,
    /// The turn was abandoned after a collaborator failure
    pub aborted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_is_monotonic() {
        let mut phase = Phase::Started;
        assert!(phase.advance(Phase::IntentResolved).is_ok());
        assert!(phase.advance(Phase::Answered).is_ok());

        let err = phase.advance(Phase::QueriesExecuted).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid phase transition: Answered -> QueriesExecuted"
        );
        assert!(phase.advance(Phase::Answered).is_err());
        assert_eq!(phase, Phase::Answered);
    }

    #[test]
    fn test_scenario_defaults_to_undetermined() {
        assert_eq!(Scenario::default(), Scenario::Undetermined);
        assert_eq!(
            serde_json::to_value(Scenario::Ambiguous(AmbiguitySource::TermDetected)).unwrap(),
            "Ambiguous.TermDetected"
        );
    }

    #[test]
    fn test_transparency_notes_dedup_in_first_seen_order() {
        let mut notes = TransparencyNotes::default();
        notes.extend(["b", "a", "b", " a ", ""]);
        notes.push("c");
        assert_eq!(notes.as_slice(), &["b", "a", "c"]);
    }
}
