//! Error types for the data agent orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Collaborator Errors (abort the turn)
    // =============================

    #[error("Language model provider unavailable: {0}")]
    ProviderTransient(String),

    #[error("Malformed model output: {0}")]
    MalformedOutput(String),

    // =============================
    // Startup Errors
    // =============================

    #[error("Glossary inconsistent, missing key terms: {}", .0.join(", "))]
    GlossaryInconsistent(Vec<String>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Cannot compose an answer for an undetermined scenario")]
    UndeterminedScenario,

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Errors that abandon the current turn with an apology instead of an answer.
    pub fn aborts_turn(&self) -> bool {
        matches!(
            self,
            OrchestrationError::ProviderTransient(_)
                | OrchestrationError::MalformedOutput(_)
                | OrchestrationError::HttpError(_)
                | OrchestrationError::SerializationError(_)
                | OrchestrationError::InvalidPhaseTransition { .. }
                | OrchestrationError::UndeterminedScenario
        )
    }
}

/// Error raised by the SQL engine for a single statement.
///
/// Never escapes the execution loop: it is recorded on the query and fed to
/// the correction collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SqlExecutionError {
    pub message: String,
}

impl SqlExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glossary_error_lists_missing_terms() {
        let err = OrchestrationError::GlossaryInconsistent(vec![
            "payout".to_string(),
            "net revenue".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Glossary inconsistent, missing key terms: payout, net revenue"
        );
        assert!(!err.aborts_turn());
    }

    #[test]
    fn test_collaborator_errors_abort_turn() {
        assert!(OrchestrationError::ProviderTransient("503".into()).aborts_turn());
        assert!(OrchestrationError::MalformedOutput("missing field".into()).aborts_turn());
        assert!(!OrchestrationError::Config("PORT".into()).aborts_turn());
    }
}
