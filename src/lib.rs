//! Data Agent Orchestrator
//!
//! Answers natural-language analytics questions over a relational database:
//! - Resolves business vocabulary against a glossary (deterministic, no model call)
//! - Turns the question into analytical intents and SQL
//! - Executes with bounded correction and refinement, never failing the whole turn
//! - Composes a scenario-specific answer with transparency notes and follow-ups
//! - Keeps a compacted per-session conversation history
//!
//! TURN PHASES:
//! STARTED → INTENT RESOLVED → QUERIES EXECUTED → ANSWERED

pub mod agent;
pub mod api;
pub mod classifier;
pub mod composer;
pub mod config;
pub mod error;
pub mod execution;
pub mod gemini;
pub mod glossary;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod models;
pub mod schema;
pub mod session;
pub mod sql;
pub mod tokens;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use agent::{TurnOrchestrator, TurnReply};
pub use classifier::{InteractionClassifier, InteractionType};
pub use models::*;
