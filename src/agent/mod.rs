//! Turn Orchestrator
//!
//! One turn walks a fixed phase sequence:
//!
//! ```text
//! Started ──► IntentResolved ──► QueriesExecuted ──► Answered
//!    │               │                                  ▲
//!    └───────────────┴──────── (no queries needed) ─────┘
//! ```
//!
//! Each phase has one handler returning the next phase. Entering `Answered`
//! composes the answer; the history is then extended and compacted. A
//! collaborator failure (model quota, unparseable output) abandons the turn
//! with an apology and leaves the stored history untouched.

use crate::classifier::{InteractionClassifier, InteractionType};
use crate::composer::AnswerComposer;
use crate::config::{EngineConfig, Settings};
use crate::error::OrchestrationError;
use crate::execution::QueryExecutionLoop;
use crate::gemini::GeminiClient;
use crate::glossary::{GlossaryStore, JsonGlossaryFile, TermOutcome, TermResolver};
use crate::intent::IntentResolver;
use crate::llm::{invoke_structured, LanguageModel, PromptKind, RouteDecision, RouteStep};
use crate::memory::{ContextConfig, ConversationHistory, MemoryManager};
use crate::models::{DataPath, Phase, Scenario, TurnOutput, TurnState, UnavailableReason};
use crate::schema::{FileSchemaProvider, SchemaProvider};
use crate::session::{InMemorySessionStore, PgSessionStore, SessionStore};
use crate::sql::{PgSqlEngine, SqlEngine};
use crate::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const APOLOGY: &str =
    "I'm sorry, I couldn't complete this request right now. Please try again in a moment.";

/// Output of a turn plus the history the session should continue with
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub output: TurnOutput,
    pub history: ConversationHistory,
}

pub struct TurnOrchestrator {
    glossary: Arc<GlossaryStore>,
    model: Arc<dyn LanguageModel>,
    engine: Arc<dyn SqlEngine>,
    schema: Arc<dyn SchemaProvider>,
    sessions: Arc<dyn SessionStore>,
    config: EngineConfig,
    memory: MemoryManager,
    /// One turn at a time per session
    session_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl TurnOrchestrator {
    pub fn new(
        glossary: Arc<GlossaryStore>,
        model: Arc<dyn LanguageModel>,
        engine: Arc<dyn SqlEngine>,
        schema: Arc<dyn SchemaProvider>,
        sessions: Arc<dyn SessionStore>,
        config: EngineConfig,
    ) -> Self {
        let memory = MemoryManager::new(ContextConfig::from(&config));
        Self {
            glossary,
            model,
            engine,
            schema,
            sessions,
            config,
            memory,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the production collaborators: Gemini, Postgres, file-backed
    /// glossary and schema. Sessions live in Postgres when `persist_sessions`
    /// is set, in process memory otherwise.
    pub fn from_settings(settings: &Settings, persist_sessions: bool) -> Result<Self> {
        let glossary = GlossaryStore::load(&JsonGlossaryFile::new(settings.glossary_path.clone()))?;
        let schema = FileSchemaProvider::load(&settings.schema_path)?;
        let model = GeminiClient::new(settings.gemini_api_key.clone(), &settings.gemini_model)?;
        let engine = PgSqlEngine::connect_lazy(&settings.database_url)?;

        let sessions: Arc<dyn SessionStore> = if persist_sessions {
            Arc::new(PgSessionStore::new(engine.pool().clone()))
        } else {
            Arc::new(InMemorySessionStore::new())
        };

        Ok(Self::new(
            Arc::new(glossary),
            Arc::new(model),
            Arc::new(engine),
            Arc::new(schema),
            sessions,
            settings.engine.clone(),
        ))
    }

    pub fn glossary(&self) -> &GlossaryStore {
        &self.glossary
    }

    /// Load the session, answer, and persist the new history. Turns of the
    /// same session are serialized from load to save.
    pub async fn handle_turn(&self, session_id: Uuid, question: &str) -> Result<TurnOutput> {
        let lock = self.session_lock(session_id).await;
        let _turn = lock.lock().await;

        let history = self.sessions.load(session_id).await?;
        let reply = self.answer(question, history).await?;

        if !reply.output.aborted {
            self.sessions.save(&reply.history).await?;
        }
        Ok(reply.output)
    }

    async fn session_lock(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        // drop locks no turn is holding or waiting on
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(session_id).or_default().clone()
    }

    /// Run one turn against `history`.
    ///
    /// Aborting errors become an apology reply carrying the original
    /// history; any other error is returned.
    pub async fn answer(&self, question: &str, history: ConversationHistory) -> Result<TurnReply> {
        info!(session_id = %history.session_id, question = %question, "Turn started");

        let mut state = TurnState::new(question.trim(), history.clone());
        match self.run(&mut state).await {
            Ok(answer) => Ok(self.finish(state, answer).await),
            Err(e) if e.aborts_turn() => {
                warn!(
                    error = %e,
                    phase = %state.phase,
                    scenario = %state.scenario,
                    "Turn aborted"
                );
                Ok(TurnReply {
                    output: TurnOutput {
                        scenario: state.scenario,
                        answer: APOLOGY.to_string(),
                        transparency_notes: Vec::new(),
                        follow_ups: Vec::new(),
                        aborted: true,
                    },
                    history,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Drive the phase handlers until the answer is composed
    async fn run(&self, state: &mut TurnState) -> Result<String> {
        loop {
            let next = match state.phase {
                Phase::Started => self.on_started(state).await?,
                Phase::IntentResolved => self.on_intent_resolved(state).await?,
                Phase::QueriesExecuted => self.on_queries_executed(state),
                Phase::Answered => {
                    return Err(OrchestrationError::InvalidPhaseTransition {
                        from: Phase::Answered.to_string(),
                        to: Phase::Answered.to_string(),
                    })
                }
            };

            info!(from = %state.phase, to = %next, scenario = %state.scenario, "Phase transition");

            if next == Phase::Answered {
                let context = self.schema_context(state);
                let answer = AnswerComposer::new(self.model.as_ref(), &self.config)
                    .compose(state, &context)
                    .await?;
                state.phase.advance(next)?;
                return Ok(answer);
            }
            state.phase.advance(next)?;
        }
    }

    /// Decide between conversation, unavailability and analysis
    async fn on_started(&self, state: &mut TurnState) -> Result<Phase> {
        if InteractionClassifier::classify(&state.question) == InteractionType::Pleasantry {
            debug!("Pleasantry, answering conversationally");
            state.scenario = Scenario::Conversational;
            return Ok(Phase::Answered);
        }

        state.term_resolution =
            TermResolver::new(&self.glossary, self.config.fuzzy_threshold).resolve(&state.question);
        debug!(
            outcome = ?state.term_resolution.outcome,
            found = state.term_resolution.found.len(),
            "Terms resolved"
        );

        let route: RouteDecision = invoke_structured(
            self.model.as_ref(),
            PromptKind::Route,
            json!({
                "question": state.question,
                "history": state.history.formatted(),
                "schema": self.schema_context(state),
            }),
        )
        .await?;
        debug!(next_step = ?route.next_step, "Route decided");

        if route.next_step == RouteStep::Conversational {
            state.scenario = Scenario::Conversational;
            return Ok(Phase::Answered);
        }

        if matches!(state.term_resolution.outcome, TermOutcome::Unavailable { .. }) {
            state.scenario = Scenario::DataUnavailable(UnavailableReason::Exhausted);
            state.route_note = route.note;
            return Ok(Phase::Answered);
        }

        if route.next_step == RouteStep::DataUnavailable && !state.term_resolution.has_data_path() {
            state.scenario = Scenario::DataUnavailable(UnavailableReason::NotInSchema);
            state.route_note = route.note;
            return Ok(Phase::Answered);
        }

        let notes = state.term_resolution.notes.clone();
        state.transparency_notes.extend(notes);

        IntentResolver::new(self.model.as_ref(), &self.config)
            .resolve(state, &self.schema.describe())
            .await?;
        Ok(Phase::IntentResolved)
    }

    /// Ambiguity goes straight to the answer; anything else runs queries
    async fn on_intent_resolved(&self, state: &mut TurnState) -> Result<Phase> {
        if state.scenario.is_ambiguous() {
            return Ok(Phase::Answered);
        }

        let context = self.schema_context(state);
        QueryExecutionLoop::new(
            self.model.as_ref(),
            self.engine.as_ref(),
            self.schema.as_ref(),
            &self.config,
        )
        .run(state, &context)
        .await?;
        Ok(Phase::QueriesExecuted)
    }

    fn on_queries_executed(&self, state: &mut TurnState) -> Phase {
        state.scenario = Scenario::DirectData(if state.term_resolution.is_substituted() {
            DataPath::Substituted
        } else {
            DataPath::Direct
        });
        Phase::Answered
    }

    /// Record the turn, compact memory and build the output
    async fn finish(&self, mut state: TurnState, answer: String) -> TurnReply {
        state.history.push_turn(state.question.clone(), answer.clone());
        let compacted = self
            .memory
            .compact(self.model.as_ref(), &mut state.history)
            .await;

        info!(
            scenario = %state.scenario,
            queries = state.queries.len(),
            compacted,
            history_tokens = state.history.total_tokens(),
            "Turn answered"
        );

        TurnReply {
            output: TurnOutput {
                scenario: state.scenario,
                answer,
                transparency_notes: state.transparency_notes.to_vec(),
                follow_ups: state.follow_ups,
                aborted: false,
            },
            history: state.history,
        }
    }

    fn schema_context(&self, state: &TurnState) -> String {
        format!(
            "{}{}",
            self.schema.describe(),
            state.term_resolution.key_terms_context()
        )
    }
}
