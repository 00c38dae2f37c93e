//! Query Execution Loop
//!
//! Per intent: synthesize one SQL query, execute it with bounded
//! correction, refine it while the result is over the token budget, then
//! extract an insight. A query that keeps failing is marked `failed` and
//! never aborts the turn; a result that stays too large is accepted as
//! `degraded`. Only collaborator errors from the language model propagate.

use crate::config::EngineConfig;
use crate::llm::{invoke_structured, LanguageModel, PromptKind, QueryInsight, SqlText};
use crate::models::{QueryRecord, QueryStatus, TurnState};
use crate::schema::SchemaProvider;
use crate::sql::{QueryOutline, QueryRows, SqlEngine};
use crate::Result;
use futures::future::try_join_all;
use serde_json::json;
use tracing::{debug, info, warn};

pub struct QueryExecutionLoop<'a> {
    model: &'a dyn LanguageModel,
    engine: &'a dyn SqlEngine,
    schema: &'a dyn SchemaProvider,
    config: &'a EngineConfig,
}

impl<'a> QueryExecutionLoop<'a> {
    pub fn new(
        model: &'a dyn LanguageModel,
        engine: &'a dyn SqlEngine,
        schema: &'a dyn SchemaProvider,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            model,
            engine,
            schema,
            config,
        }
    }

    /// Run every intent of the turn. Records come back in intent order and
    /// their notes are appended to the turn's transparency notes.
    pub async fn run(&self, state: &mut TurnState, schema_context: &str) -> Result<()> {
        info!(intents = state.intents.len(), "Executing queries");

        let records = try_join_all(
            state
                .intents
                .iter()
                .map(|intent| self.run_intent(intent, schema_context)),
        )
        .await?;

        for record in &records {
            state.transparency_notes.extend(record.notes.iter().cloned());
        }
        state.queries = records;

        Ok(())
    }

    async fn run_intent(&self, intent: &str, schema_context: &str) -> Result<QueryRecord> {
        let synthesized: SqlText = invoke_structured(
            self.model,
            PromptKind::SqlSynthesis,
            json!({
                "intent": intent,
                "schema": schema_context,
                "dialect": self.engine.dialect(),
            }),
        )
        .await?;

        let mut record = QueryRecord::pending(intent, synthesized.query);
        // Smallest over-budget result seen so far
        let mut best: Option<QueryRows> = None;

        loop {
            let Some(rows) = self.execute_with_correction(&mut record, schema_context).await? else {
                match best.take() {
                    Some(rows) => self.degrade(&mut record, rows),
                    None => {
                        warn!(
                            intent,
                            attempts = record.correction_attempts + 1,
                            error = record.last_error.as_deref().unwrap_or_default(),
                            "Query failed"
                        );
                        record.status = QueryStatus::Failed;
                        return Ok(record);
                    }
                }
                break;
            };

            let tokens = rows.token_count();
            if tokens <= self.config.token_budget {
                record.status = QueryStatus::Succeeded;
                record.result = Some(rows);
                break;
            }

            debug!(tokens, budget = self.config.token_budget, "Result over budget");
            if best.as_ref().map_or(true, |b| tokens < b.token_count()) {
                best = Some(rows);
            }

            if record.refinement_attempts >= self.config.max_refinements {
                if let Some(rows) = best.take() {
                    self.degrade(&mut record, rows);
                }
                break;
            }

            record.refinement_attempts += 1;
            info!(
                intent,
                refinement = record.refinement_attempts,
                tokens,
                "Refining query"
            );
            let refined: SqlText = invoke_structured(
                self.model,
                PromptKind::SqlRefinement,
                json!({
                    "intent": intent,
                    "query": record.text,
                    "result_tokens": tokens,
                    "token_budget": self.config.token_budget,
                    "schema": schema_context,
                    "dialect": self.engine.dialect(),
                }),
            )
            .await?;
            record.text = refined.query;
        }

        self.extract_insight(&mut record).await?;
        Ok(record)
    }

    /// One execution/correction cycle. `None` once every attempt failed.
    async fn execute_with_correction(
        &self,
        record: &mut QueryRecord,
        schema_context: &str,
    ) -> Result<Option<QueryRows>> {
        let max_attempts = self.config.max_execution_attempts;

        for attempt in 1..=max_attempts {
            debug!(attempt, max_attempts, "Executing query");

            match self.engine.execute(&record.text).await {
                Ok(rows) => {
                    record.last_error = None;
                    return Ok(Some(rows));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Query execution failed");
                    record.last_error = Some(e.message.clone());

                    if attempt == max_attempts {
                        break;
                    }

                    let corrected: SqlText = invoke_structured(
                        self.model,
                        PromptKind::SqlCorrection,
                        json!({
                            "query": record.text,
                            "error": e.message,
                            "schema": schema_context,
                            "dialect": self.engine.dialect(),
                        }),
                    )
                    .await?;
                    record.text = corrected.query;
                    record.correction_attempts += 1;
                }
            }
        }

        Ok(None)
    }

    /// Accept an over-budget result, cut to the budget
    fn degrade(&self, record: &mut QueryRecord, rows: QueryRows) {
        let kept = rows.truncate_to_budget(self.config.token_budget);
        warn!(
            total_rows = rows.rows.len(),
            kept_rows = kept.rows.len(),
            "Result still too large, accepting truncated result"
        );

        record.notes.push(format!(
            "Result too large to show in full; only the first {} of {} rows were used.",
            kept.rows.len(),
            rows.rows.len()
        ));
        record.status = QueryStatus::Degraded;
        record.result = Some(kept);
    }

    async fn extract_insight(&self, record: &mut QueryRecord) -> Result<()> {
        let rendered = record
            .result
            .as_ref()
            .map(QueryRows::render)
            .unwrap_or_default();

        let insight: QueryInsight = invoke_structured(
            self.model,
            PromptKind::QueryInsight,
            json!({
                "intent": record.intent,
                "query": record.text,
                "result": rendered,
            }),
        )
        .await?;

        record.insight = Some(insight.insight);
        record.notes.extend(
            insight
                .highlights
                .into_iter()
                .take(self.config.max_highlights),
        );

        let outline = QueryOutline::of(&record.text);
        record
            .notes
            .extend(outline.filters.iter().map(|f| format!("Filters applied: {}", f)));
        record.notes.extend(self.schema.date_ranges(&outline.tables));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;
    use crate::llm::ScriptedModel;
    use crate::memory::ConversationHistory;
    use crate::schema::fixtures::sample_schema;
    use crate::sql::MockSqlEngine;
    use serde_json::Value;
    use uuid::Uuid;

    /// Rows rendering to roughly `tokens` tokens
    fn rows_of_size(tokens: usize) -> QueryRows {
        // 1-byte header, then 15 bytes per row ("\n" + 14-byte value)
        let count = (tokens * 4).saturating_sub(4) / 15;
        QueryRows::new(
            vec!["v".into()],
            (0..count).map(|i| vec![Value::String(format!("r{:013}", i))]).collect(),
        )
    }

    fn sql(query: &str) -> Value {
        json!({"query": query})
    }

    fn insight() -> Value {
        json!({"insight": "Total AUM is $4.2B", "highlights": ["Active households only"]})
    }

    fn state(intents: &[&str]) -> TurnState {
        let mut state = TurnState::new("q", ConversationHistory::new(Uuid::new_v4()));
        state.intents = intents.iter().map(|s| s.to_string()).collect();
        state
    }

    async fn run(model: &ScriptedModel, engine: &MockSqlEngine, state: &mut TurnState) -> Result<()> {
        let config = EngineConfig::default();
        let schema = sample_schema();
        QueryExecutionLoop::new(model, engine, &schema, &config)
            .run(state, "schema")
            .await
    }

    #[test]
    fn test_rows_of_size_helper() {
        let tokens = rows_of_size(1200).token_count();
        assert!(tokens > 1100 && tokens <= 1200, "{}", tokens);
        assert!(rows_of_size(400).token_count() <= 500);
    }

    #[tokio::test]
    async fn test_single_query_succeeds_with_highlights() {
        let model = ScriptedModel::new()
            .respond(
                PromptKind::SqlSynthesis,
                sql("SELECT SUM(account_assets) FROM public.fact_account_monthly WHERE snapshot_date = '2025-09-30'"),
            )
            .respond(PromptKind::QueryInsight, insight());
        let engine = MockSqlEngine::new().returns(rows_of_size(20));
        let mut state = state(&["Total AUM"]);

        run(&model, &engine, &mut state).await.unwrap();

        let record = &state.queries[0];
        assert_eq!(record.status, QueryStatus::Succeeded);
        assert_eq!(record.correction_attempts, 0);
        assert_eq!(record.insight.as_deref(), Some("Total AUM is $4.2B"));
        assert_eq!(engine.statements().len(), 1);
        assert_eq!(
            state.transparency_notes.as_slice(),
            &[
                "Active households only",
                "Filters applied: snapshot_date = '2025-09-30'",
                "public.fact_account_monthly, column snapshot_date: 2024-01-31 to 2025-09-30",
            ]
        );
    }

    #[tokio::test]
    async fn test_two_failures_then_success() {
        let model = ScriptedModel::new()
            .respond(PromptKind::SqlSynthesis, sql("SELEC 1"))
            .respond(PromptKind::SqlCorrection, sql("SELECT 1 FROM"))
            .respond(PromptKind::SqlCorrection, sql("SELECT 1"))
            .respond(PromptKind::QueryInsight, insight());
        let engine = MockSqlEngine::new()
            .fails("Error: syntax error at or near \"SELEC\"")
            .fails("Error: syntax error at end of input")
            .returns(rows_of_size(10));
        let mut state = state(&["one"]);

        run(&model, &engine, &mut state).await.unwrap();

        let record = &state.queries[0];
        assert_eq!(record.status, QueryStatus::Succeeded);
        assert_eq!(record.correction_attempts, 2);
        assert_eq!(record.text, "SELECT 1");
        assert!(record.last_error.is_none());
        assert_eq!(engine.statements(), vec!["SELEC 1", "SELECT 1 FROM", "SELECT 1"]);

        // the second correction saw the second error
        let corrections = model.requests_for(PromptKind::SqlCorrection);
        assert_eq!(corrections[1].params["error"], "Error: syntax error at end of input");
    }

    #[tokio::test]
    async fn test_three_failures_mark_query_failed_and_turn_continues() {
        let model = ScriptedModel::new()
            .respond(PromptKind::SqlSynthesis, sql("bad"))
            .respond(PromptKind::SqlSynthesis, sql("SELECT 2"))
            .respond_always(PromptKind::SqlCorrection, sql("still bad"))
            .respond(PromptKind::QueryInsight, insight());
        let engine = MockSqlEngine::new()
            .on("bad", Err(crate::error::SqlExecutionError::new("Error: boom")))
            .on("still bad", Err(crate::error::SqlExecutionError::new("Error: boom 2")))
            .on("still bad", Err(crate::error::SqlExecutionError::new("Error: boom 3")))
            .on("SELECT 2", Ok(rows_of_size(10)));
        let mut state = state(&["first", "second"]);

        run(&model, &engine, &mut state).await.unwrap();

        let failed = &state.queries[0];
        assert_eq!(failed.status, QueryStatus::Failed);
        assert_eq!(failed.correction_attempts, 2);
        assert_eq!(failed.last_error.as_deref(), Some("Error: boom 3"));
        assert!(failed.insight.is_none());
        assert_eq!(
            engine.statements().iter().filter(|s| s.as_str() != "SELECT 2").count(),
            3
        );

        assert_eq!(state.queries[1].intent, "second");
        assert_eq!(state.queries[1].status, QueryStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_two_refinements_bring_result_under_budget() {
        let model = ScriptedModel::new()
            .respond(PromptKind::SqlSynthesis, sql("SELECT * FROM households"))
            .respond(PromptKind::SqlRefinement, sql("SELECT region, * FROM households"))
            .respond(PromptKind::SqlRefinement, sql("SELECT region, COUNT(*) FROM households GROUP BY region"))
            .respond(PromptKind::QueryInsight, insight());
        let engine = MockSqlEngine::new()
            .returns(rows_of_size(1200))
            .returns(rows_of_size(800))
            .returns(rows_of_size(400));
        let mut state = state(&["households"]);

        run(&model, &engine, &mut state).await.unwrap();

        let record = &state.queries[0];
        assert_eq!(record.status, QueryStatus::Succeeded);
        assert_eq!(record.refinement_attempts, 2);
        assert!(record.result.as_ref().unwrap().token_count() <= 500);
        assert_eq!(model.calls(PromptKind::SqlRefinement), 2);
    }

    #[tokio::test]
    async fn test_refinement_exhaustion_degrades_with_smallest_result() {
        let model = ScriptedModel::new()
            .respond(PromptKind::SqlSynthesis, sql("SELECT * FROM households"))
            .respond_always(PromptKind::SqlRefinement, sql("SELECT * FROM households LIMIT 500"))
            .respond(PromptKind::QueryInsight, insight());
        let engine = MockSqlEngine::new()
            .returns(rows_of_size(2000))
            .returns(rows_of_size(900))
            .returns(rows_of_size(1500))
            .returns(rows_of_size(1000));
        let mut state = state(&["households"]);

        run(&model, &engine, &mut state).await.unwrap();

        let record = &state.queries[0];
        assert_eq!(record.status, QueryStatus::Degraded);
        assert_eq!(record.refinement_attempts, 3);
        assert_eq!(model.calls(PromptKind::SqlRefinement), 3);
        assert_eq!(engine.statements().len(), 4);

        let kept = record.result.as_ref().unwrap();
        assert!(kept.token_count() <= 500);
        let total = rows_of_size(900).rows.len();
        assert!(record.notes[0].ends_with(&format!("of {} rows were used.", total)));
        assert!(record.insight.is_some());
    }

    #[tokio::test]
    async fn test_refined_query_that_fails_falls_back_to_degraded() {
        let model = ScriptedModel::new()
            .respond(PromptKind::SqlSynthesis, sql("SELECT * FROM households"))
            .respond(PromptKind::SqlRefinement, sql("SELECT broken"))
            .respond_always(PromptKind::SqlCorrection, sql("SELECT broken"))
            .respond(PromptKind::QueryInsight, insight());
        let engine = MockSqlEngine::new()
            .returns(rows_of_size(900))
            .fails("Error: a")
            .fails("Error: b")
            .fails("Error: c");
        let mut state = state(&["households"]);

        run(&model, &engine, &mut state).await.unwrap();

        let record = &state.queries[0];
        assert_eq!(record.status, QueryStatus::Degraded);
        assert_eq!(record.correction_attempts, 2);
        assert_eq!(record.refinement_attempts, 1);
    }

    #[tokio::test]
    async fn test_results_keep_intent_order() {
        let model = ScriptedModel::new()
            .respond(PromptKind::SqlSynthesis, sql("SELECT 'a'"))
            .respond(PromptKind::SqlSynthesis, sql("SELECT 'b'"))
            .respond(PromptKind::SqlSynthesis, sql("SELECT 'c'"))
            .respond_always(PromptKind::QueryInsight, insight());
        let engine = MockSqlEngine::new();
        let mut state = state(&["a", "b", "c"]);

        run(&model, &engine, &mut state).await.unwrap();

        let intents: Vec<&str> = state.queries.iter().map(|q| q.intent.as_str()).collect();
        assert_eq!(intents, vec!["a", "b", "c"]);
        assert!(state.queries.iter().all(|q| q.status == QueryStatus::Succeeded));
        // shared highlight recorded once
        assert_eq!(state.transparency_notes.as_slice(), &["Active households only"]);
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let model = ScriptedModel::new().fail(PromptKind::SqlSynthesis, "503");
        let engine = MockSqlEngine::new();
        let mut state = state(&["a"]);

        let result = run(&model, &engine, &mut state).await;
        assert!(matches!(result, Err(OrchestrationError::ProviderTransient(_))));
        assert!(engine.statements().is_empty());
    }
}
