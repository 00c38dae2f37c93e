//! SQL engine collaborator
//!
//! `SqlEngine` executes one read-only statement and returns rows or a
//! `SqlExecutionError`. Also carries the row model with its token-sized
//! rendering, the Postgres engine, a scripted engine for tests and a
//! parsed outline of a statement (tables read, WHERE predicates).

use crate::error::{OrchestrationError, SqlExecutionError};
use crate::tokens::estimate_tokens;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlparser::ast::{visit_relations, Query, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait SqlEngine: Send + Sync {
    /// Dialect name handed to SQL synthesis
    fn dialect(&self) -> &str;

    async fn execute(&self, sql: &str) -> Result<QueryRows, SqlExecutionError>;
}

/// Tabular query result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryRows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Pipe-separated text, header first. This is what the model sees.
    pub fn render(&self) -> String {
        if self.rows.is_empty() {
            return "No results found.".to_string();
        }

        let mut lines = Vec::with_capacity(self.rows.len() + 1);
        lines.push(self.columns.join(" | "));
        for row in &self.rows {
            lines.push(render_row(row));
        }
        lines.join("\n")
    }

    pub fn token_count(&self) -> usize {
        estimate_tokens(&self.render())
    }

    /// Leading rows whose rendering fits `budget` tokens
    pub fn truncate_to_budget(&self, budget: usize) -> QueryRows {
        let mut kept = QueryRows::new(self.columns.clone(), Vec::new());
        let mut used = estimate_tokens(&self.columns.join(" | "));

        for row in &self.rows {
            // +1 for the newline
            let cost = estimate_tokens(&render_row(row)) + 1;
            if used + cost > budget {
                break;
            }
            used += cost;
            kept.rows.push(row.clone());
        }

        kept
    }
}

fn render_row(row: &[Value]) -> String {
    row.iter()
        .map(|v| match v {
            Value::Null => "NULL".to_string(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

// =============================
// Postgres
// =============================

/// Read-only Postgres engine. Each statement runs in its own read-only
/// transaction with a statement timeout and is always rolled back.
pub struct PgSqlEngine {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgSqlEngine {
    pub fn connect_lazy(database_url: &str) -> crate::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| OrchestrationError::DatabaseError(format!("Invalid database URL: {}", e)))?;

        info!("SQL engine: postgres");
        Ok(Self {
            pool,
            statement_timeout: Duration::from_secs(30),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SqlEngine for PgSqlEngine {
    fn dialect(&self) -> &str {
        "PostgreSQL"
    }

    async fn execute(&self, sql: &str) -> Result<QueryRows, SqlExecutionError> {
        let statement = sql.trim().trim_end_matches(';');
        let wrapped = format!("SELECT row_to_json(q)::text AS row FROM ({}) q", statement);

        let mut tx = self.pool.begin().await.map_err(to_sql_error)?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(to_sql_error)?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(to_sql_error)?;

        let fetched = sqlx::query(&wrapped).fetch_all(&mut *tx).await;
        tx.rollback().await.map_err(to_sql_error)?;
        let fetched = fetched.map_err(to_sql_error)?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows = Vec::with_capacity(fetched.len());
        for row in fetched {
            let text: String = row.try_get("row").map_err(to_sql_error)?;
            let object: serde_json::Map<String, Value> = serde_json::from_str(&text)
                .map_err(|e| SqlExecutionError::new(format!("undecodable row: {}", e)))?;

            if columns.is_empty() {
                columns = object.keys().cloned().collect();
            }
            rows.push(object.into_iter().map(|(_, v)| v).collect());
        }

        debug!(rows = rows.len(), "Statement executed");
        Ok(QueryRows::new(columns, rows))
    }
}

fn to_sql_error(e: sqlx::Error) -> SqlExecutionError {
    match e {
        sqlx::Error::Database(db) => SqlExecutionError::new(format!("Error: {}", db.message())),
        other => SqlExecutionError::new(format!("Error: {}", other)),
    }
}

// =============================
// Scripted engine
// =============================

/// Scripted SQL engine for tests and offline runs.
///
/// Results registered for an exact statement win; otherwise the shared
/// queue is consumed in order. An empty queue yields an empty result.
#[derive(Default)]
pub struct MockSqlEngine {
    by_statement: Mutex<HashMap<String, VecDeque<Result<QueryRows, SqlExecutionError>>>>,
    queue: Mutex<VecDeque<Result<QueryRows, SqlExecutionError>>>,
    statements: Mutex<Vec<String>>,
}

impl MockSqlEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn returns(self, rows: QueryRows) -> Self {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(Ok(rows));
        }
        self
    }

    pub fn fails(self, message: &str) -> Self {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(Err(SqlExecutionError::new(message)));
        }
        self
    }

    /// Result for one exact statement
    pub fn on(self, sql: &str, result: Result<QueryRows, SqlExecutionError>) -> Self {
        if let Ok(mut m) = self.by_statement.lock() {
            m.entry(sql.trim().to_string()).or_default().push_back(result);
        }
        self
    }

    /// Every executed statement, in order
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SqlEngine for MockSqlEngine {
    fn dialect(&self) -> &str {
        "PostgreSQL"
    }

    async fn execute(&self, sql: &str) -> Result<QueryRows, SqlExecutionError> {
        let key = sql.trim().to_string();
        if let Ok(mut s) = self.statements.lock() {
            s.push(key.clone());
        }

        let scripted = self
            .by_statement
            .lock()
            .ok()
            .and_then(|mut m| m.get_mut(&key).and_then(|q| q.pop_front()));
        if let Some(result) = scripted {
            return result;
        }

        self.queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| Ok(QueryRows::default()))
    }
}

// =============================
// Statement outline
// =============================

/// Tables read and WHERE predicates of a statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOutline {
    pub tables: Vec<String>,
    pub filters: Vec<String>,
}

impl QueryOutline {
    /// Outline of `sql`; empty when the statement does not parse
    pub fn of(sql: &str) -> Self {
        let statements = match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
            Ok(statements) => statements,
            Err(e) => {
                debug!(error = %e, "No outline for unparseable statement");
                return Self::default();
            }
        };

        let mut outline = Self::default();
        let mut ctes: Vec<String> = Vec::new();
        for statement in &statements {
            if let Statement::Query(query) = statement {
                outline.collect_query(query, &mut ctes);
            }
        }

        for statement in &statements {
            let _ = visit_relations(statement, |relation| {
                let name = relation.to_string();
                if !ctes.contains(&name.to_lowercase()) && !outline.tables.contains(&name) {
                    outline.tables.push(name);
                }
                ControlFlow::<()>::Continue(())
            });
        }

        outline
    }

    fn collect_query(&mut self, query: &Query, ctes: &mut Vec<String>) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                ctes.push(cte.alias.name.value.to_lowercase());
                self.collect_query(&cte.query, ctes);
            }
        }
        self.collect_set_expr(&query.body, ctes);
    }

    fn collect_set_expr(&mut self, body: &SetExpr, ctes: &mut Vec<String>) {
        match body {
            SetExpr::Select(select) => {
                for table in &select.from {
                    self.collect_from(table, ctes);
                }
                if let Some(selection) = &select.selection {
                    let filter = selection.to_string();
                    if !self.filters.contains(&filter) {
                        self.filters.push(filter);
                    }
                }
            }
            SetExpr::Query(query) => self.collect_query(query, ctes),
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_set_expr(left, ctes);
                self.collect_set_expr(right, ctes);
            }
            _ => {}
        }
    }

    /// Derived tables and nested joins carry their own WHERE clauses
    fn collect_from(&mut self, table: &TableWithJoins, ctes: &mut Vec<String>) {
        let factors = std::iter::once(&table.relation).chain(table.joins.iter().map(|j| &j.relation));
        for factor in factors {
            match factor {
                TableFactor::Derived { subquery, .. } => self.collect_query(subquery, ctes),
                TableFactor::NestedJoin {
                    table_with_joins, ..
                } => self.collect_from(table_with_joins, ctes),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: usize) -> QueryRows {
        QueryRows::new(
            vec!["advisor".into(), "net_revenue".into()],
            (0..n)
                .map(|i| vec![json!(format!("Advisor {}", i)), json!(1000 + i)])
                .collect(),
        )
    }

    #[test]
    fn test_render() {
        assert_eq!(QueryRows::default().render(), "No results found.");
        assert_eq!(
            rows(2).render(),
            "advisor | net_revenue\nAdvisor 0 | 1000\nAdvisor 1 | 1001"
        );
        let with_null = QueryRows::new(vec!["a".into()], vec![vec![Value::Null]]);
        assert_eq!(with_null.render(), "a\nNULL");
    }

    #[test]
    fn test_truncate_to_budget() {
        let big = rows(400);
        assert!(big.token_count() > 500);

        let kept = big.truncate_to_budget(500);
        assert!(!kept.rows.is_empty());
        assert!(kept.rows.len() < 400);
        assert!(kept.token_count() <= 500);
        assert_eq!(kept.rows[0], big.rows[0]);
    }

    #[tokio::test]
    async fn test_mock_engine_prefers_exact_statement() {
        let engine = MockSqlEngine::new()
            .fails("Error: relation \"x\" does not exist")
            .on("SELECT 1", Ok(rows(1)));

        assert_eq!(engine.execute("SELECT 1").await.unwrap().rows.len(), 1);
        assert!(engine.execute("SELECT * FROM x").await.is_err());
        assert!(engine.execute("SELECT 2").await.unwrap().is_empty());
        assert_eq!(engine.statements(), vec!["SELECT 1", "SELECT * FROM x", "SELECT 2"]);
    }

    #[test]
    fn test_outline_tables_and_filters() {
        let sql = r#"
            WITH monthly AS (
                SELECT advisor_id, SUM(net_revenue) AS rev
                FROM fact_revenue_monthly r
                WHERE r.month >= DATE '2024-01-01'
                GROUP BY advisor_id
            )
            SELECT a.advisor_name, m.rev, EXTRACT(YEAR FROM a.hire_date)
            FROM monthly m
            JOIN dim_advisor a ON a.advisor_id = m.advisor_id
            WHERE a.status = 'Active' AND a.region IN ('East', 'West')
            ORDER BY m.rev DESC
            LIMIT 10
        "#;

        let outline = QueryOutline::of(sql);
        assert_eq!(outline.tables, vec!["fact_revenue_monthly", "dim_advisor"]);
        assert_eq!(
            outline.filters,
            vec![
                "r.month >= DATE '2024-01-01'",
                "a.status = 'Active' AND a.region IN ('East', 'West')",
            ]
        );
    }

    #[test]
    fn test_outline_without_where() {
        let outline = QueryOutline::of("SELECT COUNT(*) FROM public.dim_household;");
        assert_eq!(outline.tables, vec!["public.dim_household"]);
        assert!(outline.filters.is_empty());
    }

    #[test]
    fn test_outline_comma_join_reads_every_table() {
        let outline = QueryOutline::of(
            "SELECT h.region, SUM(f.account_assets) \
             FROM public.dim_household h, public.fact_account_monthly f \
             WHERE h.household_id = f.household_id \
             GROUP BY h.region",
        );
        assert_eq!(
            outline.tables,
            vec!["public.dim_household", "public.fact_account_monthly"]
        );
        assert_eq!(outline.filters, vec!["h.household_id = f.household_id"]);
    }

    #[test]
    fn test_outline_ignores_comments() {
        let outline =
            QueryOutline::of("SELECT COUNT(*) FROM public.dim_household -- where clause omitted\n");
        assert_eq!(outline.tables, vec!["public.dim_household"]);
        assert!(outline.filters.is_empty());
    }

    #[test]
    fn test_outline_of_subqueries() {
        let outline = QueryOutline::of(
            "SELECT t.region FROM (SELECT region FROM public.dim_household WHERE household_status = 'Active') t \
             WHERE t.region IN (SELECT region FROM public.dim_advisor)",
        );
        assert_eq!(
            outline.tables,
            vec!["public.dim_household", "public.dim_advisor"]
        );
        assert_eq!(
            outline.filters,
            vec![
                "household_status = 'Active'",
                "t.region IN (SELECT region FROM public.dim_advisor)",
            ]
        );
    }

    #[test]
    fn test_unparseable_statement_has_no_outline() {
        assert_eq!(QueryOutline::of("SELEC region FRM WHERE"), QueryOutline::default());
    }
}
