//! Postgres session store
//!
//! One row per history entry in `conversation_turns`, created on first use.

use super::SessionStore;
use crate::error::OrchestrationError;
use crate::memory::{ConversationHistory, EntryContent, HistoryEntry};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

pub struct PgSessionStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        info!("Session store backend: postgres");
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversation_turns (
                      entry_id UUID PRIMARY KEY,
                      session_id UUID NOT NULL,
                      position INTEGER NOT NULL,
                      kind TEXT NOT NULL,
                      question TEXT,
                      answer TEXT,
                      summary TEXT,
                      token_count INTEGER NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_conversation_turns_session
                    ON conversation_turns (session_id, position);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to initialize session schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TurnRow {
    entry_id: Uuid,
    kind: String,
    question: Option<String>,
    answer: Option<String>,
    summary: Option<String>,
    token_count: i32,
    created_at: DateTime<Utc>,
}

fn corrupt_row(entry_id: Uuid, detail: &str) -> OrchestrationError {
    OrchestrationError::DatabaseError(format!(
        "Corrupt history entry {}: {}",
        entry_id, detail
    ))
}

impl TryFrom<TurnRow> for HistoryEntry {
    type Error = OrchestrationError;

    fn try_from(row: TurnRow) -> Result<Self> {
        let content = match row.kind.as_str() {
            "turn" => match (row.question, row.answer) {
                (Some(question), Some(answer)) => EntryContent::Turn { question, answer },
                _ => return Err(corrupt_row(row.entry_id, "turn without question or answer")),
            },
            "summary" => match row.summary {
                Some(text) => EntryContent::Summary { text },
                None => return Err(corrupt_row(row.entry_id, "summary without text")),
            },
            other => {
                return Err(corrupt_row(
                    row.entry_id,
                    &format!("unknown kind '{}'", other),
                ))
            }
        };

        let token_count = usize::try_from(row.token_count)
            .map_err(|_| corrupt_row(row.entry_id, "negative token count"))?;

        Ok(HistoryEntry {
            entry_id: row.entry_id,
            timestamp: row.created_at,
            content,
            token_count,
        })
    }
}

fn db_error(context: &str) -> impl Fn(sqlx::Error) -> OrchestrationError + '_ {
    move |e| OrchestrationError::DatabaseError(format!("{}: {}", context, e))
}

#[async_trait::async_trait]
impl SessionStore for PgSessionStore {
    async fn load(&self, session_id: Uuid) -> Result<ConversationHistory> {
        self.ensure_schema().await?;

        let rows = sqlx::query_as::<_, TurnRow>(
            r#"
            SELECT entry_id, kind, question, answer, summary, token_count, created_at
            FROM conversation_turns
            WHERE session_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load conversation history"))?;

        let mut history = ConversationHistory::new(session_id);
        for row in rows {
            history.push(HistoryEntry::try_from(row)?);
        }

        Ok(history)
    }

    async fn save(&self, history: &ConversationHistory) -> Result<()> {
        self.ensure_schema().await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin history transaction"))?;

        sqlx::query("DELETE FROM conversation_turns WHERE session_id = $1")
            .bind(history.session_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to clear old history"))?;

        for (position, entry) in history.entries().enumerate() {
            let (kind, question, answer, summary) = match &entry.content {
                EntryContent::Turn { question, answer } => {
                    ("turn", Some(question.as_str()), Some(answer.as_str()), None)
                }
                EntryContent::Summary { text } => ("summary", None, None, Some(text.as_str())),
            };

            sqlx::query(
                r#"
                INSERT INTO conversation_turns
                  (entry_id, session_id, position, kind, question, answer, summary, token_count, created_at)
                VALUES
                  ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(entry.entry_id)
            .bind(history.session_id)
            .bind(position as i32)
            .bind(kind)
            .bind(question)
            .bind(answer)
            .bind(summary)
            .bind(entry.token_count as i32)
            .bind(entry.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to insert history entry"))?;
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit history transaction"))?;

        Ok(())
    }
}
