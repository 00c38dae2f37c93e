//! Schema description provider
//!
//! Supplies the textual schema context consumed by intent generation and
//! SQL synthesis, and the known date coverage of date columns.

use crate::error::OrchestrationError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

pub trait SchemaProvider: Send + Sync {
    /// Schema context string
    fn describe(&self) -> String;

    /// `"<table>, column <col>: <range>"` for every date column of the given tables
    fn date_ranges(&self, tables: &[String]) -> Vec<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDoc {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "Date range")]
    pub date_range: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDoc {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub columns: Vec<ColumnDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub tables: Vec<TableDoc>,
    /// Free-text summary of what the database holds
    #[serde(default)]
    pub database_content: Option<String>,
}

/// Schema documentation loaded from a JSON file at startup
pub struct FileSchemaProvider {
    document: SchemaDocument,
    description: String,
}

impl FileSchemaProvider {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let document: SchemaDocument = serde_json::from_str(&raw)
            .map_err(|e| OrchestrationError::Schema(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_document(document)
    }

    pub fn from_document(document: SchemaDocument) -> Result<Self> {
        if document.tables.is_empty() {
            return Err(OrchestrationError::Schema("schema lists no tables".to_string()));
        }

        let description = render(&document);
        info!(tables = document.tables.len(), "Schema loaded");

        Ok(Self {
            document,
            description,
        })
    }
}

fn render(document: &SchemaDocument) -> String {
    let mut out = String::new();

    for table in &document.tables {
        out.push_str(&format!("Table {}: {}\n", table.name, table.description));
        for column in &table.columns {
            out.push_str(&format!("  - {}: {}", column.name, column.description));
            if let Some(range) = &column.date_range {
                out.push_str(&format!(" (values from {})", range));
            }
            out.push('\n');
        }
    }

    if let Some(content) = &document.database_content {
        out.push_str(&format!("\nDatabase content: {}\n", content));
    }

    out.trim_end().to_string()
}

/// `public.dim_date` matches `dim_date` and vice versa
fn same_table(a: &str, b: &str) -> bool {
    let bare = |s: &str| {
        s.rsplit('.')
            .next()
            .unwrap_or(s)
            .trim_matches('"')
            .to_lowercase()
    };
    a.eq_ignore_ascii_case(b) || bare(a) == bare(b)
}

impl SchemaProvider for FileSchemaProvider {
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn date_ranges(&self, tables: &[String]) -> Vec<String> {
        let mut out = Vec::new();

        for requested in tables {
            let Some(table) = self
                .document
                .tables
                .iter()
                .find(|t| same_table(&t.name, requested))
            else {
                continue;
            };

            for column in &table.columns {
                if let Some(range) = &column.date_range {
                    let note = format!("{}, column {}: {}", table.name, column.name, range);
                    if !out.contains(&note) {
                        out.push(note);
                    }
                }
            }
        }

        out
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn sample_schema() -> FileSchemaProvider {
        let document: SchemaDocument = serde_json::from_value(serde_json::json!({
            "tables": [
                {
                    "name": "public.fact_account_monthly",
                    "description": "Monthly account snapshot",
                    "columns": [
                        {"name": "snapshot_date", "description": "Month end", "date_range": "2024-01-31 to 2025-09-30"},
                        {"name": "account_assets", "description": "Market value of the account"},
                        {"name": "household_id", "description": "Owning household"}
                    ]
                },
                {
                    "name": "public.dim_household",
                    "description": "Client households",
                    "columns": [
                        {"name": "household_id", "description": "Primary key"},
                        {"name": "household_status", "description": "Active or Closed"}
                    ]
                }
            ],
            "database_content": "Wealth-management book of business, Jan 2024 to Sep 2025"
        }))
        .expect("fixture schema is valid");

        FileSchemaProvider::from_document(document).expect("fixture schema loads")
    }
}
