//! Engine budgets and process settings
//!
//! `EngineConfig` holds every numeric limit the turn pipeline enforces.
//! `Settings` is read once from the environment (after `dotenv`) by the binaries.

use crate::error::OrchestrationError;
use crate::Result;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Limits applied during a single conversational turn
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum result size (tokens) before a query is refined
    pub token_budget: usize,
    /// Execution attempts per correction cycle (1 original + corrections)
    pub max_execution_attempts: u32,
    /// Refinement attempts per query
    pub max_refinements: u32,
    /// Most recent turns kept verbatim on compaction (low watermark)
    pub history_turns_kept: usize,
    /// History size that triggers compaction (high watermark)
    pub history_token_watermark: usize,
    /// Minimum similarity for fuzzy term matches
    pub fuzzy_threshold: f64,
    pub max_intents: usize,
    pub max_follow_ups: usize,
    pub max_highlights: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            token_budget: 500,
            max_execution_attempts: 3,
            max_refinements: 3,
            history_turns_kept: 4,
            history_token_watermark: 1000,
            fuzzy_threshold: 0.85,
            max_intents: 5,
            max_follow_ups: 2,
            max_highlights: 3,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any budget variables present in the environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = parse_var("TOKEN_BUDGET")? {
            config.token_budget = v;
        }
        if let Some(v) = parse_var("MAX_EXECUTION_ATTEMPTS")? {
            config.max_execution_attempts = v;
        }
        if let Some(v) = parse_var("MAX_REFINEMENTS")? {
            config.max_refinements = v;
        }
        if let Some(v) = parse_var("HISTORY_TOKEN_WATERMARK")? {
            config.history_token_watermark = v;
        }

        if config.max_execution_attempts == 0 {
            return Err(OrchestrationError::Config(
                "MAX_EXECUTION_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Process-wide settings for the binaries
#[derive(Debug, Clone)]
pub struct Settings {
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub database_url: String,
    pub glossary_path: PathBuf,
    pub schema_path: PathBuf,
    pub port: u16,
    pub engine: EngineConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let gemini_api_key = required_var("GEMINI_API_KEY")?;
        let database_url = env::var("DATABASE_URL")
            .or_else(|_| env::var("POSTGRES_URL"))
            .map_err(|_| {
                OrchestrationError::Config("DATABASE_URL (or POSTGRES_URL) not set".to_string())
            })?;

        let port = parse_var::<u16>("PORT")?
            .or(parse_var::<u16>("API_PORT")?)
            .unwrap_or(8080);

        Ok(Self {
            gemini_api_key,
            gemini_model: env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
            database_url,
            glossary_path: env::var("GLOSSARY_PATH")
                .unwrap_or_else(|_| "config/glossary.json".to_string())
                .into(),
            schema_path: env::var("SCHEMA_PATH")
                .unwrap_or_else(|_| "config/schema.json".to_string())
                .into(),
            port,
            engine: EngineConfig::from_env()?,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(OrchestrationError::Config(format!("{} not set", name))),
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| OrchestrationError::Config(format!("{} is not a valid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
