//! Gemini API client
//!
//! `LanguageModel` backed by Gemini's generateContent endpoint in JSON
//! response mode. Uses a long-lived reqwest::Client for connection pooling.

use crate::error::OrchestrationError;
use crate::llm::{LanguageModel, ModelRequest};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const SYSTEM_PROMPT: &str = r#"You are the reasoning component of a data analytics assistant for a wealth-management firm.

Guidelines:
- Use only the schema, glossary and results provided in the request
- Never invent tables, columns or figures
- Be structured and concise
- Reply with a single JSON object matching the response schema, nothing else"#;

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: &str) -> crate::Result<Self> {
        if api_key.is_empty() {
            return Err(OrchestrationError::Config(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/{}:generateContent", BASE_URL, model),
        })
    }

    async fn generate(&self, prompt: String) -> crate::Result<String> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                top_p: 0.9,
                max_output_tokens: 2048,
                response_mime_type: "application/json",
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: SYSTEM_PROMPT.to_string(),
                }],
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                OrchestrationError::ProviderTransient(format!("Gemini API error: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(classify_status(status, error_text));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            OrchestrationError::MalformedOutput(format!("Gemini parse error: {}", e))
        })?;

        if let Some(usage) = &gemini_response.usage_metadata {
            debug!(
                prompt_tokens = usage.prompt_token_count,
                output_tokens = usage.candidates_token_count,
                "Gemini usage"
            );
        }

        gemini_response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| OrchestrationError::MalformedOutput("Empty response from Gemini".to_string()))
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn invoke(&self, request: ModelRequest) -> crate::Result<Value> {
        let text = self.generate(build_prompt(&request)?).await?;
        parse_json_reply(&text)
    }
}

/// Task, parameters and response schema as one user turn
fn build_prompt(request: &ModelRequest) -> crate::Result<String> {
    Ok(format!(
        "Task ({}): {}\n\nInput:\n{}\n\nResponse JSON schema:\n{}",
        request.kind,
        request.kind.instruction(),
        serde_json::to_string_pretty(&request.params)?,
        serde_json::to_string(&request.schema)?
    ))
}

/// Rate limits and server faults may succeed on retry; anything else is a bad exchange
fn classify_status(status: StatusCode, body: String) -> OrchestrationError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        OrchestrationError::ProviderTransient(format!("Gemini API {}: {}", status, body))
    } else {
        OrchestrationError::MalformedOutput(format!("Gemini API {}: {}", status, body))
    }
}

/// Accepts bare JSON or JSON wrapped in a markdown fence
fn parse_json_reply(text: &str) -> crate::Result<Value> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body)
        .map_err(|e| OrchestrationError::MalformedOutput(format!("reply is not JSON: {}", e)))
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    max_output_tokens: i32,
    response_mime_type: &'static str,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i32,
    #[serde(default)]
    candidates_token_count: i32,
}
