//! Scripted language model for tests and offline runs
//!
//! Responses are queued per prompt kind and consumed in order. A kind with
//! an empty queue falls back to its default response when one is set, and
//! otherwise fails with `MalformedOutput`.

use super::{LanguageModel, ModelRequest, PromptKind};
use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

enum Scripted {
    Reply(Value),
    Transient(String),
}

#[derive(Default)]
pub struct ScriptedModel {
    queues: Mutex<HashMap<PromptKind, VecDeque<Scripted>>>,
    defaults: Mutex<HashMap<PromptKind, Value>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response for `kind`
    pub fn respond(self, kind: PromptKind, response: Value) -> Self {
        self.push(kind, Scripted::Reply(response));
        self
    }

    /// Response used whenever the queue for `kind` is empty
    pub fn respond_always(self, kind: PromptKind, response: Value) -> Self {
        if let Ok(mut defaults) = self.defaults.lock() {
            defaults.insert(kind, response);
        }
        self
    }

    /// Queue a provider failure for `kind`
    pub fn fail(self, kind: PromptKind, message: &str) -> Self {
        self.push(kind, Scripted::Transient(message.to_string()));
        self
    }

    fn push(&self, kind: PromptKind, entry: Scripted) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(kind).or_default().push_back(entry);
        }
    }

    /// Number of calls made for `kind`
    pub fn calls(&self, kind: PromptKind) -> usize {
        self.requests_for(kind).len()
    }

    /// Every request made for `kind`, in call order
    pub fn requests_for(&self, kind: PromptKind) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .map(|r| r.iter().filter(|req| req.kind == kind).cloned().collect())
            .unwrap_or_default()
    }

    /// Total calls across all kinds
    pub fn total_calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn invoke(&self, request: ModelRequest) -> Result<Value> {
        let kind = request.kind;

        self.requests
            .lock()
            .map_err(|_| OrchestrationError::ProviderTransient("scripted model poisoned".into()))?
            .push(request);

        let next = self
            .queues
            .lock()
            .map_err(|_| OrchestrationError::ProviderTransient("scripted model poisoned".into()))?
            .get_mut(&kind)
            .and_then(|q| q.pop_front());

        match next {
            Some(Scripted::Reply(value)) => Ok(value),
            Some(Scripted::Transient(message)) => Err(OrchestrationError::ProviderTransient(message)),
            None => {
                let fallback = self
                    .defaults
                    .lock()
                    .ok()
                    .and_then(|d| d.get(&kind).cloned());
                fallback.ok_or_else(|| {
                    OrchestrationError::MalformedOutput(format!("no scripted response for {}", kind))
                })
            }
        }
    }
}
