//! Scripted [`InferenceBackend`] for tests.
//!
//! Each model name is mapped to a [`Script`] describing how that model
//! behaves.  Every call is recorded so tests can assert which models were
//! attempted, in which order and how often.
//!
//! ```rust
//! use persona_runtime::testing::{Script, ScriptedBackend};
//!
//! let backend = ScriptedBackend::new()
//!     .with("a", Script::RateLimited)
//!     .with("b", Script::Reply("hello".into()));
//! assert_eq!(backend.call_count(), 0);
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use crate::llm_driver::{ChunkStream, CompletionRequest, InferenceBackend, LlmError};

/// How a scripted model answers.
#[derive(Debug, Clone)]
pub enum Script {
    /// Complete with this text; stream it as one chunk.
    Reply(String),
    /// Stream these chunks; complete with their concatenation.
    Chunks(Vec<String>),
    /// Stream these chunks, then fail with HTTP 502.
    BreakAfter(Vec<String>),
    /// HTTP 429.
    RateLimited,
    /// HTTP 503.
    Unavailable,
    /// HTTP 401.
    Unauthorized,
    /// Never answer within any reasonable timeout.
    Hang,
}

/// An [`InferenceBackend`] that follows per-model [`Script`]s.
///
/// Models without a script answer HTTP 404.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, model: &str, script: Script) -> Self {
        self.scripts.insert(model.to_string(), script);
        self
    }

    /// Models called so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    pub fn calls_for(&self, model: &str) -> usize {
        self.calls().iter().filter(|m| *m == model).count()
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn record(&self, model: &str, request: &CompletionRequest) -> Option<Script> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(model.to_string());
        }
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        self.scripts.get(model).cloned()
    }
}

fn status(status: u16) -> LlmError {
    LlmError::Status {
        status,
        body: format!("scripted {status}"),
    }
}

async fn hang() -> LlmError {
    tokio::time::sleep(Duration::from_secs(3600)).await;
    LlmError::Timeout(Duration::from_secs(3600))
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn complete(&self, model: &str, request: &CompletionRequest) -> Result<String, LlmError> {
        match self.record(model, request) {
            Some(Script::Reply(text)) => Ok(text),
            Some(Script::Chunks(chunks)) => Ok(chunks.concat()),
            Some(Script::BreakAfter(_)) => Err(status(502)),
            Some(Script::RateLimited) => Err(status(429)),
            Some(Script::Unavailable) => Err(status(503)),
            Some(Script::Unauthorized) => Err(status(401)),
            Some(Script::Hang) => Err(hang().await),
            None => Err(status(404)),
        }
    }

    async fn stream(&self, model: &str, request: &CompletionRequest) -> Result<ChunkStream, LlmError> {
        match self.record(model, request) {
            Some(Script::Reply(text)) => Ok(stream::iter(vec![Ok(text)]).boxed()),
            Some(Script::Chunks(chunks)) => Ok(stream::iter(chunks.into_iter().map(Ok)).boxed()),
            Some(Script::BreakAfter(chunks)) => {
                let items: Vec<Result<String, LlmError>> =
                    chunks.into_iter().map(Ok).chain([Err(status(502))]).collect();
                Ok(stream::iter(items).boxed())
            }
            Some(Script::RateLimited) => Err(status(429)),
            Some(Script::Unavailable) => Err(status(503)),
            Some(Script::Unauthorized) => Err(status(401)),
            Some(Script::Hang) => Err(hang().await),
            None => Err(status(404)),
        }
    }
}
