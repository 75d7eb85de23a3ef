//! [`FailoverInvoker`] – ordered model failover.
//!
//! Walks a fresh [`BackendRegistry`] for every request, invoking each
//! available backend in priority order until one answers:
//!
//! ```text
//! Start ─► SelectBackend ─► Attempting ─┬─► Success
//!              ▲   │                    ├─► Transient ──────────────┐
//!              │   └─► (none) Exhausted └─► Fatal ─┬─ permissive ───┤
//!              │                                   └─ strict ─► Aborted
//!              └────────────────────────────────────────────────────┘
//! ```
//!
//! Every attempt is bounded by a per-attempt timeout; hitting it counts as a
//! transient failure.  A failed backend is marked unavailable and never
//! retried within the same sequence.
//!
//! Streaming ([`FailoverInvoker::invoke_stream`]) runs the same loop over
//! opening the stream and receiving its first non-blank chunk.  After that the stream
//! is committed to its backend and a later failure ends the reply.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use persona_types::ChatError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::llm_driver::{ChunkStream, CompletionRequest, InferenceBackend, LlmError};
use crate::registry::BackendRegistry;

/// Default bound on a single backend attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// Policy and results
// ─────────────────────────────────────────────────────────────────────────────

/// What to do after a non-transient (fatal) backend failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Demote the backend and keep trying the rest.
    #[default]
    Permissive,
    /// Abort the whole sequence.
    Strict,
}

/// One failed backend attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    pub backend: String,
    pub reason: String,
    pub transient: bool,
}

/// A successful completion and the attempts that failed before it.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub backend: String,
    pub failed: Vec<FailedAttempt>,
}

/// Errors returned by [`FailoverInvoker`].
#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("all backends exhausted ({} failed attempts)", attempts.len())]
    AllBackendsExhausted { attempts: Vec<FailedAttempt> },

    #[error("backend {backend} failed: {source}")]
    Fatal {
        backend: String,
        #[source]
        source: LlmError,
    },
}

impl From<InvokeError> for ChatError {
    fn from(err: InvokeError) -> Self {
        match err {
            InvokeError::AllBackendsExhausted { attempts } => ChatError::AllBackendsExhausted {
                attempted: attempts.into_iter().map(|a| a.backend).collect(),
            },
            InvokeError::Fatal { backend, source } => ChatError::FatalBackend {
                backend,
                reason: source.to_string(),
            },
        }
    }
}

/// Map a committed-stream failure to the global error type.
pub fn backend_error(backend: &str, err: LlmError) -> ChatError {
    if err.is_transient() {
        ChatError::TransientBackend {
            backend: backend.to_string(),
            reason: err.to_string(),
        }
    } else {
        ChatError::FatalBackend {
            backend: backend.to_string(),
            reason: err.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ReplyStream
// ─────────────────────────────────────────────────────────────────────────────

/// A streamed reply committed to one backend.
pub struct ReplyStream {
    backend: String,
    first: Option<String>,
    inner: ChunkStream,
    chunk_timeout: Duration,
    failed: Vec<FailedAttempt>,
}

impl ReplyStream {
    /// The backend producing this reply.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Attempts that failed before this stream was opened.
    pub fn failed(&self) -> &[FailedAttempt] {
        &self.failed
    }

    /// The next chunk, `None` once the reply is complete.
    ///
    /// Each wait is bounded by the attempt timeout.
    pub async fn next_chunk(&mut self) -> Option<Result<String, LlmError>> {
        if let Some(first) = self.first.take() {
            return Some(Ok(first));
        }
        match timeout(self.chunk_timeout, self.inner.next()).await {
            Ok(item) => item,
            Err(_) => Some(Err(LlmError::Timeout(self.chunk_timeout))),
        }
    }

    /// Drain the stream into the full reply text.
    pub async fn collect_text(mut self) -> Result<String, LlmError> {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FailoverInvoker
// ─────────────────────────────────────────────────────────────────────────────

/// Invokes an ordered list of models with failover.
///
/// ```rust
/// use std::sync::Arc;
/// use persona_runtime::failover::FailoverInvoker;
/// use persona_runtime::llm_driver::{ChatMessage, CompletionRequest};
/// use persona_runtime::testing::{Script, ScriptedBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = Arc::new(
///     ScriptedBackend::new()
///         .with("fast", Script::RateLimited)
///         .with("steady", Script::Reply("hello".into())),
/// );
/// let invoker = FailoverInvoker::new(backend, vec!["fast".into(), "steady".into()]);
/// let request = CompletionRequest::new(vec![ChatMessage::user("hi")]);
///
/// let completion = invoker.invoke(&request).await.unwrap();
/// assert_eq!(completion.text, "hello");
/// assert_eq!(completion.backend, "steady");
/// # });
/// ```
pub struct FailoverInvoker {
    client: Arc<dyn InferenceBackend>,
    models: Vec<String>,
    policy: FailurePolicy,
    attempt_timeout: Duration,
}

impl FailoverInvoker {
    pub fn new(client: Arc<dyn InferenceBackend>, models: Vec<String>) -> Self {
        Self {
            client,
            models,
            policy: FailurePolicy::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// A fresh registry over the configured models.
    pub fn registry(&self) -> BackendRegistry {
        BackendRegistry::new(&self.models)
    }

    /// Run `request` with failover over a fresh registry.
    pub async fn invoke(&self, request: &CompletionRequest) -> Result<Completion, InvokeError> {
        let mut registry = self.registry();
        self.invoke_with(&mut registry, request).await
    }

    /// Run `request` with failover over `registry`, leaving failed backends
    /// marked unavailable in it.
    pub async fn invoke_with(
        &self,
        registry: &mut BackendRegistry,
        request: &CompletionRequest,
    ) -> Result<Completion, InvokeError> {
        let mut failed = Vec::new();
        while let Some(name) = registry.next_available().map(|b| b.name.clone()) {
            debug!(backend = %name, "attempting completion");
            let outcome = timeout(self.attempt_timeout, self.client.complete(&name, request))
                .await
                .unwrap_or(Err(LlmError::Timeout(self.attempt_timeout)));
            match outcome {
                Ok(text) => {
                    info!(backend = %name, failed = failed.len(), "completion succeeded");
                    return Ok(Completion {
                        text,
                        backend: name,
                        failed,
                    });
                }
                Err(err) => self.demote(registry, &name, err, &mut failed)?,
            }
        }
        warn!(attempts = failed.len(), "all backends exhausted");
        Err(InvokeError::AllBackendsExhausted { attempts: failed })
    }

    /// Open a streamed reply with failover over a fresh registry.
    pub async fn invoke_stream(&self, request: &CompletionRequest) -> Result<ReplyStream, InvokeError> {
        let mut registry = self.registry();
        self.invoke_stream_with(&mut registry, request).await
    }

    /// Open a streamed reply with failover over `registry`.
    ///
    /// A backend counts as successful once its first non-blank chunk
    /// arrives; leading whitespace is held back and delivered with it.
    pub async fn invoke_stream_with(
        &self,
        registry: &mut BackendRegistry,
        request: &CompletionRequest,
    ) -> Result<ReplyStream, InvokeError> {
        let mut failed = Vec::new();
        while let Some(name) = registry.next_available().map(|b| b.name.clone()) {
            debug!(backend = %name, "opening stream");
            let opened = timeout(self.attempt_timeout, self.open_stream(&name, request))
                .await
                .unwrap_or(Err(LlmError::Timeout(self.attempt_timeout)));
            match opened {
                Ok((first, inner)) => {
                    info!(backend = %name, failed = failed.len(), "stream opened");
                    return Ok(ReplyStream {
                        backend: name,
                        first: Some(first),
                        inner,
                        chunk_timeout: self.attempt_timeout,
                        failed,
                    });
                }
                Err(err) => self.demote(registry, &name, err, &mut failed)?,
            }
        }
        warn!(attempts = failed.len(), "all backends exhausted");
        Err(InvokeError::AllBackendsExhausted { attempts: failed })
    }

    async fn open_stream(
        &self,
        name: &str,
        request: &CompletionRequest,
    ) -> Result<(String, ChunkStream), LlmError> {
        let mut stream = self.client.stream(name, request).await?;
        let mut first = String::new();
        while let Some(chunk) = stream.next().await {
            first.push_str(&chunk?);
            if !first.trim().is_empty() {
                return Ok((first, stream));
            }
        }
        Err(LlmError::BadResponse("stream ended before any content".into()))
    }

    /// Mark `name` unavailable and decide whether the sequence continues.
    fn demote(
        &self,
        registry: &mut BackendRegistry,
        name: &str,
        err: LlmError,
        failed: &mut Vec<FailedAttempt>,
    ) -> Result<(), InvokeError> {
        registry.mark_unavailable(name);
        let transient = err.is_transient();
        if !transient && self.policy == FailurePolicy::Strict {
            warn!(backend = %name, error = %err, "fatal backend failure; aborting");
            return Err(InvokeError::Fatal {
                backend: name.to_string(),
                source: err,
            });
        }
        warn!(backend = %name, transient, error = %err, "backend failed; trying next");
        failed.push(FailedAttempt {
            backend: name.to_string(),
            reason: err.to_string(),
            transient,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_driver::ChatMessage;
    use crate::testing::{Script, ScriptedBackend};

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("hi")])
    }

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn abcd() -> Arc<ScriptedBackend> {
        Arc::new(
            ScriptedBackend::new()
                .with("A", Script::RateLimited)
                .with("B", Script::Unavailable)
                .with("C", Script::Reply("from C".into()))
                .with("D", Script::Reply("from D".into())),
        )
    }

    #[tokio::test]
    async fn first_success_wins_and_later_backends_are_untouched() {
        let backend = abcd();
        let invoker = FailoverInvoker::new(backend.clone(), models(&["A", "B", "C", "D"]));
        let mut registry = invoker.registry();

        let completion = invoker.invoke_with(&mut registry, &request()).await.unwrap();

        assert_eq!(completion.text, "from C");
        assert_eq!(completion.backend, "C");
        assert_eq!(backend.calls(), vec!["A", "B", "C"]);
        assert_eq!(backend.calls_for("D"), 0);
        let failed: Vec<_> = completion.failed.iter().map(|f| f.backend.as_str()).collect();
        assert_eq!(failed, vec!["A", "B"]);
        assert!(completion.failed.iter().all(|f| f.transient));

        let states: Vec<_> = registry.backends().iter().map(|b| (b.name.as_str(), b.available)).collect();
        assert_eq!(states, vec![("A", false), ("B", false), ("C", true), ("D", true)]);
    }

    #[tokio::test]
    async fn all_transient_failures_exhaust() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with("A", Script::RateLimited)
                .with("B", Script::Unavailable),
        );
        let invoker = FailoverInvoker::new(backend.clone(), models(&["A", "B"]));

        let err = invoker.invoke(&request()).await.unwrap_err();

        match err {
            InvokeError::AllBackendsExhausted { attempts } => {
                let names: Vec<_> = attempts.iter().map(|a| a.backend.as_str()).collect();
                assert_eq!(names, vec!["A", "B"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn each_backend_is_attempted_at_most_once() {
        let backend = Arc::new(ScriptedBackend::new().with("A", Script::RateLimited));
        let invoker = FailoverInvoker::new(backend.clone(), models(&["A", "A", "A"]));
        assert!(invoker.invoke(&request()).await.is_err());
        assert_eq!(backend.calls_for("A"), 1);
    }

    #[tokio::test]
    async fn permissive_policy_skips_fatal_backend() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with("A", Script::Unauthorized)
                .with("B", Script::Reply("ok".into())),
        );
        let invoker = FailoverInvoker::new(backend, models(&["A", "B"]));
        let completion = invoker.invoke(&request()).await.unwrap();
        assert_eq!(completion.backend, "B");
        assert!(!completion.failed[0].transient);
    }

    #[tokio::test]
    async fn strict_policy_aborts_on_fatal_backend() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with("A", Script::Unauthorized)
                .with("B", Script::Reply("ok".into())),
        );
        let invoker =
            FailoverInvoker::new(backend.clone(), models(&["A", "B"])).with_policy(FailurePolicy::Strict);

        let err = invoker.invoke(&request()).await.unwrap_err();

        assert!(matches!(err, InvokeError::Fatal { ref backend, .. } if backend == "A"));
        assert_eq!(backend.calls_for("B"), 0);
        let chat: ChatError = err.into();
        assert_eq!(chat.exit_code(), 4);
    }

    #[tokio::test]
    async fn strict_policy_still_fails_over_on_transient_errors() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with("A", Script::RateLimited)
                .with("B", Script::Reply("ok".into())),
        );
        let invoker = FailoverInvoker::new(backend, models(&["A", "B"])).with_policy(FailurePolicy::Strict);
        assert_eq!(invoker.invoke(&request()).await.unwrap().backend, "B");
    }

    #[tokio::test]
    async fn hanging_backend_times_out_as_transient() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with("slow", Script::Hang)
                .with("B", Script::Reply("ok".into())),
        );
        let invoker = FailoverInvoker::new(backend, models(&["slow", "B"]))
            .with_policy(FailurePolicy::Strict)
            .with_attempt_timeout(Duration::from_millis(50));

        let completion = invoker.invoke(&request()).await.unwrap();

        assert_eq!(completion.backend, "B");
        assert!(completion.failed[0].transient);
    }

    #[tokio::test]
    async fn empty_model_list_exhausts_immediately() {
        let invoker = FailoverInvoker::new(Arc::new(ScriptedBackend::new()), Vec::new());
        let err = invoker.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, InvokeError::AllBackendsExhausted { ref attempts } if attempts.is_empty()));
    }

    #[tokio::test]
    async fn exhausted_maps_to_chat_error_with_names() {
        let backend = Arc::new(ScriptedBackend::new());
        let invoker = FailoverInvoker::new(backend, models(&["x", "y"]));
        let chat: ChatError = invoker.invoke(&request()).await.unwrap_err().into();
        assert!(matches!(
            chat,
            ChatError::AllBackendsExhausted { ref attempted } if attempted == &["x", "y"]
        ));
    }

    #[tokio::test]
    async fn stream_fails_over_before_first_chunk() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with("A", Script::RateLimited)
                .with("B", Script::Chunks(vec!["Hel".into(), "lo".into()])),
        );
        let invoker = FailoverInvoker::new(backend.clone(), models(&["A", "B"]));

        let stream = invoker.invoke_stream(&request()).await.unwrap();

        assert_eq!(stream.backend(), "B");
        assert_eq!(stream.failed().len(), 1);
        assert_eq!(stream.collect_text().await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn empty_stream_counts_as_failure() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with("A", Script::Chunks(Vec::new()))
                .with("B", Script::Reply("ok".into())),
        );
        let invoker = FailoverInvoker::new(backend, models(&["A", "B"]));
        let stream = invoker.invoke_stream(&request()).await.unwrap();
        assert_eq!(stream.backend(), "B");
    }

    #[tokio::test]
    async fn whitespace_only_stream_counts_as_failure() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with("A", Script::Chunks(vec!["\n".into(), "  ".into()]))
                .with("B", Script::Reply("real reply".into())),
        );
        let invoker = FailoverInvoker::new(backend, models(&["A", "B"]));

        let stream = invoker.invoke_stream(&request()).await.unwrap();

        assert_eq!(stream.backend(), "B");
        assert_eq!(stream.failed()[0].backend, "A");
        assert_eq!(stream.collect_text().await.unwrap(), "real reply");
    }

    #[tokio::test]
    async fn leading_whitespace_is_kept_with_first_content() {
        let backend = Arc::new(
            ScriptedBackend::new().with("A", Script::Chunks(vec!["\n".into(), "Hi".into(), " there".into()])),
        );
        let invoker = FailoverInvoker::new(backend, models(&["A"]));
        let stream = invoker.invoke_stream(&request()).await.unwrap();
        assert_eq!(stream.collect_text().await.unwrap(), "\nHi there");
    }

    #[tokio::test]
    async fn committed_stream_surfaces_mid_stream_failure() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with("A", Script::BreakAfter(vec!["par".into(), "tial".into()]))
                .with("B", Script::Reply("never".into())),
        );
        let invoker = FailoverInvoker::new(backend.clone(), models(&["A", "B"]));

        let mut stream = invoker.invoke_stream(&request()).await.unwrap();
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "par");
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "tial");
        let err = stream.next_chunk().await.unwrap().unwrap_err();

        assert!(err.is_transient());
        assert_eq!(backend.calls_for("B"), 0);
        assert!(matches!(backend_error("A", err), ChatError::TransientBackend { .. }));
    }

    #[tokio::test]
    async fn hanging_stream_open_times_out() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with("slow", Script::Hang)
                .with("B", Script::Reply("ok".into())),
        );
        let invoker = FailoverInvoker::new(backend, models(&["slow", "B"]))
            .with_attempt_timeout(Duration::from_millis(50));
        let stream = invoker.invoke_stream(&request()).await.unwrap();
        assert_eq!(stream.backend(), "B");
    }

    #[test]
    fn failure_policy_parses_lowercase() {
        let p: FailurePolicy = serde_json::from_str("\"strict\"").unwrap();
        assert_eq!(p, FailurePolicy::Strict);
        assert_eq!(FailurePolicy::default(), FailurePolicy::Permissive);
    }
}
