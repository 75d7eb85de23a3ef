//! `persona-runtime` – Replies for a character chat.
//!
//! Turns one chat request into one in-character reply, using a hosted
//! OpenAI-compatible inference API with ordered model failover and the
//! conversation memory from `persona-memory`.
//!
//! # Modules
//!
//! - [`session`] – [`ChatSession`][session::ChatSession]: the per-request
//!   orchestrator (history → summary + recall → prompt → reply → persist).
//! - [`failover`] – [`FailoverInvoker`][failover::FailoverInvoker]: walks the
//!   candidate models in priority order, demoting failing ones, for both
//!   complete and streamed replies.
//! - [`registry`] – [`BackendRegistry`][registry::BackendRegistry]: candidate
//!   models with per-sequence availability.
//! - [`llm_driver`] – [`LlmDriver`][llm_driver::LlmDriver]: the HTTP client for
//!   `/v1/chat/completions`, including the server-sent-events decoder, behind
//!   the [`InferenceBackend`][llm_driver::InferenceBackend] trait.
//! - [`summarizer`] – [`Summarizer`][summarizer::Summarizer]: bounded,
//!   failure-tolerant conversation digests.
//! - [`annotate`] – scenario and emotion hints from roleplay markup.
//! - [`prompt`] – the persona system prompt.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: stderr logging
//!   with optional OTLP span export.
//! - [`testing`] – [`ScriptedBackend`][testing::ScriptedBackend], a scripted
//!   inference backend for tests.

pub mod annotate;
pub mod failover;
pub mod llm_driver;
pub mod prompt;
pub mod registry;
pub mod session;
pub mod summarizer;
pub mod telemetry;
pub mod testing;

pub use failover::{Completion, FailedAttempt, FailoverInvoker, FailurePolicy, InvokeError, ReplyStream};
pub use llm_driver::{ChatMessage, CompletionRequest, InferenceBackend, LlmDriver, LlmError, Role};
pub use registry::{Backend, BackendRegistry};
pub use session::{ChatSession, SessionConfig};
pub use summarizer::{NO_MEMORIES, SUMMARY_UNAVAILABLE, Summarizer};
