//! [`ChatSession`] – one reply, end to end.
//!
//! For every [`ChatInput`] the session:
//!
//! 1. validates the request;
//! 2. reads the recent history of the conversation;
//! 3. summarises it and recalls relevant turns (concurrently);
//! 4. builds the persona prompt;
//! 5. invokes the reply models with failover, optionally streaming;
//! 6. persists the user message and the reply as one exchange;
//! 7. re-reads the history for the response.
//!
//! History reads and writes are best-effort: failures are logged and the
//! reply is still returned.  Nothing is persisted unless a complete reply
//! was produced.

use std::sync::Arc;

use persona_memory::MemoryStore;
use persona_types::{ChatError, ChatInput, ChatOutput, ConversationKey, Turn};
use tracing::{debug, info, warn};

use crate::failover::{FailoverInvoker, backend_error};
use crate::llm_driver::{ChatMessage, CompletionRequest};
use crate::prompt::{display_name, persona_prompt};
use crate::summarizer::{Participants, Summarizer};

/// Per-reply tuning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Default (and largest) history window read per request.
    pub history_limit: usize,
    /// Most relevant turns recalled per request.
    pub relevant_limit: usize,
    /// Minimum similarity score for recall.
    pub similarity_threshold: f64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: persona_memory::DEFAULT_CAPACITY,
            relevant_limit: 3,
            similarity_threshold: 0.3,
            temperature: 0.7,
            max_tokens: 200,
            top_p: 0.9,
        }
    }
}

/// Everything gathered before the reply model is called.
struct Prepared {
    key: ConversationKey,
    window: usize,
    memories: String,
    relevant: Vec<String>,
    request: CompletionRequest,
}

/// Orchestrates memory, summarisation and inference for single replies.
pub struct ChatSession {
    memory: Arc<MemoryStore>,
    replies: Arc<FailoverInvoker>,
    summarizer: Summarizer,
    config: SessionConfig,
}

impl ChatSession {
    pub fn new(
        memory: Arc<MemoryStore>,
        replies: Arc<FailoverInvoker>,
        summarizer: Summarizer,
        config: SessionConfig,
    ) -> Self {
        Self {
            memory,
            replies,
            summarizer,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Produce one complete reply.
    pub async fn respond(&self, input: &ChatInput) -> Result<ChatOutput, ChatError> {
        let prepared = self.prepare(input).await?;
        let completion = self.replies.invoke(&prepared.request).await?;
        info!(
            key = %prepared.key,
            backend = %completion.backend,
            failed = completion.failed.len(),
            "reply generated"
        );
        self.finish(input, prepared, completion.text).await
    }

    /// Produce one reply, forwarding each chunk to `on_chunk` as it arrives.
    ///
    /// A failure after the first chunk discards the reply: nothing is
    /// persisted and the error is returned.  An `on_chunk` error means the
    /// consumer went away and is reported as [`ChatError::Cancelled`].
    pub async fn respond_streaming<F>(
        &self,
        input: &ChatInput,
        mut on_chunk: F,
    ) -> Result<ChatOutput, ChatError>
    where
        F: FnMut(&str) -> std::io::Result<()>,
    {
        let prepared = self.prepare(input).await?;
        let mut stream = self.replies.invoke_stream(&prepared.request).await?;
        let backend = stream.backend().to_string();

        let mut reply = String::new();
        while let Some(chunk) = stream.next_chunk().await {
            let chunk = chunk.map_err(|e| {
                warn!(key = %prepared.key, backend = %backend, error = %e, "stream broke; reply discarded");
                backend_error(&backend, e)
            })?;
            on_chunk(chunk.as_str()).map_err(|e| {
                warn!(key = %prepared.key, error = %e, "reply consumer went away");
                ChatError::Cancelled
            })?;
            reply.push_str(&chunk);
        }
        info!(key = %prepared.key, backend = %backend, "streamed reply complete");
        self.finish(input, prepared, reply).await
    }

    async fn prepare(&self, input: &ChatInput) -> Result<Prepared, ChatError> {
        input.validate()?;
        let key = input.conversation_key();
        let window = input
            .his_limit
            .unwrap_or(self.config.history_limit)
            .min(self.config.history_limit)
            .min(self.memory.capacity());

        let history = self.read_history(&key, window).await;
        debug!(key = %key, window, turns = history.len(), "history loaded");

        let participants = Participants {
            user_name: input.user_name(),
            char_name: display_name(&input.character),
            char_behavior: &input.character.behavior,
        };
        let (memories, relevant) = tokio::join!(
            self.summarizer.summarize(&history, &participants),
            self.recall(&key, &input.user),
        );

        let system = persona_prompt(&input.character, input.user_name(), &memories, &relevant);
        let request = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(input.user.as_str()),
        ])
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens)
        .with_top_p(self.config.top_p);

        Ok(Prepared {
            key,
            window,
            memories,
            relevant,
            request,
        })
    }

    async fn finish(
        &self,
        input: &ChatInput,
        prepared: Prepared,
        reply: String,
    ) -> Result<ChatOutput, ChatError> {
        let Prepared {
            key,
            window,
            memories,
            relevant,
            ..
        } = prepared;

        if let Err(e) = self.memory.append_exchange(&key, &input.user, &reply).await {
            let e = ChatError::from(e);
            warn!(key = %key, error = %e, "failed to persist exchange");
        }
        let history = self.read_history(&key, window).await;

        Ok(ChatOutput {
            response: reply,
            memories,
            relevant_memories: relevant,
            history,
        })
    }

    async fn read_history(&self, key: &ConversationKey, window: usize) -> Vec<Turn> {
        self.memory.recent(key, window).await.unwrap_or_else(|e| {
            let e = ChatError::from(e);
            warn!(key = %key, error = %e, "history read failed; continuing without it");
            Vec::new()
        })
    }

    async fn recall(&self, key: &ConversationKey, query: &str) -> Vec<String> {
        match self
            .memory
            .retrieve_relevant(
                key,
                query,
                self.config.relevant_limit,
                self.config.similarity_threshold,
            )
            .await
        {
            Ok(turns) => turns.into_iter().map(|t| t.text).collect(),
            Err(e) => {
                let e = ChatError::from(e);
                warn!(key = %key, error = %e, "recall failed; continuing without it");
                Vec::new()
            }
        }
    }
}
