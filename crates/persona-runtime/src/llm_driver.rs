//! [`LlmDriver`] – OpenAI-compatible inference client.
//!
//! Talks to any hosted service exposing an OpenAI-compatible
//! `/v1/chat/completions` endpoint (Groq by default).  Every call names the
//! model explicitly, so one driver serves every candidate model in a
//! failover sequence.
//!
//! The [`InferenceBackend`] trait is the seam the
//! [`FailoverInvoker`][crate::failover::FailoverInvoker] calls through; tests
//! substitute scripted backends for the HTTP driver.
//!
//! # Example
//!
//! ```rust,no_run
//! use persona_runtime::llm_driver::{ChatMessage, CompletionRequest, InferenceBackend, LlmDriver};
//!
//! # async fn demo() -> Result<(), persona_runtime::LlmError> {
//! let driver = LlmDriver::new("https://api.groq.com/openai", Some("gsk-...".to_string()));
//! let request = CompletionRequest::new(vec![
//!     ChatMessage::system("You are Nova, a curious novelist."),
//!     ChatMessage::user("hi"),
//! ]);
//! // Requires network access and a valid key.
//! let reply = driver.complete("llama-3.1-8b-instant", &request).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Groq's OpenAI-compatible API root.
pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai";

/// Longest slice of an error body kept in [`LlmError::Status`].
const MAX_ERROR_BODY: usize = 512;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from one inference attempt.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request could not be completed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The backend answered with a non-success status.
    #[error("Backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// The response from the backend could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
    /// The attempt did not finish within its time budget.
    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl LlmError {
    /// `true` for rate limits, timeouts, connection failures and server-side
    /// errors; `false` for authentication and malformed-request failures.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| is_transient_status(s.as_u16()))
            }
            LlmError::Status { status, .. } => is_transient_status(*status),
            LlmError::BadResponse(_) => false,
            LlmError::Timeout(_) => true,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

/// The role of a participant in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Everything an inference call needs except the model name.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: 0.7,
            max_tokens: 200,
            top_p: 1.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// InferenceBackend
// ─────────────────────────────────────────────────────────────────────────────

/// Lazily produced reply text fragments.
pub type ChunkStream = BoxStream<'static, Result<String, LlmError>>;

/// A hosted service able to run chat completions for named models.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Run `request` against `model` and return the full reply.
    async fn complete(&self, model: &str, request: &CompletionRequest) -> Result<String, LlmError>;

    /// Run `request` against `model`, delivering the reply incrementally.
    ///
    /// The default implementation waits for [`complete`][Self::complete] and
    /// yields its reply as a single chunk.
    async fn stream(&self, model: &str, request: &CompletionRequest) -> Result<ChunkStream, LlmError> {
        let reply = self.complete(model, request).await?;
        Ok(stream::once(async move { Ok::<_, LlmError>(reply) }).boxed())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for an OpenAI-compatible chat-completions endpoint.
pub struct LlmDriver {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl LlmDriver {
    /// Create a driver for `base_url` (e.g. `"https://api.groq.com/openai"`),
    /// authenticating with `api_key` as a bearer token when given.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn send(
        &self,
        model: &str,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let body = ChatRequest {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stream,
        };
        let mut builder = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if let Some((cut, _)) = body.char_indices().nth(MAX_ERROR_BODY) {
                body.truncate(cut);
            }
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl InferenceBackend for LlmDriver {
    /// # Errors
    ///
    /// Returns [`LlmError::Http`] if the request fails, [`LlmError::Status`]
    /// for non-success answers, or [`LlmError::BadResponse`] if the response
    /// shape is unexpected or the reply is empty.
    async fn complete(&self, model: &str, request: &CompletionRequest) -> Result<String, LlmError> {
        let response: ChatResponse = self.send(model, request, false).await?.json().await?;
        let reply = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(LlmError::BadResponse("empty reply".into()));
        }
        Ok(reply.to_string())
    }

    async fn stream(&self, model: &str, request: &CompletionRequest) -> Result<ChunkStream, LlmError> {
        let response = self.send(model, request, true).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(LlmError::from));
        Ok(decode_sse(body))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server-sent events
// ─────────────────────────────────────────────────────────────────────────────

/// One decoded event of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
}

/// Incremental decoder for `data:` lines of a streamed completion.
///
/// Bytes may be fed in arbitrary pieces; lines (and UTF-8 sequences) split
/// across pieces are reassembled.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, LlmError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                events.push(SseEvent::Done);
                continue;
            }
            let chunk: StreamChunk = serde_json::from_str(data)
                .map_err(|e| LlmError::BadResponse(format!("stream chunk: {e}")))?;
            if let Some(text) = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .filter(|t| !t.is_empty())
            {
                events.push(SseEvent::Delta(text));
            }
        }
        Ok(events)
    }
}

struct SseState {
    body: BoxStream<'static, Result<Vec<u8>, LlmError>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String, LlmError>>,
    finished: bool,
}

/// Turn a raw SSE byte stream into a stream of reply deltas.
///
/// The stream ends at `data: [DONE]` or when the body ends.  A transport or
/// decode error is yielded once and ends the stream.
pub fn decode_sse<S>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<Vec<u8>, LlmError>> + Send + 'static,
{
    let state = SseState {
        body: body.boxed(),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => match st.decoder.feed(&bytes) {
                    Ok(events) => {
                        for event in events {
                            match event {
                                SseEvent::Delta(text) => st.pending.push_back(Ok(text)),
                                SseEvent::Done => {
                                    st.finished = true;
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        st.finished = true;
                        st.pending.push_back(Err(e));
                    }
                },
                Some(Err(e)) => {
                    st.finished = true;
                    st.pending.push_back(Err(e));
                }
                None => st.finished = true,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn delta_line(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    #[test]
    fn chat_message_serializes_role() {
        let json = serde_json::to_string(&ChatMessage::system("hello")).unwrap();
        assert!(json.contains("\"system\""));
    }

    #[test]
    fn request_body_carries_sampling_parameters() {
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")])
            .with_temperature(0.5)
            .with_max_tokens(64)
            .with_top_p(0.9);
        let body = ChatRequest {
            model: "m",
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "m");
        assert_eq!(json["max_tokens"], 64);
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        let driver = LlmDriver::new("https://example.test/openai/", None);
        assert_eq!(driver.endpoint(), "https://example.test/openai/v1/chat/completions");
    }

    #[test]
    fn transient_classification() {
        let status = |status| LlmError::Status {
            status,
            body: String::new(),
        };
        assert!(status(429).is_transient());
        assert!(status(503).is_transient());
        assert!(status(408).is_transient());
        assert!(!status(401).is_transient());
        assert!(!status(400).is_transient());
        assert!(LlmError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!LlmError::BadResponse("x".into()).is_transient());
    }

    #[test]
    fn decoder_reassembles_split_lines() {
        let mut decoder = SseDecoder::default();
        let line = delta_line("Hello");
        let (a, b) = line.split_at(10);
        assert!(decoder.feed(a.as_bytes()).unwrap().is_empty());
        assert_eq!(
            decoder.feed(b.as_bytes()).unwrap(),
            vec![SseEvent::Delta("Hello".into())]
        );
    }

    #[test]
    fn decoder_reassembles_split_utf8() {
        let mut decoder = SseDecoder::default();
        let line = delta_line("café");
        let bytes = line.as_bytes();
        let cut = line.find('é').unwrap() + 1;
        assert!(decoder.feed(&bytes[..cut]).unwrap().is_empty());
        assert_eq!(
            decoder.feed(&bytes[cut..]).unwrap(),
            vec![SseEvent::Delta("café".into())]
        );
    }

    #[test]
    fn decoder_skips_role_only_chunks_and_comments() {
        let mut decoder = SseDecoder::default();
        let input = format!(
            ": keep-alive\n\ndata: {}\n\n{}data: [DONE]\n\n",
            serde_json::json!({"choices": [{"delta": {"role": "assistant"}}]}),
            delta_line("hi")
        );
        assert_eq!(
            decoder.feed(input.as_bytes()).unwrap(),
            vec![SseEvent::Delta("hi".into()), SseEvent::Done]
        );
    }

    #[test]
    fn decoder_rejects_garbage_data() {
        let mut decoder = SseDecoder::default();
        assert!(matches!(
            decoder.feed(b"data: {not json}\n"),
            Err(LlmError::BadResponse(_))
        ));
    }

    #[tokio::test]
    async fn decode_sse_stops_at_done() {
        let body = format!("{}{}data: [DONE]\n\n{}", delta_line("a"), delta_line("b"), delta_line("ignored"));
        let pieces: Vec<Result<Vec<u8>, LlmError>> = body
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(c.to_vec()))
            .collect();
        let chunks: Vec<String> = decode_sse(stream::iter(pieces))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn decode_sse_surfaces_transport_error_once() {
        let pieces: Vec<Result<Vec<u8>, LlmError>> = vec![
            Ok(delta_line("partial").into_bytes()),
            Err(LlmError::Timeout(Duration::from_millis(5))),
            Ok(delta_line("never").into_bytes()),
        ];
        let items: Vec<Result<String, LlmError>> = decode_sse(stream::iter(pieces)).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert!(matches!(items[1], Err(LlmError::Timeout(_))));
    }

    #[test]
    fn driver_constructed_without_panic() {
        let _driver = LlmDriver::new(DEFAULT_BASE_URL, None);
    }

    // ── HTTP path against a local server ────────────────────────────────────

    fn hello() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn complete_posts_request_and_parses_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({"model": "m1", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "  Hello there. "}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let driver = LlmDriver::new(format!("{}/", server.uri()), Some("secret".into()));
        let reply = driver.complete("m1", &hello()).await.unwrap();

        assert_eq!(reply, "Hello there.");
    }

    #[tokio::test]
    async fn non_success_status_maps_to_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("x".repeat(2_000)))
            .mount(&server)
            .await;

        let driver = LlmDriver::new(server.uri(), None);
        let err = driver.complete("m1", &hello()).await.unwrap_err();

        match err {
            LlmError::Status { status, ref body } => {
                assert_eq!(status, 429);
                assert_eq!(body.chars().count(), MAX_ERROR_BODY);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unauthorized_is_not_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = LlmDriver::new(server.uri(), None).complete("m1", &hello()).await.unwrap_err();

        assert!(matches!(err, LlmError::Status { status: 401, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn blank_or_missing_reply_is_bad_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"model": "blank"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "   "}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"model": "none"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let driver = LlmDriver::new(server.uri(), None);
        assert!(matches!(
            driver.complete("blank", &hello()).await,
            Err(LlmError::BadResponse(_))
        ));
        assert!(matches!(
            driver.complete("none", &hello()).await,
            Err(LlmError::BadResponse(_))
        ));
    }

    #[tokio::test]
    async fn stream_decodes_event_stream_body() {
        let server = MockServer::start().await;
        let body = format!("{}{}data: [DONE]\n\n", delta_line("Hel"), delta_line("lo"));
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "m1", "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let driver = LlmDriver::new(server.uri(), None);
        let chunks: Vec<String> = driver
            .stream("m1", &hello())
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn stream_open_surfaces_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = LlmDriver::new(server.uri(), None)
            .stream("m1", &hello())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, LlmError::Status { status: 503, .. }));
        assert!(err.is_transient());
    }
}
