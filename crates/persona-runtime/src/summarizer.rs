//! [`Summarizer`] – compact digest of a conversation.
//!
//! The digest is produced by the language model from the newest few turns.
//! Input is bounded twice: at most [`MAX_SUMMARY_TURNS`] turns, each cut to
//! [`MAX_TURN_CHARS`] characters.  Both limits can be lowered at
//! construction but never raised.  Scene and emotion hints are read from the
//! same bounded text, so nothing outside the window reaches the model.
//!
//! Summarisation never fails the reply flow.  An empty history yields
//! [`NO_MEMORIES`]; any inference failure yields [`SUMMARY_UNAVAILABLE`].

use std::sync::Arc;

use persona_types::{Sender, Turn};
use tracing::{debug, warn};

use crate::annotate::{self, Annotations};
use crate::failover::FailoverInvoker;
use crate::llm_driver::{ChatMessage, CompletionRequest};

pub const NO_MEMORIES: &str = "*No memories formed yet.*";
pub const SUMMARY_UNAVAILABLE: &str = "*Summary unavailable.*";

/// Most turns included in one summary.
pub const MAX_SUMMARY_TURNS: usize = 5;
/// Longest per-turn text included, in characters.
pub const MAX_TURN_CHARS: usize = 200;

const SUMMARY_TEMPERATURE: f32 = 0.5;
const SUMMARY_MAX_TOKENS: u32 = 200;

/// Who is talking, for labelling the transcript.
#[derive(Debug, Clone, Copy)]
pub struct Participants<'a> {
    pub user_name: &'a str,
    pub char_name: &'a str,
    pub char_behavior: &'a str,
}

/// Produces conversation digests through a [`FailoverInvoker`].
pub struct Summarizer {
    invoker: Arc<FailoverInvoker>,
    max_turns: usize,
    max_chars: usize,
}

impl Summarizer {
    pub fn new(invoker: Arc<FailoverInvoker>) -> Self {
        Self {
            invoker,
            max_turns: MAX_SUMMARY_TURNS,
            max_chars: MAX_TURN_CHARS,
        }
    }

    /// Tighten the input bounds; values above the defaults are clamped.
    pub fn with_limits(mut self, max_turns: usize, max_chars: usize) -> Self {
        self.max_turns = max_turns.clamp(1, MAX_SUMMARY_TURNS);
        self.max_chars = max_chars.clamp(1, MAX_TURN_CHARS);
        self
    }

    pub fn limits(&self) -> (usize, usize) {
        (self.max_turns, self.max_chars)
    }

    /// Render the bounded transcript, oldest first.
    ///
    /// `turns` are newest first, as returned by the memory store.
    pub fn transcript(&self, turns: &[Turn], participants: &Participants<'_>) -> String {
        let mut lines: Vec<String> = self
            .bounded(turns)
            .map(|(sender, text)| {
                let speaker = match sender {
                    Sender::User => participants.user_name,
                    Sender::Agent => participants.char_name,
                };
                format!("{speaker}: {text}")
            })
            .collect();
        lines.reverse();
        lines.join("\n")
    }

    /// The newest `max_turns` turns, each cut to `max_chars`.
    fn bounded<'a>(&self, turns: &'a [Turn]) -> impl Iterator<Item = (Sender, String)> + 'a {
        let max_chars = self.max_chars;
        turns
            .iter()
            .take(self.max_turns)
            .map(move |turn| (turn.sender, turn.text.chars().take(max_chars).collect()))
    }

    /// Summarise `turns` (newest first).
    pub async fn summarize(&self, turns: &[Turn], participants: &Participants<'_>) -> String {
        if turns.is_empty() {
            return NO_MEMORIES.to_string();
        }
        let window: Vec<String> = self.bounded(turns).map(|(_, text)| text).collect();
        let hints = annotate::collect(window.iter().map(String::as_str));
        let request = CompletionRequest::new(vec![
            ChatMessage::system(instructions(participants, &hints)),
            ChatMessage::user(self.transcript(turns, participants)),
        ])
        .with_temperature(SUMMARY_TEMPERATURE)
        .with_max_tokens(SUMMARY_MAX_TOKENS);

        match self.invoker.invoke(&request).await {
            Ok(completion) => {
                let summary = completion.text.trim();
                if summary.is_empty() {
                    SUMMARY_UNAVAILABLE.to_string()
                } else {
                    debug!(backend = %completion.backend, "summary generated");
                    summary.to_string()
                }
            }
            Err(e) => {
                warn!(error = %e, "summary generation failed");
                SUMMARY_UNAVAILABLE.to_string()
            }
        }
    }
}

fn instructions(participants: &Participants<'_>, hints: &Annotations) -> String {
    let Participants {
        user_name,
        char_name,
        char_behavior,
    } = participants;
    let mut text = format!(
        "Summarise the conversation between {user_name} and {char_name} \
         ({char_behavior}) in at most three short sections:\n\
         1. Scenario: where they are and what is happening.\n\
         2. Emotions: how {user_name} and {char_name} each feel.\n\
         3. Key memories: facts worth remembering later.\n\
         Be brief and factual."
    );
    if !hints.scenarios.is_empty() {
        let scenes: Vec<&str> = hints.scenarios.iter().map(String::as_str).collect();
        text.push_str(&format!("\nScene hints: {}", scenes.join("; ")));
    }
    if !hints.emotions.is_empty() {
        let emotions: Vec<&str> = hints.emotions.iter().map(String::as_str).collect();
        text.push_str(&format!("\nEmotion hints: {}", emotions.join("; ")));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_driver::Role;
    use crate::testing::{Script, ScriptedBackend};
    use persona_types::ConversationKey;

    const PEOPLE: Participants<'static> = Participants {
        user_name: "Ava",
        char_name: "Nova",
        char_behavior: "playful",
    };

    fn turns_newest_first(texts: &[(Sender, &str)]) -> Vec<Turn> {
        let key = ConversationKey::new("u1", "c1");
        let mut turns: Vec<Turn> = texts
            .iter()
            .map(|(sender, text)| Turn::new(key.clone(), *sender, *text))
            .collect();
        turns.reverse();
        turns
    }

    fn summarizer(backend: Arc<ScriptedBackend>) -> Summarizer {
        Summarizer::new(Arc::new(FailoverInvoker::new(backend, vec!["m".into()])))
    }

    #[tokio::test]
    async fn empty_history_uses_placeholder_without_calling_backend() {
        let backend = Arc::new(ScriptedBackend::new().with("m", Script::Reply("x".into())));
        let summary = summarizer(backend.clone()).summarize(&[], &PEOPLE).await;
        assert_eq!(summary, NO_MEMORIES);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn failure_degrades_to_placeholder() {
        let backend = Arc::new(ScriptedBackend::new().with("m", Script::RateLimited));
        let turns = turns_newest_first(&[(Sender::User, "hello")]);
        let summary = summarizer(backend).summarize(&turns, &PEOPLE).await;
        assert_eq!(summary, SUMMARY_UNAVAILABLE);
    }

    #[tokio::test]
    async fn summary_is_trimmed_model_output() {
        let backend = Arc::new(ScriptedBackend::new().with("m", Script::Reply("  They met.  ".into())));
        let turns = turns_newest_first(&[(Sender::User, "hello")]);
        assert_eq!(summarizer(backend).summarize(&turns, &PEOPLE).await, "They met.");
    }

    #[tokio::test]
    async fn request_is_bounded_and_carries_hints() {
        let backend = Arc::new(ScriptedBackend::new().with("m", Script::Reply("ok".into())));
        let long = "x".repeat(500);
        let mut texts: Vec<(Sender, &str)> = Vec::new();
        for _ in 0..8 {
            texts.push((Sender::Agent, long.as_str()));
        }
        texts.push((Sender::User, "**At the pier** *waves*"));
        let turns = turns_newest_first(&texts);

        summarizer(backend.clone()).summarize(&turns, &PEOPLE).await;

        let request = &backend.requests()[0];
        assert_eq!(request.temperature, SUMMARY_TEMPERATURE);
        assert_eq!(request.max_tokens, SUMMARY_MAX_TOKENS);
        assert_eq!(request.messages[0].role, Role::System);
        assert!(request.messages[0].content.contains("At the pier"));
        assert!(request.messages[0].content.contains("waves"));
        let transcript = &request.messages[1].content;
        assert_eq!(transcript.lines().count(), MAX_SUMMARY_TURNS);
        assert!(transcript.lines().all(|l| l.chars().count() <= "Nova: ".len() + MAX_TURN_CHARS));
    }

    #[tokio::test]
    async fn hints_come_only_from_the_bounded_window() {
        let backend = Arc::new(ScriptedBackend::new().with("m", Script::Reply("ok".into())));
        let hidden = format!("**SIXTH-TURN {}**", "Z".repeat(150));
        let marked = format!("**Lighthouse** {}", "Y".repeat(150));
        let texts = vec![
            (Sender::User, hidden.as_str()),
            (Sender::Agent, marked.as_str()),
            (Sender::User, "two"),
            (Sender::Agent, "three"),
            (Sender::User, "four"),
            (Sender::Agent, "five"),
        ];
        let turns = turns_newest_first(&texts);

        summarizer(backend.clone())
            .with_limits(5, 20)
            .summarize(&turns, &PEOPLE)
            .await;

        let request = &backend.requests()[0];
        for message in &request.messages {
            assert!(!message.content.contains("SIXTH-TURN"));
            assert!(!message.content.contains(&"Y".repeat(21)));
        }
        assert!(request.messages[0].content.contains("Scene hints: Lighthouse"));
    }

    #[test]
    fn transcript_is_oldest_first_with_names() {
        let s = summarizer(Arc::new(ScriptedBackend::new()));
        let turns = turns_newest_first(&[(Sender::User, "first"), (Sender::Agent, "second")]);
        assert_eq!(s.transcript(&turns, &PEOPLE), "Ava: first\nNova: second");
    }

    #[test]
    fn limits_cannot_exceed_defaults() {
        let s = summarizer(Arc::new(ScriptedBackend::new())).with_limits(50, 10_000);
        assert_eq!(s.limits(), (MAX_SUMMARY_TURNS, MAX_TURN_CHARS));
        let s = summarizer(Arc::new(ScriptedBackend::new())).with_limits(2, 40);
        assert_eq!(s.limits(), (2, 40));
    }
}
