//! `persona-types` – shared data model for the persona chat backend.
//!
//! Every crate in the workspace speaks in terms of these types: the
//! conversation [`Turn`] owned by the memory store, the request/response
//! shapes crossing the process boundary, and the global [`ChatError`]
//! taxonomy that the binary maps to exit codes.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// User name substituted when the request does not carry one.
pub const DEFAULT_USER_NAME: &str = "Anonymous";

// ─────────────────────────────────────────────────────────────────────────────
// Conversation identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identifies one (user, character) conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub user_id: String,
    pub char_id: String,
}

impl ConversationKey {
    pub fn new(user_id: impl Into<String>, char_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            char_id: char_id.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.char_id)
    }
}

/// Author of a [`Turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    /// The character. Older history rows spell this `"ai"`.
    #[serde(alias = "ai")]
    Agent,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Sender::User),
            "agent" | "ai" => Some(Sender::Agent),
            _ => None,
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Turn
// ─────────────────────────────────────────────────────────────────────────────

/// One message in a conversation, the atomic unit of the memory log.
///
/// Serialises with the column names of the `history` relation
/// (`id`, `user_id`, `char_id`, `sender`, `message`, `timestamp`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    #[serde(flatten)]
    pub key: ConversationKey,
    pub sender: Sender,
    #[serde(rename = "message")]
    pub text: String,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Build a turn with a fresh UUID and the current UTC time.
    pub fn new(key: ConversationKey, sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            sender,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process boundary
// ─────────────────────────────────────────────────────────────────────────────

/// The character a conversation is held with.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CharacterProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_background")]
    pub background: String,
    #[serde(default = "default_behavior")]
    pub behavior: String,
    #[serde(default = "default_firstline")]
    pub firstline: String,
    #[serde(default = "default_tags")]
    pub tags: Vec<String>,
    /// How the character regards the user. Derived from the user name when
    /// absent.
    #[serde(default)]
    pub relationships: Option<String>,
}

fn default_background() -> String {
    "A refined novelist crafting tales with elegance.".to_string()
}
fn default_behavior() -> String {
    "Observant, charming, subtly playful.".to_string()
}
fn default_firstline() -> String {
    "*She peeks over her book, eyes gleaming* What are you doing?".to_string()
}
fn default_tags() -> Vec<String> {
    vec!["novelist".into(), "elegant".into(), "curious".into()]
}

impl CharacterProfile {
    /// Minimal profile with every optional field at its default.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            background: default_background(),
            behavior: default_behavior(),
            firstline: default_firstline(),
            tags: default_tags(),
            relationships: None,
        }
    }

    pub fn relationships_for(&self, user_name: &str) -> String {
        match &self.relationships {
            Some(r) if !r.trim().is_empty() => r.clone(),
            _ => format!("Sees {user_name} as a fascinating partner."),
        }
    }
}

/// The JSON object read from standard input for one request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChatInput {
    /// The user's message.
    pub user: String,
    pub userid: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(rename = "char")]
    pub character: CharacterProfile,
    /// Upper bound on the history window read for this request.
    #[serde(default, rename = "hisLimit")]
    pub his_limit: Option<usize>,
    /// Per-request API key overriding the configured one.
    #[serde(default)]
    pub token: Option<String>,
    /// Overrides the configured output mode.
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ChatInput {
    pub fn user_name(&self) -> &str {
        self.user_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(DEFAULT_USER_NAME)
    }

    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(&self.userid, &self.character.id)
    }

    /// Reject requests that cannot be served at all.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.user.trim().is_empty() {
            return Err(ChatError::Input("missing field: user".into()));
        }
        if self.userid.trim().is_empty() {
            return Err(ChatError::Input("missing field: userid".into()));
        }
        if self.character.id.trim().is_empty() {
            return Err(ChatError::Input("missing field: char.id".into()));
        }
        Ok(())
    }
}

/// The JSON object written to standard output on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOutput {
    pub response: String,
    pub memories: String,
    pub relevant_memories: Vec<String>,
    pub history: Vec<Turn>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Global error type spanning input validation, inference and persistence.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ChatError {
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Backend {backend} temporarily unavailable: {reason}")]
    TransientBackend { backend: String, reason: String },

    #[error("Backend {backend} failed: {reason}")]
    FatalBackend { backend: String, reason: String },

    #[error("No model succeeded (tried: {})", attempted.join(", "))]
    AllBackendsExhausted { attempted: Vec<String> },

    #[error("History store error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ChatError {
    /// Process exit status used by the binary for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ChatError::Input(_) => 2,
            ChatError::AllBackendsExhausted { .. } => 3,
            ChatError::FatalBackend { .. } => 4,
            ChatError::Cancelled => 130,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_accepts_legacy_ai_spelling() {
        let s: Sender = serde_json::from_str("\"ai\"").unwrap();
        assert_eq!(s, Sender::Agent);
        assert_eq!(serde_json::to_string(&Sender::Agent).unwrap(), "\"agent\"");
        assert_eq!(Sender::parse("ai"), Some(Sender::Agent));
        assert_eq!(Sender::parse("bot"), None);
    }

    #[test]
    fn turn_serializes_with_history_column_names() {
        let turn = Turn::new(ConversationKey::new("u1", "c1"), Sender::User, "hello");
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["user_id"], "u1");
        assert_eq!(json["char_id"], "c1");
        assert_eq!(json["sender"], "user");
        assert_eq!(json["message"], "hello");
        assert!(json.get("timestamp").is_some());

        let back: Turn = serde_json::from_value(json).unwrap();
        assert_eq!(back, turn);
    }

    #[test]
    fn minimal_input_fills_character_defaults() {
        let input: ChatInput = serde_json::from_str(
            r#"{"user":"hi","userid":"u1","char":{"id":"c1","name":"Nova"}}"#,
        )
        .unwrap();
        assert_eq!(input.user_name(), DEFAULT_USER_NAME);
        assert_eq!(input.character.tags.len(), 3);
        assert!(input.his_limit.is_none());
        assert_eq!(input.conversation_key(), ConversationKey::new("u1", "c1"));
        assert!(
            input
                .character
                .relationships_for("Ava")
                .contains("Ava")
        );
        input.validate().unwrap();
    }

    #[test]
    fn his_limit_uses_camel_case_on_the_wire() {
        let input: ChatInput = serde_json::from_str(
            r#"{"user":"hi","userid":"u1","char":{"id":"c1"},"hisLimit":15}"#,
        )
        .unwrap();
        assert_eq!(input.his_limit, Some(15));
    }

    #[test]
    fn validate_rejects_blank_message() {
        let mut input: ChatInput = serde_json::from_str(
            r#"{"user":"  ","userid":"u1","char":{"id":"c1"}}"#,
        )
        .unwrap();
        assert!(matches!(input.validate(), Err(ChatError::Input(_))));
        input.user = "hello".into();
        input.character.id = String::new();
        assert!(matches!(input.validate(), Err(ChatError::Input(m)) if m.contains("char.id")));
    }

    #[test]
    fn exhausted_error_lists_attempted_backends() {
        let err = ChatError::AllBackendsExhausted {
            attempted: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("a, b"));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(ChatError::Input("x".into()).exit_code(), 2);
    }
}
