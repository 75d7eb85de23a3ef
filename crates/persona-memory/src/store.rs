//! Bounded conversational memory.
//!
//! [`MemoryStore`] keeps one capacity-bounded log of [`Turn`]s per
//! [`ConversationKey`] on top of any [`HistoryBackend`], and answers "which of
//! the recent turns matter for this new message?".
//!
//! # Invariants
//!
//! * After every append a log holds at most `capacity` turns; the oldest turns
//!   (by `created_at`) are evicted first.
//! * Turn ids are unique and `created_at` strictly increases within a log,
//!   also under concurrent appends to the same key.
//! * Appends to different keys never wait on each other.
//!
//! # Example
//!
//! ```rust
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! use std::sync::Arc;
//! use persona_memory::{InMemoryHistory, MemoryStore};
//! use persona_types::{ConversationKey, Sender};
//!
//! let store = MemoryStore::new(Arc::new(InMemoryHistory::new()), 2);
//! let key = ConversationKey::new("u1", "c1");
//!
//! store.append(&key, Sender::User, "I love the sea").await.unwrap();
//! store.append(&key, Sender::Agent, "*smiles* The sea loves you back.").await.unwrap();
//! store.append(&key, Sender::User, "Shall we go sailing?").await.unwrap();
//!
//! let recent = store.recent(&key, 10).await.unwrap();
//! assert_eq!(recent.len(), 2);
//! assert_eq!(recent[0].text, "Shall we go sailing?");
//! # });
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use persona_types::{ConversationKey, Sender, Turn};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use uuid::Uuid;

use crate::history::{HistoryBackend, MemoryError};
use crate::similarity;
use crate::triggers::TriggerTable;

/// Default number of turns kept per conversation.
pub const DEFAULT_CAPACITY: usize = 200;

/// Default number of most-recent turns scored by similarity recall.
pub const DEFAULT_RECALL_WINDOW: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// MemoryStore
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity-bounded, similarity-queried conversation log.
pub struct MemoryStore {
    backend: Arc<dyn HistoryBackend>,
    capacity: usize,
    recall_window: usize,
    triggers: TriggerTable,
    /// One async lock per conversation, serialising append-then-evict.
    locks: Mutex<HashMap<ConversationKey, Arc<AsyncMutex<()>>>>,
}

impl MemoryStore {
    /// Create a store keeping at most `capacity` turns per conversation
    /// (values below 1 are raised to 1).
    pub fn new(backend: Arc<dyn HistoryBackend>, capacity: usize) -> Self {
        Self {
            backend,
            capacity: capacity.max(1),
            recall_window: DEFAULT_RECALL_WINDOW,
            triggers: TriggerTable::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Number of most-recent turns scored by [`retrieve_relevant`][Self::retrieve_relevant].
    pub fn with_recall_window(mut self, window: usize) -> Self {
        self.recall_window = window;
        self
    }

    /// Replace the keyword-trigger fallback table.
    pub fn with_triggers(mut self, triggers: TriggerTable) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn key_lock(&self, key: &ConversationKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Forget the lock of `key` once no other append holds or awaits it.
    fn release_lock(&self, key: &ConversationKey, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Ours plus the map's.
        if Arc::strong_count(&lock) == 2 && locks.get(key).is_some_and(|held| Arc::ptr_eq(held, &lock)) {
            locks.remove(key);
        }
    }

    /// Append one turn to the log of `key` and evict beyond capacity.
    pub async fn append(
        &self,
        key: &ConversationKey,
        sender: Sender,
        text: &str,
    ) -> Result<Turn, MemoryError> {
        let mut turns = self.append_turns(key, &[(sender, text)]).await?;
        turns.pop().ok_or(MemoryError::EmptyText)
    }

    /// Append a user message and the agent's reply as one atomic insert, so
    /// that the log never holds one without the other.
    pub async fn append_exchange(
        &self,
        key: &ConversationKey,
        user_text: &str,
        agent_text: &str,
    ) -> Result<(Turn, Turn), MemoryError> {
        let mut turns = self
            .append_turns(key, &[(Sender::User, user_text), (Sender::Agent, agent_text)])
            .await?
            .into_iter();
        match (turns.next(), turns.next()) {
            (Some(user), Some(agent)) => Ok((user, agent)),
            _ => Err(MemoryError::EmptyText),
        }
    }

    async fn append_turns(
        &self,
        key: &ConversationKey,
        entries: &[(Sender, &str)],
    ) -> Result<Vec<Turn>, MemoryError> {
        if entries.iter().any(|(_, text)| text.trim().is_empty()) {
            return Err(MemoryError::EmptyText);
        }

        let lock = self.key_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.insert_turns(key, entries).await
        };
        self.release_lock(key, lock);
        result
    }

    async fn insert_turns(
        &self,
        key: &ConversationKey,
        entries: &[(Sender, &str)],
    ) -> Result<Vec<Turn>, MemoryError> {
        let newest = self
            .backend
            .query(key, 1)
            .await?
            .into_iter()
            .next()
            .map(|t| t.created_at);
        let mut stamp = next_timestamp(newest);
        let turns: Vec<Turn> = entries
            .iter()
            .map(|(sender, text)| {
                let turn = Turn {
                    id: Uuid::new_v4(),
                    key: key.clone(),
                    sender: *sender,
                    text: (*text).to_string(),
                    created_at: stamp,
                };
                stamp += TimeDelta::microseconds(1);
                turn
            })
            .collect();

        let evicted = self.backend.insert_bounded(&turns, self.capacity).await?;
        if !evicted.is_empty() {
            debug!(conversation = %key, evicted = evicted.len(), "pruned history beyond capacity");
        }
        Ok(turns)
    }

    /// Up to `n` most-recent turns of `key`, newest first.  Unknown keys
    /// yield an empty list.
    pub async fn recent(&self, key: &ConversationKey, n: usize) -> Result<Vec<Turn>, MemoryError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.backend.query(key, n).await
    }

    /// Turns of `key` relevant to `query`, at most `n` of them.
    ///
    /// The most recent `recall_window` turns are scored with
    /// [`similarity::ratio`]; those scoring at least `threshold` are returned
    /// best first (ties: newest first).  When none qualify, the trigger table
    /// is consulted and turns anywhere in the log containing one of the
    /// trigger's search terms are returned newest first.  No match at all is
    /// an empty list, not an error.
    pub async fn retrieve_relevant(
        &self,
        key: &ConversationKey,
        query: &str,
        n: usize,
        threshold: f64,
    ) -> Result<Vec<Turn>, MemoryError> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let window = self.recent(key, self.recall_window).await?;
        let mut scored: Vec<(usize, f64, Turn)> = window
            .into_iter()
            .enumerate()
            .map(|(rank, turn)| (rank, similarity::ratio(query, &turn.text), turn))
            .filter(|(_, score, _)| *score >= threshold)
            .collect();
        if !scored.is_empty() {
            scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            return Ok(scored.into_iter().take(n).map(|(_, _, turn)| turn).collect());
        }

        let Some(terms) = self.triggers.search_terms(query) else {
            return Ok(Vec::new());
        };
        debug!(conversation = %key, ?terms, "no similar turns; using trigger terms");
        let log = self.backend.query(key, self.capacity).await?;
        Ok(log
            .into_iter()
            .filter(|turn| {
                let text = turn.text.to_lowercase();
                terms.iter().any(|term| text.contains(term.as_str()))
            })
            .take(n)
            .collect())
    }
}

/// Current time at microsecond precision, strictly after `newest`.
fn next_timestamp(newest: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    let now_micros = now.timestamp_micros();
    let micros = match newest {
        Some(prev) => now_micros.max(prev.timestamp_micros() + 1),
        None => now_micros,
    };
    DateTime::from_timestamp_micros(micros).unwrap_or(now)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
