//! `persona-memory` – The conversation memory.
//!
//! Gives every (user, character) pair a bounded log of turns and a way to
//! recall the turns that matter for a new message.
//!
//! # Modules
//!
//! - [`store`] – [`MemoryStore`][store::MemoryStore]: capacity-bounded
//!   append log per conversation with similarity recall and a keyword-trigger
//!   fallback.
//! - [`history`] – [`HistoryBackend`][history::HistoryBackend]: the row-store
//!   seam, with [`SqliteHistory`][history::SqliteHistory] and
//!   [`InMemoryHistory`][history::InMemoryHistory].
//! - [`similarity`] – matching-blocks string similarity in `[0, 1]`.
//! - [`triggers`] – [`TriggerTable`][triggers::TriggerTable]: trigger phrases
//!   mapped to search terms.

pub mod history;
pub mod similarity;
pub mod store;
pub mod triggers;

pub use history::{HistoryBackend, InMemoryHistory, MemoryError, SqliteHistory};
pub use store::{DEFAULT_CAPACITY, DEFAULT_RECALL_WINDOW, MemoryStore};
pub use triggers::{Trigger, TriggerTable, TriggerTerms};
