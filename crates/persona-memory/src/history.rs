//! Persistence backends for conversation history.
//!
//! The [`HistoryBackend`] trait is the seam between the
//! [`MemoryStore`][crate::store::MemoryStore] and whatever row store holds the
//! turns.  Two implementations ship with the crate:
//!
//! - [`SqliteHistory`] – a local SQLite file (or in-memory database).  All
//!   blocking SQLite work runs on tokio's blocking pool.
//! - [`InMemoryHistory`] – a process-local map, used for ephemeral sessions
//!   and tests.
//!
//! # Storage layout
//!
//! A single table `history` is created (if it does not already exist):
//!
//! | column    | type | description                                  |
//! |-----------|------|----------------------------------------------|
//! | id        | TEXT | UUID v4 primary key                          |
//! | user_id   | TEXT | Owning user                                  |
//! | char_id   | TEXT | Character the conversation is held with      |
//! | sender    | TEXT | `"user"` or `"agent"` (`"ai"` also accepted) |
//! | message   | TEXT | Turn text                                    |
//! | timestamp | TEXT | RFC-3339 creation time (UTC, microseconds)   |

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use persona_types::{ChatError, ConversationKey, Sender, Turn};
use rusqlite::{Connection, TransactionBehavior, params};
use thiserror::Error;
use uuid::Uuid;

/// How long a connection waits on a database locked by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from history persistence.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt history row: {0}")]
    CorruptRow(String),
    #[error("Turn {0} already exists")]
    DuplicateId(Uuid),
    #[error("Turn text must not be empty")]
    EmptyText,
    #[error("History worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("History backend unavailable: {0}")]
    Unavailable(String),
}

impl From<MemoryError> for ChatError {
    fn from(err: MemoryError) -> Self {
        ChatError::Persistence(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HistoryBackend
// ─────────────────────────────────────────────────────────────────────────────

/// A row store holding the `history` relation.
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    /// Insert one turn.  Turn ids are unique; re-inserting an id is an error.
    async fn insert(&self, turn: &Turn) -> Result<(), MemoryError>;

    /// Up to `limit` turns of `key`, newest first.
    async fn query(&self, key: &ConversationKey, limit: usize) -> Result<Vec<Turn>, MemoryError>;

    /// Delete the turns with the given ids; returns how many rows went away.
    async fn delete_ids(&self, ids: &[Uuid]) -> Result<usize, MemoryError>;

    /// Insert `turns` (all sharing one key) and delete every turn of that key
    /// beyond the newest `capacity`.  Returns the evicted ids.
    ///
    /// The default implementation composes the three primitives and relies on
    /// the caller for mutual exclusion; backends that can do better override
    /// it with a single atomic operation.
    async fn insert_bounded(
        &self,
        turns: &[Turn],
        capacity: usize,
    ) -> Result<Vec<Uuid>, MemoryError> {
        let Some(first) = turns.first() else {
            return Ok(Vec::new());
        };
        for turn in turns {
            self.insert(turn).await?;
        }
        let evicted: Vec<Uuid> = self
            .query(&first.key, usize::MAX)
            .await?
            .into_iter()
            .skip(capacity)
            .map(|t| t.id)
            .collect();
        if !evicted.is_empty() {
            self.delete_ids(&evicted).await?;
        }
        Ok(evicted)
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteHistory
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed history store.
///
/// Cloning is cheap; clones share one connection.
#[derive(Clone)]
pub struct SqliteHistory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistory {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, MemoryError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS history (
                id        TEXT NOT NULL PRIMARY KEY,
                user_id   TEXT NOT NULL,
                char_id   TEXT NOT NULL,
                sender    TEXT NOT NULL,
                message   TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS history_by_conversation
                ON history (user_id, char_id, timestamp);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, MemoryError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| MemoryError::Unavailable("connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await?
    }
}

fn insert_row(conn: &Connection, turn: &Turn) -> Result<(), MemoryError> {
    let result = conn.execute(
        "INSERT INTO history (id, user_id, char_id, sender, message, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            turn.id.to_string(),
            turn.key.user_id,
            turn.key.char_id,
            turn.sender.as_str(),
            turn.text,
            format_timestamp(&turn.created_at),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(MemoryError::DuplicateId(turn.id))
        }
        Err(e) => Err(e.into()),
    }
}

fn select_turns(
    conn: &Connection,
    key: &ConversationKey,
    limit: usize,
    offset: usize,
) -> Result<Vec<Turn>, MemoryError> {
    let mut stmt = conn.prepare(
        "SELECT id, sender, message, timestamp
         FROM history
         WHERE user_id = ?1 AND char_id = ?2
         ORDER BY timestamp DESC, rowid DESC
         LIMIT ?3 OFFSET ?4",
    )?;
    let rows = stmt.query_map(
        params![key.user_id, key.char_id, sql_limit(limit), sql_limit(offset)],
        |row| {
            let id: String = row.get(0)?;
            let sender: String = row.get(1)?;
            let message: String = row.get(2)?;
            let timestamp: String = row.get(3)?;
            Ok((id, sender, message, timestamp))
        },
    )?;

    let mut turns = Vec::new();
    for row in rows {
        let (id, sender, text, timestamp) = row?;
        let id = Uuid::parse_str(&id).map_err(|e| MemoryError::CorruptRow(format!("id {id}: {e}")))?;
        let sender = Sender::parse(&sender)
            .ok_or_else(|| MemoryError::CorruptRow(format!("sender {sender:?} on {id}")))?;
        let created_at = timestamp
            .parse::<DateTime<Utc>>()
            .map_err(|e| MemoryError::CorruptRow(format!("timestamp {timestamp:?} on {id}: {e}")))?;
        turns.push(Turn {
            id,
            key: key.clone(),
            sender,
            text,
            created_at,
        });
    }
    Ok(turns)
}

fn delete_rows(conn: &Connection, ids: &[Uuid]) -> Result<usize, MemoryError> {
    let mut stmt = conn.prepare("DELETE FROM history WHERE id = ?1")?;
    let mut deleted = 0;
    for id in ids {
        deleted += stmt.execute(params![id.to_string()])?;
    }
    Ok(deleted)
}

#[async_trait]
impl HistoryBackend for SqliteHistory {
    async fn insert(&self, turn: &Turn) -> Result<(), MemoryError> {
        let turn = turn.clone();
        self.with_conn(move |conn| insert_row(conn, &turn)).await
    }

    async fn query(&self, key: &ConversationKey, limit: usize) -> Result<Vec<Turn>, MemoryError> {
        let key = key.clone();
        self.with_conn(move |conn| select_turns(conn, &key, limit, 0))
            .await
    }

    async fn delete_ids(&self, ids: &[Uuid]) -> Result<usize, MemoryError> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let deleted = delete_rows(&tx, &ids)?;
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    /// Insert and prune inside one `IMMEDIATE` transaction, so processes
    /// sharing the database file cannot interleave between the two steps.
    async fn insert_bounded(
        &self,
        turns: &[Turn],
        capacity: usize,
    ) -> Result<Vec<Uuid>, MemoryError> {
        let Some(key) = turns.first().map(|t| t.key.clone()) else {
            return Ok(Vec::new());
        };
        let turns = turns.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for turn in &turns {
                insert_row(&tx, turn)?;
            }
            let evicted: Vec<Uuid> = select_turns(&tx, &key, usize::MAX, capacity)?
                .into_iter()
                .map(|t| t.id)
                .collect();
            delete_rows(&tx, &evicted)?;
            tx.commit()?;
            Ok(evicted)
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// InMemoryHistory
// ─────────────────────────────────────────────────────────────────────────────

/// Process-local history store.  Contents are lost when it is dropped.
#[derive(Default)]
pub struct InMemoryHistory {
    /// Per-conversation turns, oldest first.
    rows: Mutex<HashMap<ConversationKey, Vec<Turn>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_locked(
        rows: &mut HashMap<ConversationKey, Vec<Turn>>,
        turn: &Turn,
    ) -> Result<(), MemoryError> {
        if rows.values().flatten().any(|t| t.id == turn.id) {
            return Err(MemoryError::DuplicateId(turn.id));
        }
        let log = rows.entry(turn.key.clone()).or_default();
        log.push(turn.clone());
        log.sort_by_key(|t| t.created_at);
        Ok(())
    }
}

#[async_trait]
impl HistoryBackend for InMemoryHistory {
    async fn insert(&self, turn: &Turn) -> Result<(), MemoryError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Self::insert_locked(&mut rows, turn)
    }

    async fn query(&self, key: &ConversationKey, limit: usize) -> Result<Vec<Turn>, MemoryError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .get(key)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_ids(&self, ids: &[Uuid]) -> Result<usize, MemoryError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut deleted = 0;
        for log in rows.values_mut() {
            let before = log.len();
            log.retain(|t| !ids.contains(&t.id));
            deleted += before - log.len();
        }
        Ok(deleted)
    }

    async fn insert_bounded(
        &self,
        turns: &[Turn],
        capacity: usize,
    ) -> Result<Vec<Uuid>, MemoryError> {
        let Some(key) = turns.first().map(|t| t.key.clone()) else {
            return Ok(Vec::new());
        };
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        for turn in turns {
            Self::insert_locked(&mut rows, turn)?;
        }
        let log = rows.entry(key).or_default();
        let excess = log.len().saturating_sub(capacity);
        Ok(log.drain(..excess).map(|t| t.id).collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
