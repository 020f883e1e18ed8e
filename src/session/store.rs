//! Task history persistence with `SQLite`.
//!
//! Two tables: `task_index` holds one cheap-to-list row per task, and
//! `transcripts` holds the full message list per task as JSON. They are kept
//! separate so listing never touches transcripts.
#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // SQLite stores integers as i64

use crate::provider::{Message, Role, UsageTotals};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const SCHEMA_VERSION: i32 = 1;
/// Max characters of the first user message kept as the task summary.
const SUMMARY_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("History task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Index record for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: String,
    /// Milliseconds since the epoch of the last activity.
    pub ts: i64,
    pub task: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    pub total_cost: f64,
}

pub struct HistoryStore {
    db: Connection,
}

impl HistoryStore {
    /// Open or create a history store at the given path.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                HistoryError::InvalidData(format!(
                    "Failed to create history directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let db = Connection::open(path)?;
        db.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self { db };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store, for tests and throwaway sessions.
    pub fn open_in_memory() -> Result<Self, HistoryError> {
        let store = Self {
            db: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), HistoryError> {
        let version: i32 = self
            .db
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version < SCHEMA_VERSION {
            self.db.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS task_index (
                    id           TEXT PRIMARY KEY,
                    ts           INTEGER NOT NULL,
                    task         TEXT NOT NULL,
                    tokens_in    INTEGER NOT NULL DEFAULT 0,
                    tokens_out   INTEGER NOT NULL DEFAULT 0,
                    cache_writes INTEGER NOT NULL DEFAULT 0,
                    cache_reads  INTEGER NOT NULL DEFAULT 0,
                    total_cost   REAL NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS transcripts (
                    task_id     TEXT PRIMARY KEY,
                    messages    TEXT NOT NULL,
                    updated_at  INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key         TEXT PRIMARY KEY,
                    value       TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_task_index_ts
                    ON task_index(ts DESC);

                PRAGMA user_version = 1;
                ",
            )?;
        }

        Ok(())
    }

    /// All index entries, most recent first. Entries without a summary are hidden.
    pub fn list(&self) -> Result<Vec<HistoryItem>, HistoryError> {
        let mut stmt = self.db.prepare(
            r"
            SELECT id, ts, task, tokens_in, tokens_out, cache_writes, cache_reads, total_cost
            FROM task_index
            WHERE task != ''
            ORDER BY ts DESC, rowid DESC
            ",
        )?;

        let items: Result<Vec<HistoryItem>, rusqlite::Error> =
            stmt.query_map([], row_to_item)?.collect();
        Ok(items?)
    }

    /// Index entry for one task.
    pub fn get_item(&self, id: &str) -> Result<HistoryItem, HistoryError> {
        self.db
            .query_row(
                r"
                SELECT id, ts, task, tokens_in, tokens_out, cache_writes, cache_reads, total_cost
                FROM task_index WHERE id = ?1
                ",
                params![id],
                row_to_item,
            )
            .optional()?
            .ok_or_else(|| HistoryError::NotFound(id.to_string()))
    }

    /// Load the full transcript of a task.
    ///
    /// An index entry whose transcript is gone is removed before reporting `NotFound`.
    pub fn load(&self, id: &str) -> Result<Vec<Message>, HistoryError> {
        self.get_item(id)?;

        let json: Option<String> = self
            .db
            .query_row(
                "SELECT messages FROM transcripts WHERE task_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(json) = json else {
            tracing::warn!(task_id = id, "Transcript missing, dropping dangling index entry");
            self.db
                .execute("DELETE FROM task_index WHERE id = ?1", params![id])?;
            return Err(HistoryError::NotFound(id.to_string()));
        };

        Ok(serde_json::from_str(&json)?)
    }

    /// Write a transcript and upsert its index entry.
    ///
    /// The entry's timestamp is the last message's, and its summary the first
    /// user message. Usage columns are left untouched.
    pub fn save(&self, id: &str, transcript: &[Message]) -> Result<(), HistoryError> {
        let now = chrono::Utc::now().timestamp_millis();
        let ts = transcript
            .last()
            .map_or(now, |m| m.timestamp.timestamp_millis());
        let summary = summarize(transcript);
        let json = serde_json::to_string(transcript)?;

        self.db.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| {
            self.db.execute(
                r"
                INSERT INTO transcripts (task_id, messages, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(task_id) DO UPDATE SET
                    messages = excluded.messages,
                    updated_at = excluded.updated_at
                ",
                params![id, json, now],
            )?;

            self.db.execute(
                r"
                INSERT INTO task_index (id, ts, task)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(id) DO UPDATE SET
                    ts = excluded.ts,
                    task = excluded.task
                ",
                params![id, ts, summary],
            )?;

            Ok::<(), HistoryError>(())
        })();

        match result {
            Ok(()) => {
                self.db.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = self.db.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Record usage totals on an existing index entry.
    pub fn update_usage(
        &self,
        id: &str,
        usage: &UsageTotals,
        total_cost: f64,
    ) -> Result<(), HistoryError> {
        let affected = self.db.execute(
            r"
            UPDATE task_index SET
                tokens_in = ?2,
                tokens_out = ?3,
                cache_writes = ?4,
                cache_reads = ?5,
                total_cost = ?6
            WHERE id = ?1
            ",
            params![
                id,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                usage.cache_write_tokens as i64,
                usage.cache_read_tokens as i64,
                total_cost
            ],
        )?;

        if affected == 0 {
            return Err(HistoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Remove a task's index entry and transcript. Missing rows are not an error.
    pub fn remove(&self, id: &str) -> Result<(), HistoryError> {
        self.db.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| {
            self.db
                .execute("DELETE FROM task_index WHERE id = ?1", params![id])?;
            self.db
                .execute("DELETE FROM transcripts WHERE task_id = ?1", params![id])?;
            Ok::<(), HistoryError>(())
        })();

        match result {
            Ok(()) => {
                self.db.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = self.db.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Delete every task and setting.
    pub fn clear(&self) -> Result<(), HistoryError> {
        self.db.execute_batch(
            r"
            BEGIN IMMEDIATE;
            DELETE FROM task_index;
            DELETE FROM transcripts;
            DELETE FROM settings;
            COMMIT;
            ",
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, HistoryError> {
        Ok(self
            .db
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Set a setting; `None` deletes it.
    pub fn set_setting(&self, key: &str, value: Option<&str>) -> Result<(), HistoryError> {
        match value {
            Some(value) => self.db.execute(
                r"
                INSERT INTO settings (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                ",
                params![key, value],
            )?,
            None => self
                .db
                .execute("DELETE FROM settings WHERE key = ?1", params![key])?,
        };
        Ok(())
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryItem> {
    Ok(HistoryItem {
        id: row.get(0)?,
        ts: row.get(1)?,
        task: row.get(2)?,
        tokens_in: row.get::<_, i64>(3)? as u64,
        tokens_out: row.get::<_, i64>(4)? as u64,
        cache_writes: row.get::<_, i64>(5)? as u64,
        cache_reads: row.get::<_, i64>(6)? as u64,
        total_cost: row.get(7)?,
    })
}

/// First user message, truncated for display.
fn summarize(transcript: &[Message]) -> String {
    let Some(first) = transcript.iter().find(|m| m.role == Role::User) else {
        return String::new();
    };
    let text = first.content.trim();
    if text.chars().count() > SUMMARY_LIMIT {
        format!("{}...", text.chars().take(SUMMARY_LIMIT).collect::<String>())
    } else {
        text.to_string()
    }
}
