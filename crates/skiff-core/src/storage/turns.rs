//! Turn persistence.
//!
//! A turn is the durable record of one assistant response, keyed by
//! `(chat_id, message_id)`. It is mutated incrementally (when per-chunk
//! persistence is on) or once at stream end, and always written on normal
//! completion, on cancellation (with whatever content was produced), and
//! on unrecoverable error. `upsert_partial` is idempotent on repeated
//! identical writes.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::database::Database;

/// Terminal (and in-flight) state of a persisted turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Streaming,
    Complete,
    Partial,
    Error,
    Cancelled,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Streaming => "streaming",
            TurnStatus::Complete => "complete",
            TurnStatus::Partial => "partial",
            TurnStatus::Error => "error",
            TurnStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "streaming" => Some(TurnStatus::Streaming),
            "complete" => Some(TurnStatus::Complete),
            "partial" => Some(TurnStatus::Partial),
            "error" => Some(TurnStatus::Error),
            "cancelled" => Some(TurnStatus::Cancelled),
            _ => None,
        }
    }
}

/// The assembled chat message record.
#[derive(Debug, Clone)]
pub struct PersistedTurn {
    pub chat_id: String,
    pub message_id: String,
    pub content: String,
    pub status: TurnStatus,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Turn persistence store.
pub struct TurnStore<'a> {
    db: &'a Database,
}

impl<'a> TurnStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert or update the turn record. `content`/`error` are only
    /// overwritten when provided, so an error write never clobbers
    /// previously flushed partial content.
    pub fn upsert_partial(
        &self,
        chat_id: &str,
        message_id: &str,
        content: Option<&str>,
        error: Option<&str>,
        status: TurnStatus,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.conn().execute(
            "INSERT INTO turns (chat_id, message_id, content, status, error, created_at, updated_at)
             VALUES (?1, ?2, COALESCE(?3, ''), ?4, ?5, ?6, ?6)
             ON CONFLICT(chat_id, message_id) DO UPDATE SET
                 content    = COALESCE(?3, turns.content),
                 status     = ?4,
                 error      = COALESCE(?5, turns.error),
                 updated_at = ?6",
            params![chat_id, message_id, content, status.as_str(), error, now],
        )?;
        Ok(())
    }

    pub fn get(&self, chat_id: &str, message_id: &str) -> Result<Option<PersistedTurn>> {
        let turn = self
            .db
            .conn()
            .query_row(
                "SELECT content, status, error, created_at, updated_at
                 FROM turns WHERE chat_id = ?1 AND message_id = ?2",
                params![chat_id, message_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        Ok(turn.map(
            |(content, status, error, created_at, updated_at)| PersistedTurn {
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
                content,
                status: TurnStatus::parse(&status).unwrap_or(TurnStatus::Error),
                error,
                created_at,
                updated_at,
            },
        ))
    }

    pub fn count_for_chat(&self, chat_id: &str) -> Result<usize> {
        let count: i64 = self.db.conn().query_row(
            "SELECT COUNT(*) FROM turns WHERE chat_id = ?1",
            [chat_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
