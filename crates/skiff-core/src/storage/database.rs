//! SQLite connection wrapper and schema.

use std::path::Path;

use anyhow::Result;
use rusqlite::Connection;

/// Database connection wrapper. One connection per instance; callers open
/// short-lived instances at write sites rather than sharing a connection
/// across tasks.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS turns (
                chat_id    TEXT NOT NULL,
                message_id TEXT NOT NULL,
                content    TEXT NOT NULL DEFAULT '',
                status     TEXT NOT NULL,
                error      TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (chat_id, message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_turns_chat ON turns(chat_id);",
        )?;
        Ok(())
    }
}
