use rusqlite::Connection;

use crate::error::Result;

/// Initialise the conversations table and its index.
///
/// Safe to call on every startup, uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            session_id    TEXT PRIMARY KEY,
            log_json      TEXT NOT NULL DEFAULT '[]',
            settings_json TEXT NOT NULL DEFAULT '{}',
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_updated
            ON conversations(updated_at);",
    )?;
    Ok(())
}
