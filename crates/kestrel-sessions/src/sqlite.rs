use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use kestrel_core::{ConversationLog, SessionId, SessionSettings};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::store::SessionStore;

/// SQLite-backed store: one row per session holding the log and settings
/// as JSON.
///
/// Wraps a single connection in a `Mutex`; every call is short and never
/// held across an await.
pub struct SqliteSessionStore {
    db: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Wrap an already-open connection, running migrations first.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Delete sessions untouched for longer than `idle`. Returns the number
    /// of sessions removed.
    #[instrument(skip(self))]
    pub fn prune_idle(&self, idle: chrono::Duration) -> Result<usize> {
        let cutoff = timestamp(Utc::now() - idle);
        let removed = self.conn()?.execute(
            "DELETE FROM conversations WHERE updated_at < ?1",
            rusqlite::params![cutoff],
        )?;
        if removed > 0 {
            info!(removed, "pruned idle sessions");
        }
        Ok(removed)
    }

    /// Number of stored sessions.
    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

/// Fixed-width UTC timestamps so string comparison orders chronologically.
fn timestamp(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self), fields(session = %session))]
    fn load(&self, session: &SessionId) -> Result<Option<ConversationLog>> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT log_json FROM conversations WHERE session_id = ?1",
                rusqlite::params![session.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, log), fields(session = %session, turns = log.len()))]
    fn save(&self, session: &SessionId, log: &ConversationLog) -> Result<()> {
        let json = serde_json::to_string(log)?;
        let now = timestamp(Utc::now());
        self.conn()?.execute(
            "INSERT INTO conversations (session_id, log_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(session_id) DO UPDATE SET
                log_json   = excluded.log_json,
                updated_at = excluded.updated_at",
            rusqlite::params![session.as_str(), json, now],
        )?;
        debug!("conversation saved");
        Ok(())
    }

    fn load_settings(&self, session: &SessionId) -> Result<SessionSettings> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT settings_json FROM conversations WHERE session_id = ?1",
                rusqlite::params![session.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(SessionSettings::default()),
        }
    }

    fn save_settings(&self, session: &SessionId, settings: &SessionSettings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        let now = timestamp(Utc::now());
        self.conn()?.execute(
            "INSERT INTO conversations (session_id, settings_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(session_id) DO UPDATE SET
                settings_json = excluded.settings_json,
                updated_at    = excluded.updated_at",
            rusqlite::params![session.as_str(), json, now],
        )?;
        Ok(())
    }

    #[instrument(skip(self), fields(session = %session))]
    fn delete(&self, session: &SessionId) -> Result<bool> {
        let removed = self.conn()?.execute(
            "DELETE FROM conversations WHERE session_id = ?1",
            rusqlite::params![session.as_str()],
        )?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::Turn;

    fn sample_log() -> ConversationLog {
        let mut log = ConversationLog::with_system("be brief");
        log.push(Turn::user("hi"));
        log.push(Turn::assistant("hello"));
        log
    }

    #[test]
    fn first_contact_is_empty() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let id = SessionId::new("discord:1");
        assert!(store.load(&id).unwrap().is_none());
        assert_eq!(store.load_settings(&id).unwrap(), SessionSettings::default());
    }

    #[test]
    fn save_then_load_preserves_log() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let id = SessionId::new("discord:1");
        store.save(&id, &sample_log()).unwrap();
        assert_eq!(store.load(&id).unwrap(), Some(sample_log()));

        // Overwrite keeps a single row.
        store.save(&id, &ConversationLog::with_system("x")).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.load(&id).unwrap().unwrap().len(), 1);
    }

    #[test]
    fn settings_and_log_are_independent() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let id = SessionId::new("discord:2");
        let on = SessionSettings {
            reasoning_mode: true,
        };
        store.save_settings(&id, &on).unwrap();
        // A settings-only row has an empty log.
        assert_eq!(store.load(&id).unwrap(), Some(ConversationLog::new()));

        store.save(&id, &sample_log()).unwrap();
        assert_eq!(store.load_settings(&id).unwrap(), on);
    }

    #[test]
    fn delete_reports_existence() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let id = SessionId::new("discord:3");
        assert!(!store.delete(&id).unwrap());
        store.save(&id, &sample_log()).unwrap();
        assert!(store.delete(&id).unwrap());
        assert!(store.load(&id).unwrap().is_none());
    }

    #[test]
    fn prune_removes_only_idle_sessions() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let stale = SessionId::new("discord:old");
        let fresh = SessionId::new("discord:new");
        store.save(&stale, &sample_log()).unwrap();
        store.save(&fresh, &sample_log()).unwrap();
        store
            .db
            .lock()
            .unwrap()
            .execute(
                "UPDATE conversations SET updated_at = '2000-01-01T00:00:00.000Z'
                 WHERE session_id = ?1",
                rusqlite::params![stale.as_str()],
            )
            .unwrap();

        let removed = store.prune_idle(chrono::Duration::days(30)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.load(&stale).unwrap().is_none());
        assert!(store.load(&fresh).unwrap().is_some());
    }

    #[test]
    fn corrupt_log_surfaces_as_serialization_error() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let id = SessionId::new("discord:bad");
        store
            .db
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO conversations (session_id, log_json, created_at, updated_at)
                 VALUES (?1, 'not json', 'x', 'x')",
                rusqlite::params![id.as_str()],
            )
            .unwrap();
        assert!(matches!(store.load(&id), Err(StoreError::Serialization(_))));
    }
}
