use dashmap::DashMap;

use kestrel_core::{ConversationLog, SessionId, SessionSettings};

use crate::error::Result;
use crate::store::SessionStore;

#[derive(Default, Clone)]
struct Entry {
    log: Option<ConversationLog>,
    settings: SessionSettings,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: DashMap<SessionId, Entry>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, session: &SessionId) -> Result<Option<ConversationLog>> {
        Ok(self.entries.get(session).and_then(|e| e.log.clone()))
    }

    fn save(&self, session: &SessionId, log: &ConversationLog) -> Result<()> {
        self.entries.entry(session.clone()).or_default().log = Some(log.clone());
        Ok(())
    }

    fn load_settings(&self, session: &SessionId) -> Result<SessionSettings> {
        Ok(self
            .entries
            .get(session)
            .map(|e| e.settings.clone())
            .unwrap_or_default())
    }

    fn save_settings(&self, session: &SessionId, settings: &SessionSettings) -> Result<()> {
        self.entries.entry(session.clone()).or_default().settings = settings.clone();
        Ok(())
    }

    fn delete(&self, session: &SessionId) -> Result<bool> {
        Ok(self.entries.remove(session).is_some())
    }
}
