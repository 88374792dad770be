use kestrel_core::{ConversationLog, SessionId, SessionSettings};

use crate::error::Result;

/// Persistence seam for conversation logs and per-session settings.
///
/// Implementations are synchronous; callers hold no lock across awaits.
pub trait SessionStore: Send + Sync {
    /// The stored log, or `None` on first contact.
    fn load(&self, session: &SessionId) -> Result<Option<ConversationLog>>;

    fn save(&self, session: &SessionId, log: &ConversationLog) -> Result<()>;

    /// Stored settings, or defaults when none were saved.
    fn load_settings(&self, session: &SessionId) -> Result<SessionSettings>;

    fn save_settings(&self, session: &SessionId, settings: &SessionSettings) -> Result<()>;

    /// Remove everything kept for `session`. Returns whether anything existed.
    fn delete(&self, session: &SessionId) -> Result<bool>;
}
