pub mod config;
pub mod error;
pub mod types;

pub use error::{KestrelError, Result};
pub use types::{
    Content, ContentPart, ConversationLog, Role, SessionId, SessionSettings, Turn, TurnKind,
};
