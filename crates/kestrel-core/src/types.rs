use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::KestrelError;

/// Identifies the conversation a turn belongs to.
///
/// Channel adapters decide the shape, e.g. `discord:guild_42:user_7` or
/// `discord:dm:user_7`. The pipeline treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed part of a multimodal turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageRef { url: String },
}

/// Turn payload: plain text, or an ordered list of typed parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// The text when this is a plain-text payload. Structured payloads return `None`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(t) => Some(t),
            Content::Parts(_) => None,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Content::Parts(_))
    }

    /// All text carried by the payload, structured text parts joined by newlines.
    /// Image references are skipped.
    pub fn plain_text(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageRef { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

/// Structural tag separating real conversation from injected context.
///
/// `EphemeralContext` turns (retrieval results) are dropped by compaction
/// instead of being summarised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnKind {
    #[default]
    Normal,
    EphemeralContext,
}

/// A single logged contribution to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: Content,
    #[serde(default)]
    pub kind: TurnKind,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            role,
            content: content.into(),
            kind: TurnKind::Normal,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text.into())
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text.into())
    }

    /// A multimodal turn built from typed parts.
    pub fn with_parts(role: Role, parts: Vec<ContentPart>) -> Self {
        Self::new(role, Content::Parts(parts))
    }

    /// Injected context that compaction is allowed to drop.
    pub fn ephemeral(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Content::Text(text.into()),
            kind: TurnKind::EphemeralContext,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.content.as_text()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.kind == TurnKind::EphemeralContext
    }
}

/// Per-session feature toggles persisted alongside the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Route completions to the deep-thinking model.
    #[serde(default)]
    pub reasoning_mode: bool,
}

/// Ordered conversation history for one session.
///
/// Holds at most one `system` turn, and only at index 0. Every mutator keeps
/// that invariant; deserialisation rejects logs that break it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Turn>", into = "Vec<Turn>")]
pub struct ConversationLog {
    turns: Vec<Turn>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh log seeded with a system prompt.
    pub fn with_system(prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::system(prompt)],
        }
    }

    /// Build a log from raw turns, validating the system-turn invariant.
    pub fn from_turns(turns: Vec<Turn>) -> Result<Self, KestrelError> {
        if let Some(pos) = turns.iter().rposition(|t| t.role == Role::System) {
            if pos != 0 {
                return Err(KestrelError::InvalidLog(format!(
                    "system turn at index {pos}, expected 0"
                )));
            }
        }
        Ok(Self { turns })
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn system(&self) -> Option<&Turn> {
        self.turns.first().filter(|t| t.role == Role::System)
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Replace the system prompt, or insert one at index 0.
    pub fn set_system(&mut self, prompt: impl Into<String>) {
        let turn = Turn::system(prompt);
        if self.system().is_some() {
            self.turns[0] = turn;
        } else {
            self.turns.insert(0, turn);
        }
    }

    /// Append a turn. A `system` turn replaces the existing prompt instead.
    pub fn push(&mut self, turn: Turn) {
        if turn.role == Role::System {
            self.set_system(turn.content.plain_text());
        } else {
            self.turns.push(turn);
        }
    }

    /// Insert a non-system turn immediately before the last turn.
    ///
    /// Appends when the log holds nothing but a system prompt.
    pub fn insert_before_last(&mut self, turn: Turn) {
        debug_assert!(turn.role != Role::System);
        let floor = usize::from(self.system().is_some());
        let at = self.turns.len().saturating_sub(1).max(floor);
        self.turns.insert(at, turn);
    }

    /// Drop everything except the system prompt.
    pub fn clear_history(&mut self) {
        self.turns.truncate(usize::from(self.system().is_some()));
    }

    pub fn into_turns(self) -> Vec<Turn> {
        self.turns
    }
}

impl TryFrom<Vec<Turn>> for ConversationLog {
    type Error = KestrelError;

    fn try_from(turns: Vec<Turn>) -> Result<Self, Self::Error> {
        Self::from_turns(turns)
    }
}

impl From<ConversationLog> for Vec<Turn> {
    fn from(log: ConversationLog) -> Self {
        log.turns
    }
}

impl<'a> IntoIterator for &'a ConversationLog {
    type Item = &'a Turn;
    type IntoIter = std::slice::Iter<'a, Turn>;

    fn into_iter(self) -> Self::IntoIter {
        self.turns.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_system_replaces_prompt_at_index_zero() {
        let mut log = ConversationLog::new();
        log.push(Turn::user("hi"));
        log.push(Turn::system("be nice"));
        log.push(Turn::system("be terse"));
        assert_eq!(log.len(), 2);
        assert_eq!(log.turns()[0].text(), Some("be terse"));
        assert_eq!(log.turns()[1].role, Role::User);
    }

    #[test]
    fn from_turns_rejects_late_system_turn() {
        let turns = vec![Turn::user("hi"), Turn::system("late")];
        assert!(ConversationLog::from_turns(turns).is_err());
    }

    #[test]
    fn insert_before_last_lands_ahead_of_final_user_turn() {
        let mut log = ConversationLog::with_system("sys");
        log.push(Turn::user("q"));
        log.insert_before_last(Turn::ephemeral(Role::User, "ctx"));
        assert_eq!(log.turns()[1].text(), Some("ctx"));
        assert_eq!(log.last().and_then(Turn::text), Some("q"));
    }

    #[test]
    fn insert_before_last_never_displaces_system() {
        let mut log = ConversationLog::with_system("sys");
        log.insert_before_last(Turn::ephemeral(Role::User, "ctx"));
        assert_eq!(log.turns()[0].role, Role::System);
        assert_eq!(log.turns()[1].text(), Some("ctx"));
    }

    #[test]
    fn clear_history_keeps_system() {
        let mut log = ConversationLog::with_system("sys");
        log.push(Turn::user("a"));
        log.push(Turn::assistant("b"));
        log.clear_history();
        assert_eq!(log.len(), 1);
        assert!(log.system().is_some());
    }

    #[test]
    fn serde_uses_plain_turn_array() {
        let mut log = ConversationLog::with_system("sys");
        log.push(Turn::with_parts(
            Role::User,
            vec![
                ContentPart::Text {
                    text: "look".into(),
                },
                ContentPart::ImageRef {
                    url: "https://x/y.png".into(),
                },
            ],
        ));
        log.push(Turn::ephemeral(Role::User, "results"));
        let json = serde_json::to_string(&log).unwrap();
        assert!(json.starts_with('['));
        assert!(json.contains(r#""kind":"ephemeral-context""#));
        assert!(json.contains(r#""type":"image_ref""#));
        let back: ConversationLog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, log);
    }

    #[test]
    fn deserialize_defaults_kind_and_validates() {
        let ok: ConversationLog =
            serde_json::from_str(r#"[{"role":"user","content":"hi"}]"#).unwrap();
        assert_eq!(ok.turns()[0].kind, TurnKind::Normal);

        let bad = serde_json::from_str::<ConversationLog>(
            r#"[{"role":"user","content":"hi"},{"role":"system","content":"s"}]"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn plain_text_joins_text_parts_only() {
        let c = Content::Parts(vec![
            ContentPart::Text { text: "a".into() },
            ContentPart::ImageRef { url: "u".into() },
            ContentPart::Text { text: "b".into() },
        ]);
        assert_eq!(c.plain_text(), "a\nb");
        assert!(c.as_text().is_none());
    }
}
