//! Follow-up buttons: which questions hang under which bot message.
//!
//! Button custom ids only carry an index (`followup:{i}`); the question text
//! and the owning session live here, keyed by the message id.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use kestrel_core::SessionId;

const PREFIX: &str = "followup:";

/// Offered follow-ups are dropped after this long.
const TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Discord caps button labels at 80 characters.
const LABEL_MAX: usize = 80;

struct Offer {
    session: SessionId,
    questions: Vec<String>,
    offered_at: Instant,
}

#[derive(Default)]
pub struct FollowUpRegistry {
    offers: DashMap<u64, Offer>,
}

impl FollowUpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `questions` under `message_id`, replacing any earlier offer.
    pub fn offer(&self, message_id: u64, session: SessionId, questions: Vec<String>) {
        self.offers
            .retain(|_, offer| offer.offered_at.elapsed() < TTL);
        self.offers.insert(
            message_id,
            Offer {
                session,
                questions,
                offered_at: Instant::now(),
            },
        );
    }

    /// Claim the question behind button `index` of `message_id` for
    /// `requester`.
    ///
    /// Only the session the questions were offered to may claim them. The
    /// offer is consumed so a second press does nothing.
    pub fn claim(&self, message_id: u64, index: usize, requester: &SessionId) -> Option<String> {
        let (_, offer) = self
            .offers
            .remove_if(&message_id, |_, offer| &offer.session == requester)?;
        if offer.offered_at.elapsed() >= TTL {
            return None;
        }
        offer.questions.into_iter().nth(index)
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

pub fn custom_id(index: usize) -> String {
    format!("{PREFIX}{index}")
}

/// Button index from a component custom id, if it is one of ours.
pub fn parse_custom_id(id: &str) -> Option<usize> {
    id.strip_prefix(PREFIX)?.parse().ok()
}

/// Shorten a question to fit a button label.
pub fn button_label(question: &str) -> String {
    if question.chars().count() <= LABEL_MAX {
        return question.to_string();
    }
    let mut label: String = question.chars().take(LABEL_MAX - 1).collect();
    label.push('…');
    label
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_ids_round_trip() {
        assert_eq!(parse_custom_id(&custom_id(2)), Some(2));
        assert_eq!(parse_custom_id("other:1"), None);
        assert_eq!(parse_custom_id("followup:x"), None);
    }

    #[test]
    fn claim_consumes_offer() {
        let reg = FollowUpRegistry::new();
        reg.offer(
            42,
            SessionId::new("discord:7"),
            vec!["a".into(), "b".into()],
        );
        let owner = SessionId::new("discord:7");
        assert_eq!(reg.claim(42, 1, &owner).as_deref(), Some("b"));
        assert!(reg.claim(42, 0, &owner).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn other_sessions_cannot_claim() {
        let reg = FollowUpRegistry::new();
        reg.offer(9, SessionId::new("discord:1"), vec!["mine".into()]);
        assert!(reg.claim(9, 0, &SessionId::new("discord:2")).is_none());
        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.claim(9, 0, &SessionId::new("discord:1")).as_deref(),
            Some("mine")
        );
    }

    #[test]
    fn out_of_range_index_is_none() {
        let reg = FollowUpRegistry::new();
        let owner = SessionId::new("s");
        reg.offer(1, owner.clone(), vec!["only".into()]);
        assert!(reg.claim(1, 3, &owner).is_none());
    }

    #[test]
    fn long_labels_are_truncated() {
        let label = button_label(&"q".repeat(200));
        assert_eq!(label.chars().count(), LABEL_MAX);
        assert!(label.ends_with('…'));
        assert_eq!(button_label("short"), "short");
    }
}
