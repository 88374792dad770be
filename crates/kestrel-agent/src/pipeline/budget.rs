//! Token budget estimates.
//!
//! A cheap, deterministic stand-in for the provider's tokenizer: four
//! overhead tokens per turn, one token per four ASCII characters (rounded
//! up) and one per non-ASCII character. Structured (multimodal) turns count
//! zero, matching what the completion endpoint bills for their text.

use kestrel_core::{ConversationLog, Turn};

/// Fixed per-message framing cost (role + separators).
const TURN_OVERHEAD: usize = 4;

/// Estimated and allowed token counts for one pipeline invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub max_tokens: usize,
    pub current_tokens: usize,
}

impl TokenBudget {
    /// Measure `log` against `max_tokens`.
    pub fn measure(log: &ConversationLog, max_tokens: usize) -> Self {
        Self {
            max_tokens,
            current_tokens: estimate(log),
        }
    }

    pub fn remaining(&self) -> usize {
        self.max_tokens.saturating_sub(self.current_tokens)
    }

    pub fn is_exceeded(&self) -> bool {
        self.current_tokens >= self.max_tokens
    }
}

/// Estimated token count of the text-bearing turns in `log`.
pub fn estimate(log: &ConversationLog) -> usize {
    log.iter().map(estimate_turn).sum()
}

/// Estimated token count of one turn; zero for structured content.
pub fn estimate_turn(turn: &Turn) -> usize {
    turn.text().map(estimate_message).unwrap_or(0)
}

/// Estimated cost of `text` sent as a single message.
pub fn estimate_message(text: &str) -> usize {
    TURN_OVERHEAD + estimate_text(text)
}

/// Estimated token count of bare text, without message overhead.
pub fn estimate_text(text: &str) -> usize {
    let (ascii, other) = text.chars().fold((0usize, 0usize), |(a, o), c| {
        if c.is_ascii() {
            (a + 1, o)
        } else {
            (a, o + 1)
        }
    });
    ascii.div_ceil(4) + other
}

/// True iff adding `candidate` to `log` reaches `max_tokens`.
pub fn exceeds(log: &ConversationLog, candidate: &str, max_tokens: usize) -> bool {
    estimate(log) + estimate_message(candidate) >= max_tokens
}

/// Like [`exceeds`], for a full turn (structured turns add nothing).
pub fn would_exceed(log: &ConversationLog, turn: &Turn, max_tokens: usize) -> bool {
    estimate(log) + estimate_turn(turn) >= max_tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{ContentPart, Role};

    #[test]
    fn ascii_rounds_up_in_quarters() {
        assert_eq!(estimate_text(""), 0);
        assert_eq!(estimate_text("abc"), 1);
        assert_eq!(estimate_text("abcd"), 1);
        assert_eq!(estimate_text("abcde"), 2);
        assert_eq!(estimate_message("abcd"), 5);
    }

    #[test]
    fn non_ascii_counts_one_per_char() {
        assert_eq!(estimate_text("日本語"), 3);
        assert_eq!(estimate_text("ab日本"), 3);
    }

    #[test]
    fn structured_turns_are_free() {
        let turn = Turn::with_parts(
            Role::User,
            vec![
                ContentPart::Text {
                    text: "a long caption that would otherwise cost tokens".into(),
                },
                ContentPart::ImageRef { url: "u".into() },
            ],
        );
        assert_eq!(estimate_turn(&turn), 0);
    }

    #[test]
    fn estimate_is_monotonic_as_turns_append() {
        let mut log = ConversationLog::with_system("sys");
        let mut last = estimate(&log);
        for text in ["hi", "", "a much longer reply with many words", "ü"] {
            log.push(Turn::user(text));
            let now = estimate(&log);
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn exceeds_is_inclusive_at_the_limit() {
        let log = ConversationLog::with_system("abcd"); // 5
        assert!(!exceeds(&log, "abcd", 11)); // 5 + 5 = 10 < 11
        assert!(exceeds(&log, "abcd", 10));
        assert!(would_exceed(&log, &Turn::user("abcd"), 10));
    }

    #[test]
    fn budget_reports_remaining() {
        let log = ConversationLog::with_system("abcd");
        let budget = TokenBudget::measure(&log, 8);
        assert_eq!(budget.current_tokens, 5);
        assert_eq!(budget.remaining(), 3);
        assert!(!budget.is_exceeded());
    }
}
