//! History compaction: collapse old turns into one summary turn.
//!
//! Runs synchronously before the completion call whenever the log plus the
//! new turn would reach `max_context_tokens`. Retrieval context is dropped
//! rather than summarised. If the summariser fails twice the history is
//! truncated: losing old turns beats blocking the user.

use kestrel_core::config::PipelineConfig;
use kestrel_core::{ConversationLog, Role, Turn};
use tracing::{info, warn};

use crate::provider::{with_timeout, ChatRequest, LlmProvider, ProviderError};

use super::budget::{estimate, estimate_turn};
use super::structured::turn_text;

/// Prefix carried by every summary turn.
pub const SUMMARY_PREFIX: &str = "[Earlier conversation summary]\n";

const MAX_ATTEMPTS: usize = 2;

const SUMMARY_INSTRUCTION: &str = concat!(
    "You condense chat transcripts. Summarise the conversation below in a few ",
    "short sentences, keeping names, decisions, open questions and anything the ",
    "user asked to remember. Write in the language of the conversation. ",
    "Reply with the summary only."
);

/// What compaction did to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// History replaced by a summary turn.
    Summarized,
    /// Summary unavailable or too large; history dropped.
    Truncated,
    /// Only system / injected turns were present.
    NothingToSummarize,
}

pub struct HistoryCompactor<'a> {
    llm: &'a dyn LlmProvider,
    config: &'a PipelineConfig,
}

impl<'a> HistoryCompactor<'a> {
    pub fn new(llm: &'a dyn LlmProvider, config: &'a PipelineConfig) -> Self {
        Self { llm, config }
    }

    /// Rebuild `log` as `system? + summary? + new_turn`.
    ///
    /// `new_turn` is normally not yet in `log`; when it is already the last
    /// turn it is treated as the new turn rather than as history.
    pub async fn compact(
        &self,
        log: &ConversationLog,
        new_turn: Turn,
    ) -> (ConversationLog, CompactionOutcome) {
        let mut turns = log.turns();
        if turns.last() == Some(&new_turn) {
            turns = &turns[..turns.len() - 1];
        }

        let history: Vec<&Turn> = turns
            .iter()
            .filter(|t| t.role != Role::System && !t.is_ephemeral())
            .collect();

        let mut compacted = ConversationLog::new();
        if let Some(system) = log.system() {
            compacted.push(system.clone());
        }

        if history.is_empty() {
            compacted.push(new_turn);
            return (compacted, CompactionOutcome::NothingToSummarize);
        }

        let history_tokens: usize = history.iter().map(|t| estimate_turn(t)).sum();
        let summary = match self.summarize(&history).await {
            Ok(text) => clamp_summary(text, history_tokens),
            Err(e) => {
                warn!(error = %e, turns = history.len(), "compaction: summary unavailable, truncating history");
                None
            }
        };

        let Some(summary) = summary else {
            compacted.push(new_turn);
            return (compacted, CompactionOutcome::Truncated);
        };

        let with_summary = {
            let mut log = compacted.clone();
            log.push(summary);
            log.push(new_turn.clone());
            log
        };

        if estimate(&with_summary) >= self.config.max_context_tokens {
            info!(
                max_tokens = self.config.max_context_tokens,
                "compaction: summary does not fit the budget, dropping it"
            );
            compacted.push(new_turn);
            return (compacted, CompactionOutcome::Truncated);
        }

        info!(
            turns_in = log.len(),
            turns_out = with_summary.len(),
            tokens_in = estimate(log),
            tokens_out = estimate(&with_summary),
            "compaction: history summarised"
        );
        (with_summary, CompactionOutcome::Summarized)
    }

    async fn summarize(&self, history: &[&Turn]) -> Result<String, ProviderError> {
        let transcript = history
            .iter()
            .map(|t| format!("{}: {}", t.role.as_str().to_uppercase(), turn_text(t)))
            .collect::<Vec<_>>()
            .join("\n\n");

        let req = ChatRequest::new(
            self.config.utility_model.clone(),
            vec![Turn::system(SUMMARY_INSTRUCTION), Turn::user(transcript)],
        )
        .with_max_tokens(512);

        let mut last_err = ProviderError::Unavailable("summary not attempted".to_string());
        for attempt in 1..=MAX_ATTEMPTS {
            match with_timeout(self.config.summary_timeout(), self.llm.send(&req)).await {
                Ok(resp) if !resp.content.trim().is_empty() => {
                    return Ok(resp.content.trim().to_string())
                }
                Ok(_) => {
                    last_err = ProviderError::Parse("empty summary".to_string());
                }
                Err(e) => last_err = e,
            }
            warn!(attempt, error = %last_err, "compaction: summary attempt failed");
        }
        Err(last_err)
    }
}

/// Shrink `summary` until its turn costs strictly less than the history it
/// replaces. `None` when nothing useful is left.
fn clamp_summary(summary: String, history_tokens: usize) -> Option<Turn> {
    let mut text = summary;
    loop {
        let turn = Turn::assistant(format!("{SUMMARY_PREFIX}{text}"));
        if estimate_turn(&turn) < history_tokens {
            return Some(turn);
        }
        let keep = text.chars().count() / 2;
        if keep == 0 {
            return None;
        }
        text = text.chars().take(keep).collect();
    }
}
