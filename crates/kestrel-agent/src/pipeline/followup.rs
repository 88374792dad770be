//! Follow-up question prediction. Best effort: any failure yields blanks.

use serde::Deserialize;
use tracing::{debug, warn};

use kestrel_core::config::PipelineConfig;

use crate::provider::{LlmProvider, ResponseSchema};

use super::structured::structured_call;

pub const FOLLOW_UP_COUNT: usize = 3;

const INSTRUCTION: &str = concat!(
    "Given a user's message and the assistant's reply, suggest three short ",
    "follow-up questions the user is likely to ask next. Write them in the ",
    "user's language, from the user's point of view, each under 80 characters."
);

#[derive(Deserialize)]
struct FollowUpReply {
    #[serde(default)]
    questions: Vec<String>,
}

fn schema() -> ResponseSchema {
    ResponseSchema::new(
        "follow_up_questions",
        serde_json::json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["questions"],
            "additionalProperties": false
        }),
    )
}

pub struct FollowUpPredictor<'a> {
    llm: &'a dyn LlmProvider,
    config: &'a PipelineConfig,
}

impl<'a> FollowUpPredictor<'a> {
    pub fn new(llm: &'a dyn LlmProvider, config: &'a PipelineConfig) -> Self {
        Self { llm, config }
    }

    /// Exactly three questions; empty strings stand in for missing ones.
    pub async fn predict(&self, user_text: &str, assistant_text: &str) -> [String; FOLLOW_UP_COUNT] {
        let input = format!("USER: {user_text}\n\nASSISTANT: {assistant_text}");
        let reply: Result<FollowUpReply, _> = structured_call(
            self.llm,
            &self.config.utility_model,
            self.config.classify_timeout(),
            INSTRUCTION,
            input,
            schema(),
        )
        .await;

        match reply {
            Ok(reply) => {
                let questions = normalize(reply.questions);
                debug!(count = questions.iter().filter(|q| !q.is_empty()).count(), "follow-ups predicted");
                questions
            }
            Err(e) => {
                warn!(error = %e, "follow-up prediction failed");
                Default::default()
            }
        }
    }
}

/// Trim, drop blanks, pad or truncate to three.
fn normalize(questions: Vec<String>) -> [String; FOLLOW_UP_COUNT] {
    let mut out: [String; FOLLOW_UP_COUNT] = Default::default();
    for (slot, q) in out.iter_mut().zip(
        questions
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty()),
    ) {
        *slot = q;
    }
    out
}
