//! Schema-constrained utility calls (classification, image spec, follow-ups).

use std::time::Duration;

use serde::de::DeserializeOwned;

use kestrel_core::{Content, ContentPart, ConversationLog, Role, Turn};

use crate::provider::{with_timeout, ChatRequest, LlmProvider, ProviderError, ResponseSchema};

/// Narrow `raw` to its outermost `{...}` span.
///
/// Models that ignore `response_format` tend to wrap JSON in prose or a code
/// fence; the span between the first `{` and the last `}` is what we parse.
pub fn extract_json_object(raw: &str) -> &str {
    let raw = raw.trim();
    match (raw.find('{'), raw.rfind('}')) {
        (Some(s), Some(e)) if e >= s => &raw[s..=e],
        _ => raw,
    }
}

/// Parse a model reply into `T`, mapping any failure to [`ProviderError::Parse`].
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, ProviderError> {
    serde_json::from_str(extract_json_object(raw)).map_err(|e| ProviderError::Parse(e.to_string()))
}

/// One schema-constrained call: instruction + input → parsed `T`, under `limit`.
pub async fn structured_call<T: DeserializeOwned>(
    llm: &dyn LlmProvider,
    model: &str,
    limit: Duration,
    instruction: &str,
    input: String,
    schema: ResponseSchema,
) -> Result<T, ProviderError> {
    let req = ChatRequest::new(model, vec![Turn::system(instruction), Turn::user(input)])
        .with_schema(schema)
        .with_max_tokens(512)
        .with_temperature(0.0);
    let resp = with_timeout(limit, llm.send(&req)).await?;
    parse_structured(&resp.content)
}

/// Plain-text transcript of the last `limit` conversational turns.
///
/// System and injected-context turns are skipped; image parts render as
/// `[image]`.
pub fn recent_transcript(log: &ConversationLog, limit: usize) -> String {
    let turns: Vec<&Turn> = log
        .iter()
        .filter(|t| t.role != Role::System && !t.is_ephemeral())
        .collect();
    let start = turns.len().saturating_sub(limit);
    turns[start..]
        .iter()
        .map(|t| format!("{}: {}", t.role.as_str().to_uppercase(), turn_text(t)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Turn content flattened for prompts.
pub fn turn_text(turn: &Turn) -> String {
    match &turn.content {
        Content::Text(t) => t.clone(),
        Content::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.as_str(),
                ContentPart::ImageRef { .. } => "[image]",
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Probe {
        ok: bool,
    }

    #[test]
    fn extracts_object_from_fenced_reply() {
        let raw = "Sure!\n```json\n{\"ok\": true}\n```";
        assert_eq!(extract_json_object(raw), "{\"ok\": true}");
        assert_eq!(parse_structured::<Probe>(raw).unwrap(), Probe { ok: true });
    }

    #[test]
    fn malformed_reply_is_parse_error() {
        let err = parse_structured::<Probe>("no json here").unwrap_err();
        assert!(matches!(err, ProviderError::Parse(_)));
        let err = parse_structured::<Probe>("{\"ok\": \"yes\"}").unwrap_err();
        assert!(matches!(err, ProviderError::Parse(_)));
    }

    #[test]
    fn transcript_skips_system_and_ephemeral_turns() {
        let mut log = ConversationLog::with_system("sys");
        log.push(Turn::user("one"));
        log.push(Turn::assistant("two"));
        log.push(Turn::ephemeral(Role::User, "search results"));
        log.push(Turn::with_parts(
            Role::User,
            vec![
                ContentPart::Text {
                    text: "three".into(),
                },
                ContentPart::ImageRef { url: "u".into() },
            ],
        ));
        assert_eq!(
            recent_transcript(&log, 2),
            "ASSISTANT: two\n\nUSER: three [image]"
        );
    }
}
