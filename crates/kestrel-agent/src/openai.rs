use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use kestrel_core::{Content, ContentPart, Role, Turn};

use crate::provider::{error_for_status, ChatRequest, ChatResponse, LlmProvider, ProviderError};
use crate::stream::{parse_sse_line, LineBuffer, SseParsed, StreamEvent};

/// Chat completions against any OpenAI-compatible endpoint
/// (OpenAI, DeepSeek, Groq, local llama.cpp servers, ...).
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
        }
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;
        error_for_status(resp, "openai").await
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req, false);
        debug!(model = %req.model, structured = req.response_schema.is_some(), "sending request to OpenAI");

        let resp = self.post(&body).await?;
        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true);
        debug!(model = %req.model, "sending streaming request to OpenAI");

        let resp = self.post(&body).await?;
        process_openai_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }
}

/// Render one turn in the chat-completions wire shape.
///
/// Only user turns may carry `image_url` parts; images on other roles are
/// flattened into text references.
fn turn_to_json(turn: &Turn) -> serde_json::Value {
    let content = match &turn.content {
        Content::Text(text) => serde_json::Value::String(text.clone()),
        Content::Parts(parts) if turn.role != Role::User => serde_json::Value::String(
            parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.clone(),
                    ContentPart::ImageRef { url } => format!("[image: {url}]"),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Content::Parts(parts) => serde_json::Value::Array(
            parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => {
                        serde_json::json!({ "type": "text", "text": text })
                    }
                    ContentPart::ImageRef { url } => {
                        serde_json::json!({ "type": "image_url", "image_url": { "url": url } })
                    }
                })
                .collect(),
        ),
    };
    serde_json::json!({
        "role": turn.role.as_str(),
        "content": content,
    })
}

fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.messages.iter().map(turn_to_json).collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": stream,
    });

    if stream {
        body["stream_options"] = serde_json::json!({ "include_usage": true });
    }
    if let Some(t) = req.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if let Some(schema) = &req.response_schema {
        body["response_format"] = serde_json::json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema.name,
                "schema": schema.schema,
                "strict": true,
            }
        });
    }

    body
}

fn parse_response(resp: ApiResponse) -> ChatResponse {
    let choice = resp.choices.into_iter().next();
    let content = choice
        .as_ref()
        .and_then(|c| c.message.content.as_deref())
        .unwrap_or("")
        .to_string();
    let stop_reason = choice.and_then(|c| c.finish_reason).unwrap_or_default();

    ChatResponse {
        content,
        model: resp.model,
        tokens_in: resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
        tokens_out: resp
            .usage
            .as_ref()
            .map(|u| u.completion_tokens)
            .unwrap_or(0),
        stop_reason,
    }
}

/// Parse OpenAI streaming SSE response and emit StreamEvents.
/// Each data line contains a JSON delta object; `data: [DONE]` signals end.
async fn process_openai_stream(
    resp: reqwest::Response,
    model: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    use futures_util::StreamExt;

    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut stop_reason = String::new();
    let mut lines = LineBuffer::new();

    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        for line in lines.push(&chunk) {
            let Some(SseParsed::Data(data)) = parse_sse_line(&line) else {
                continue;
            };
            if data.trim() == "[DONE]" {
                break 'outer;
            }

            let Ok(chunk_resp) = serde_json::from_str::<StreamChunk>(&data) else {
                continue;
            };

            if let Some(usage) = &chunk_resp.usage {
                tokens_in = usage.prompt_tokens;
                tokens_out = usage.completion_tokens;
            }

            for choice in chunk_resp.choices {
                if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
                    stop_reason = reason;
                }
                for event in delta_events(choice.delta) {
                    if tx.send(event).await.is_err() {
                        return; // receiver dropped
                    }
                }
            }
        }
    }

    let _ = tx
        .send(StreamEvent::Done {
            model,
            tokens_in,
            tokens_out,
            stop_reason,
        })
        .await;
}

fn delta_events(delta: StreamDelta) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(text) = delta.reasoning_content.filter(|t| !t.is_empty()) {
        events.push(StreamEvent::Thinking { text });
    }
    if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
        debug!(len = text.len(), "openai stream text delta");
        events.push(StreamEvent::TextDelta { text });
    }
    events
}

// OpenAI API response types (private, deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// OpenAI streaming chunk types

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    /// DeepSeek-style side channel for reasoning tokens.
    reasoning_content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ResponseSchema;

    #[test]
    fn body_maps_structured_turns_to_image_parts() {
        let req = ChatRequest::new(
            "gpt-4o-mini",
            vec![
                Turn::system("sys"),
                Turn::with_parts(
                    Role::User,
                    vec![
                        ContentPart::Text {
                            text: "what is this".into(),
                        },
                        ContentPart::ImageRef {
                            url: "https://cdn/x.png".into(),
                        },
                    ],
                ),
            ],
        );
        let body = build_request_body(&req, false);
        assert_eq!(body["messages"][0]["content"], "sys");
        assert_eq!(body["messages"][1]["content"][1]["type"], "image_url");
        assert_eq!(
            body["messages"][1]["content"][1]["image_url"]["url"],
            "https://cdn/x.png"
        );
        assert!(body.get("response_format").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn assistant_image_parts_flatten_to_text() {
        let turn = Turn::with_parts(
            Role::Assistant,
            vec![
                ContentPart::Text {
                    text: "Here you go".into(),
                },
                ContentPart::ImageRef {
                    url: "https://img/1.png".into(),
                },
            ],
        );
        let json = turn_to_json(&turn);
        assert_eq!(json["content"], "Here you go\n[image: https://img/1.png]");
    }

    #[test]
    fn body_carries_schema_and_stream_usage() {
        let req = ChatRequest::new("m", vec![Turn::user("hi")])
            .with_schema(ResponseSchema::new(
                "decision",
                serde_json::json!({"type": "object"}),
            ))
            .with_temperature(0.0);
        let body = build_request_body(&req, true);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "decision");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["temperature"], 0.0);
    }

    #[test]
    fn reasoning_delta_becomes_thinking_event() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"reasoning_content":"hmm","content":null},"finish_reason":null}]}"#,
        )
        .unwrap();
        let events: Vec<StreamEvent> = chunk
            .choices
            .into_iter()
            .flat_map(|c| delta_events(c.delta))
            .collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Thinking { text } if text == "hmm"));
    }

    #[test]
    fn usage_only_chunk_parses_without_choices() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"usage":{"prompt_tokens":12,"completion_tokens":3}}"#,
        )
        .unwrap();
        assert!(chunk.choices.is_empty());
        assert_eq!(chunk.usage.unwrap().prompt_tokens, 12);
    }
}
