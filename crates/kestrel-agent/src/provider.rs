use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use kestrel_core::Turn;

use crate::stream::StreamEvent;

/// Strict JSON schema the model's reply must satisfy.
///
/// Providers that support structured output pass it through
/// (`response_format: json_schema`); callers still validate the result.
#[derive(Debug, Clone)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

impl ResponseSchema {
    pub fn new(name: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// Full prompt list. A `system` turn, when present, comes first.
    pub messages: Vec<Turn>,
    pub max_tokens: u32,
    pub stream: bool,
    /// Constrains the reply to a JSON document (classification-style calls).
    pub response_schema: Option<ResponseSchema>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Turn>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: 1024,
            stream: false,
            response_schema: None,
            temperature: None,
        }
    }

    pub fn with_schema(mut self, schema: ResponseSchema) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Response from an LLM provider (non-streaming).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
}

/// Common interface for chat-completion backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send a non-streaming chat request, wait for full response.
    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream response events through a channel.
    /// Default: falls back to non-streaming send, emits TextDelta + Done.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.send(req).await?;
        let _ = tx.send(StreamEvent::TextDelta { text: resp.content }).await;
        let _ = tx
            .send(StreamEvent::Done {
                model: resp.model,
                tokens_in: resp.tokens_in,
                tokens_out: resp.tokens_out,
                stop_reason: resp.stop_reason,
            })
            .await;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Api { status, .. } => Some(*status),
            ProviderError::RateLimited { .. } => Some(429),
            ProviderError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Run `fut` under `limit`, mapping expiry to [`ProviderError::Timeout`].
pub async fn with_timeout<T, F>(limit: std::time::Duration, fut: F) -> Result<T, ProviderError>
where
    F: std::future::Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            ms: limit.as_millis() as u64,
        }),
    }
}

/// Turn a non-2xx response into a `ProviderError`, passing successes through.
pub(crate) async fn error_for_status(
    resp: reqwest::Response,
    provider: &str,
) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status().as_u16();
    if status == 429 {
        let retry = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|s| s * 1000) // convert seconds to ms
            .unwrap_or(5000);
        return Err(ProviderError::RateLimited {
            retry_after_ms: retry,
        });
    }

    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        warn!(status, provider, body = %text, "provider API error");
        return Err(ProviderError::Api {
            status,
            message: text,
        });
    }

    Ok(resp)
}
