//! Provider failure → user-facing category.

use std::fmt;

use crate::provider::ProviderError;

use super::render::StreamFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Busy,
    AuthFailure,
    Unavailable,
    ContextTooLong,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Busy => "busy",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::ContextTooLong => "context_too_long",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Non-technical message shown in the channel.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::Busy => "The AI service is busy right now. Please try again in a moment.",
            ErrorKind::AuthFailure => {
                "The AI service rejected our credentials. An operator has to fix the configuration."
            }
            ErrorKind::Unavailable => "The AI service is unreachable at the moment. Please try again later.",
            ErrorKind::ContextTooLong => {
                "This conversation got too long for the model. Try `/reset` and ask again."
            }
            ErrorKind::Unknown => "Something went wrong while generating the reply.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a provider error.
pub fn classify(err: &ProviderError) -> ErrorKind {
    match err {
        ProviderError::Timeout { .. } => ErrorKind::Unavailable,
        ProviderError::RateLimited { .. } => ErrorKind::Busy,
        ProviderError::Cancelled | ProviderError::Parse(_) => ErrorKind::Unknown,
        ProviderError::Http(e) if e.is_connect() || e.is_timeout() => ErrorKind::Unavailable,
        other => classify_parts(other.status(), &other.to_string()),
    }
}

/// Classify a failed render (stream or delivery side).
pub fn classify_failure(failure: &StreamFailure) -> ErrorKind {
    match failure {
        StreamFailure::Provider(e) => classify(e),
        StreamFailure::Delivery(_) => ErrorKind::Unavailable,
        StreamFailure::Cancelled => ErrorKind::Unknown,
    }
}

/// Pure mapping from an optional HTTP status and an error message.
///
/// Context-length patterns are checked first: some APIs report them as 400
/// and some as 413 or even 429.
pub fn classify_parts(status: Option<u16>, message: &str) -> ErrorKind {
    let msg = message.to_ascii_lowercase();

    if status == Some(413)
        || [
            "context_length",
            "context length",
            "maximum context",
            "too many tokens",
            "prompt is too long",
        ]
        .iter()
        .any(|p| msg.contains(p))
    {
        return ErrorKind::ContextTooLong;
    }

    if matches!(status, Some(429 | 503 | 529))
        || ["rate limit", "rate_limit", "overloaded", "too many requests"]
            .iter()
            .any(|p| msg.contains(p))
    {
        return ErrorKind::Busy;
    }

    if matches!(status, Some(401 | 403))
        || ["invalid api key", "invalid_api_key", "unauthorized", "authentication"]
            .iter()
            .any(|p| msg.contains(p))
    {
        return ErrorKind::AuthFailure;
    }

    if matches!(status, Some(500..=599))
        || ["timed out", "timeout", "connection", "unavailable", "unreachable"]
            .iter()
            .any(|p| msg.contains(p))
    {
        return ErrorKind::Unavailable;
    }

    ErrorKind::Unknown
}
