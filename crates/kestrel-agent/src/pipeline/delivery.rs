use async_trait::async_trait;

/// Opaque platform handle for a message the pipeline published.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageHandle(pub String);

impl MessageHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The platform refused the content (too long, forbidden, ...).
    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("delivery transport error: {0}")]
    Transport(String),
}

/// Outbound side of a chat channel.
///
/// Calls are awaited one at a time by the pipeline, so an implementation
/// never sees a second `send` before the previous one resolved.
#[async_trait]
pub trait ChatDelivery: Send + Sync {
    async fn send(&self, content: &str) -> Result<MessageHandle, DeliveryError>;

    async fn edit(&self, handle: &MessageHandle, content: &str) -> Result<(), DeliveryError>;

    /// Offer follow-up questions under `handle`. Channels without a way to
    /// render them keep the default no-op.
    async fn attach_follow_ups(
        &self,
        _handle: &MessageHandle,
        _questions: &[String],
    ) -> Result<(), DeliveryError> {
        Ok(())
    }
}
