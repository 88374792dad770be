use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serenity::all::ButtonStyle;
use serenity::async_trait;
use serenity::builder::{CreateActionRow, CreateButton, CreateMessage, EditMessage};
use serenity::http::{Http, HttpError};
use serenity::model::id::{ChannelId, MessageId};
use tracing::debug;

use kestrel_agent::pipeline::{ChatDelivery, DeliveryError, MessageHandle};
use kestrel_core::SessionId;

use crate::followups::{button_label, custom_id, FollowUpRegistry};

/// Publishes pipeline output into one Discord channel.
///
/// The first message replies to the inbound message; later ones are plain
/// channel messages.
pub struct DiscordDelivery {
    http: Arc<Http>,
    channel_id: ChannelId,
    reply_to: Option<MessageId>,
    session: SessionId,
    follow_ups: Arc<FollowUpRegistry>,
    replied: AtomicBool,
}

impl DiscordDelivery {
    pub fn new(
        http: Arc<Http>,
        channel_id: ChannelId,
        reply_to: Option<MessageId>,
        session: SessionId,
        follow_ups: Arc<FollowUpRegistry>,
    ) -> Self {
        Self {
            http,
            channel_id,
            reply_to,
            session,
            follow_ups,
            replied: AtomicBool::new(false),
        }
    }
}

fn message_id(handle: &MessageHandle) -> Result<MessageId, DeliveryError> {
    match handle.as_str().parse::<u64>() {
        Ok(id) if id != 0 => Ok(MessageId::new(id)),
        _ => Err(DeliveryError::NotFound(handle.as_str().to_string())),
    }
}

fn map_err(e: serenity::Error) -> DeliveryError {
    match e {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(resp)) => {
            if resp.status_code.as_u16() == 404 {
                DeliveryError::NotFound(resp.error.message)
            } else {
                DeliveryError::Rejected(format!("{}: {}", resp.status_code, resp.error.message))
            }
        }
        serenity::Error::Model(e) => DeliveryError::Rejected(e.to_string()),
        other => DeliveryError::Transport(other.to_string()),
    }
}

#[async_trait]
impl ChatDelivery for DiscordDelivery {
    async fn send(&self, content: &str) -> Result<MessageHandle, DeliveryError> {
        let mut builder = CreateMessage::new().content(content);
        if let Some(reply_to) = self.reply_to {
            if !self.replied.swap(true, Ordering::Relaxed) {
                builder = builder.reference_message((self.channel_id, reply_to));
            }
        }
        let msg = self
            .channel_id
            .send_message(&self.http, builder)
            .await
            .map_err(map_err)?;
        Ok(MessageHandle::new(msg.id.get().to_string()))
    }

    async fn edit(&self, handle: &MessageHandle, content: &str) -> Result<(), DeliveryError> {
        let id = message_id(handle)?;
        self.channel_id
            .edit_message(&self.http, id, EditMessage::new().content(content))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn attach_follow_ups(
        &self,
        handle: &MessageHandle,
        questions: &[String],
    ) -> Result<(), DeliveryError> {
        let id = message_id(handle)?;
        let buttons = questions
            .iter()
            .enumerate()
            .map(|(i, q)| {
                CreateButton::new(custom_id(i))
                    .label(button_label(q))
                    .style(ButtonStyle::Secondary)
            })
            .collect();
        self.channel_id
            .edit_message(
                &self.http,
                id,
                EditMessage::new().components(vec![CreateActionRow::Buttons(buttons)]),
            )
            .await
            .map_err(map_err)?;

        self.follow_ups
            .offer(id.get(), self.session.clone(), questions.to_vec());
        debug!(message_id = id.get(), count = questions.len(), "follow-up buttons attached");
        Ok(())
    }
}
