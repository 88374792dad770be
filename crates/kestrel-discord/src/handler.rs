use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serenity::async_trait;
use serenity::builder::{CreateInteractionResponse, CreateInteractionResponseMessage};
use serenity::http::Http;
use serenity::model::application::{ComponentInteraction, Interaction};
use serenity::model::channel::{Attachment, Message};
use serenity::model::gateway::Ready;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use serenity::prelude::{Context, EventHandler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kestrel_agent::pipeline::{TurnOutcome, TurnPipeline};
use kestrel_core::config::DiscordConfig;
use kestrel_core::{ContentPart, Role, SessionId, Turn};

use crate::delivery::DiscordDelivery;
use crate::followups::{parse_custom_id, FollowUpRegistry};
use crate::send;

/// Serenity event handler wired to the turn pipeline.
pub struct DiscordHandler {
    pub pipeline: Arc<TurnPipeline>,
    pub config: DiscordConfig,
    pub bot_id: OnceLock<UserId>,
    /// Turns still streaming, keyed by the inbound message that started them.
    pub in_flight: Arc<DashMap<MessageId, CancellationToken>>,
    pub follow_ups: Arc<FollowUpRegistry>,
}

impl DiscordHandler {
    /// Run one turn in the background. Deleting `inbound` (when given)
    /// cancels it.
    fn spawn_turn(
        &self,
        http: Arc<Http>,
        channel_id: ChannelId,
        inbound: Option<MessageId>,
        session: SessionId,
        turn: Turn,
    ) {
        let cancel = CancellationToken::new();
        if let Some(id) = inbound {
            self.in_flight.insert(id, cancel.clone());
        }

        let pipeline = Arc::clone(&self.pipeline);
        let in_flight = Arc::clone(&self.in_flight);
        let delivery = DiscordDelivery::new(
            Arc::clone(&http),
            channel_id,
            inbound,
            session.clone(),
            Arc::clone(&self.follow_ups),
        );

        tokio::spawn(async move {
            let _typing = channel_id.start_typing(&http);
            let outcome = pipeline
                .handle_turn(&session, turn, &delivery, cancel)
                .await;
            if let Some(id) = inbound {
                in_flight.remove(&id);
            }
            match outcome {
                TurnOutcome::Done(summary) => debug!(
                    session = %session,
                    messages = summary.reply.messages.len(),
                    tokens_out = summary.reply.tokens_out,
                    "discord turn done"
                ),
                TurnOutcome::Failed(failure) => debug!(
                    session = %session,
                    kind = %failure.kind,
                    "discord turn failed"
                ),
            }
        });
    }

    async fn follow_up_pressed(&self, ctx: &Context, component: &ComponentInteraction) {
        let Some(index) = parse_custom_id(&component.data.custom_id) else {
            return;
        };
        let session = session_for(component.user.id);
        let claimed = self
            .follow_ups
            .claim(component.message.id.get(), index, &session);

        let Some(question) = claimed else {
            let reply = CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content("That suggestion is no longer available.")
                    .ephemeral(true),
            );
            if let Err(e) = component.create_response(&ctx.http, reply).await {
                warn!(error = %e, "follow-up response failed");
            }
            return;
        };

        if let Err(e) = component
            .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
            .await
        {
            warn!(error = %e, "follow-up acknowledge failed");
        }

        info!(session = %session, index, "follow-up selected");
        self.spawn_turn(
            Arc::clone(&ctx.http),
            component.channel_id,
            None,
            session,
            Turn::user(question),
        );
    }
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        self.bot_id.set(ready.user.id).ok();
        info!(name = %ready.user.name, "Discord bot connected");
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let is_guild = msg.guild_id.is_some();

        if is_guild && self.config.require_mention {
            let Some(bot_id) = self.bot_id.get() else {
                return;
            };
            if !msg.mentions_user_id(*bot_id) {
                return;
            }
        }

        if !is_guild && !self.config.dm_allowed {
            return;
        }

        let content = strip_mention(&msg.content).trim().to_string();
        let session = session_for(msg.author.id);

        // Intercept text commands before they reach the model.
        if content.starts_with('/') {
            if let Some(response) = self.pipeline.handle_command(&session, &content).await {
                if let Err(e) =
                    send::send_response(&ctx.http, msg.channel_id, &response, Some(msg.id)).await
                {
                    warn!(error = %e, session = %session, "command reply failed");
                }
                return;
            }
        }

        let images = image_urls(&msg.attachments);
        if content.is_empty() && images.is_empty() {
            return;
        }

        self.spawn_turn(
            Arc::clone(&ctx.http),
            msg.channel_id,
            Some(msg.id),
            session,
            inbound_turn(content, images),
        );
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        _channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        if let Some((_, cancel)) = self.in_flight.remove(&deleted_message_id) {
            info!(message_id = %deleted_message_id, "inbound message deleted, cancelling turn");
            cancel.cancel();
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Component(component) = interaction {
            self.follow_up_pressed(&ctx, &component).await;
        }
    }
}

/// One conversation per Discord user, shared across guilds and DMs.
fn session_for(user: UserId) -> SessionId {
    SessionId::new(format!("discord:{user}"))
}

/// Remove an @mention prefix (e.g. `<@123456789>`) from a message.
fn strip_mention(s: &str) -> &str {
    let trimmed = s.trim_start();
    if trimmed.starts_with("<@") {
        if let Some(end) = trimmed.find('>') {
            return trimmed[end + 1..].trim_start();
        }
    }
    trimmed
}

fn is_image(content_type: Option<&str>, filename: &str) -> bool {
    if let Some(ct) = content_type {
        return ct.starts_with("image/");
    }
    let lower = filename.to_lowercase();
    matches!(
        lower.rsplit('.').next(),
        Some("png" | "jpg" | "jpeg" | "gif" | "webp")
    )
}

fn image_urls(attachments: &[Attachment]) -> Vec<String> {
    attachments
        .iter()
        .filter(|a| is_image(a.content_type.as_deref(), &a.filename))
        .map(|a| a.url.clone())
        .collect()
}

/// Plain text, or text plus image references when images were attached.
fn inbound_turn(text: String, images: Vec<String>) -> Turn {
    if images.is_empty() {
        return Turn::user(text);
    }
    let mut parts = Vec::with_capacity(images.len() + 1);
    if !text.is_empty() {
        parts.push(ContentPart::Text { text });
    }
    parts.extend(images.into_iter().map(|url| ContentPart::ImageRef { url }));
    Turn::with_parts(Role::User, parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::Content;

    #[test]
    fn mention_prefix_is_stripped() {
        assert_eq!(strip_mention("<@123> hello"), "hello");
        assert_eq!(strip_mention("  <@!123>/reset"), "/reset");
        assert_eq!(strip_mention("no mention"), "no mention");
    }

    #[test]
    fn sessions_are_per_user() {
        assert_eq!(session_for(UserId::new(42)).as_str(), "discord:42");
    }

    #[test]
    fn images_detected_by_type_or_extension() {
        assert!(is_image(Some("image/png"), "x.bin"));
        assert!(!is_image(Some("text/plain"), "x.png"));
        assert!(is_image(None, "Photo.JPG"));
        assert!(!is_image(None, "notes.txt"));
    }

    #[test]
    fn attachments_become_structured_turns() {
        let plain = inbound_turn("hi".into(), vec![]);
        assert_eq!(plain.text(), Some("hi"));

        let turn = inbound_turn("what is this?".into(), vec!["https://cdn/a.png".into()]);
        assert_eq!(turn.role, Role::User);
        let Content::Parts(parts) = &turn.content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[1], ContentPart::ImageRef { url } if url == "https://cdn/a.png"));

        let image_only = inbound_turn(String::new(), vec!["https://cdn/b.png".into()]);
        let Content::Parts(parts) = &image_only.content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 1);
    }
}
