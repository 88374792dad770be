use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use serenity::model::gateway::GatewayIntents;
use serenity::Client;
use tracing::{error, info, warn};

use kestrel_agent::pipeline::TurnPipeline;
use kestrel_core::config::DiscordConfig;

use crate::error::DiscordError;
use crate::followups::FollowUpRegistry;
use crate::handler::DiscordHandler;

/// Discord channel adapter.
///
/// Wraps a serenity `Client` and drives the event loop until the process
/// exits, reconnecting whenever the gateway drops. In-flight turns and
/// offered follow-ups survive reconnects.
pub struct DiscordAdapter {
    pipeline: Arc<TurnPipeline>,
    config: DiscordConfig,
    in_flight: Arc<DashMap<serenity::model::id::MessageId, tokio_util::sync::CancellationToken>>,
    follow_ups: Arc<FollowUpRegistry>,
}

impl DiscordAdapter {
    pub fn new(config: &DiscordConfig, pipeline: Arc<TurnPipeline>) -> Result<Self, DiscordError> {
        if config.bot_token.trim().is_empty() {
            return Err(DiscordError::NoToken);
        }
        Ok(Self {
            pipeline,
            config: config.clone(),
            in_flight: Arc::new(DashMap::new()),
            follow_ups: Arc::new(FollowUpRegistry::new()),
        })
    }

    /// Connect to Discord and keep reconnecting whenever the gateway drops.
    ///
    /// Never returns.
    pub async fn run(self) {
        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        loop {
            let mut client = loop {
                match self.build_client(intents).await {
                    Ok(c) => break c,
                    Err(e) => {
                        error!("Discord: connect failed ({e}), retrying in 30s");
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                }
            };

            info!("Discord: gateway connecting");
            if let Err(e) = client.start().await {
                warn!("Discord: gateway error ({e}), reconnecting in 5s");
            } else {
                info!("Discord: gateway stopped cleanly, reconnecting in 5s");
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    /// Build a fresh serenity `Client` sharing the adapter's turn state.
    async fn build_client(&self, intents: GatewayIntents) -> Result<Client, serenity::Error> {
        let handler = DiscordHandler {
            pipeline: Arc::clone(&self.pipeline),
            config: self.config.clone(),
            bot_id: OnceLock::new(),
            in_flight: Arc::clone(&self.in_flight),
            follow_ups: Arc::clone(&self.follow_ups),
        };
        Client::builder(&self.config.bot_token, intents)
            .event_handler(handler)
            .await
    }
}
