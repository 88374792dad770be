use serenity::builder::CreateMessage;
use serenity::http::Http;
use serenity::model::id::{ChannelId, MessageId};

use kestrel_agent::pipeline::split_message;

/// Ceiling for one-shot replies (Discord's hard limit is 2000).
const CHUNK_MAX: usize = 1900;
const FENCE_LOOKAHEAD: usize = 80;

/// Send `text` to `channel_id` in fence-aware chunks. The first chunk
/// replies to `reply_to` when given.
pub async fn send_response(
    http: &Http,
    channel_id: ChannelId,
    text: &str,
    reply_to: Option<MessageId>,
) -> Result<(), serenity::Error> {
    for (i, chunk) in split_message(text, CHUNK_MAX, FENCE_LOOKAHEAD)
        .into_iter()
        .filter(|c| !c.trim().is_empty())
        .enumerate()
    {
        let mut msg = CreateMessage::new().content(chunk);
        if i == 0 {
            if let Some(id) = reply_to {
                msg = msg.reference_message((channel_id, id));
            }
        }
        channel_id.send_message(http, msg).await?;
    }
    Ok(())
}
