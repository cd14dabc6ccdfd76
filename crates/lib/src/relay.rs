//! Relay one normalized event: pick a reply and send it back through the inbound channel.

use crate::channels::{ChannelRegistry, InboundMessage, OutboundMessage};
use crate::normalize::Normalized;
use crate::reply::ReplySelector;

/// What happened to one webhook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Replied,
    Ignored(&'static str),
    /// Dispatch failed; logged and swallowed so the webhook is still acknowledged.
    Failed(String),
}

/// Send the selected reply for `msg`. Failures are logged, never returned.
pub async fn process_inbound(
    registry: &ChannelRegistry,
    selector: &ReplySelector,
    msg: &InboundMessage,
) -> RelayOutcome {
    let Some(handle) = registry.get(&msg.channel_id).await else {
        log::warn!(
            "no channel registered for {}; dropping message for chat {}",
            msg.channel_id,
            msg.chat_id
        );
        return RelayOutcome::Failed(format!("channel {} not registered", msg.channel_id));
    };
    let reply = selector.select(&msg.text);
    let outbound = OutboundMessage::reply_to(msg, reply);
    log::info!(
        "{}: replying to chat {} ({})",
        msg.channel_id,
        msg.chat_id,
        outbound.message_id
    );
    match handle.send_message(&outbound).await {
        Ok(()) => RelayOutcome::Replied,
        Err(e) => {
            log::warn!("{}: reply to chat {} failed: {}", msg.channel_id, msg.chat_id, e);
            RelayOutcome::Failed(e.to_string())
        }
    }
}

/// Relay or skip one normalizer result.
pub async fn relay(
    registry: &ChannelRegistry,
    selector: &ReplySelector,
    event: Normalized,
) -> RelayOutcome {
    match event {
        Normalized::Message(msg) => process_inbound(registry, selector, &msg).await,
        Normalized::Ignore(reason) => {
            log::debug!("ignoring webhook event: {}", reason);
            RelayOutcome::Ignored(reason.as_str())
        }
    }
}
