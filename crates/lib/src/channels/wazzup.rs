//! Wazzup channel: sendMessage via the v3 API with a static API key.

use async_trait::async_trait;
use serde::Serialize;

use crate::channels::registry::ChannelHandle;
use crate::channels::{MessageKind, OutboundMessage};
use crate::config::{self, Config};
use crate::dispatch::{send_with_retry, DispatchError, RetryPolicy, StaticToken};
use crate::normalize::WAZZUP_CHANNEL;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    channel_id: &'a str,
    chat_type: &'a str,
    chat_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_uri: Option<&'a str>,
    crm_message_id: &'a str,
}

pub struct WazzupChannel {
    base_url: String,
    api_key: StaticToken,
    policy: RetryPolicy,
    client: reqwest::Client,
}

impl WazzupChannel {
    pub fn new(config: &Config, api_key: String) -> Self {
        Self {
            base_url: config::resolve_wazzup_base_url(config),
            api_key: StaticToken(api_key),
            policy: RetryPolicy::from(&config.retry),
            client: reqwest::Client::new(),
        }
    }
}

fn send_request(message: &OutboundMessage) -> Result<SendRequest<'_>, DispatchError> {
    let channel_id = message
        .source_channel
        .as_deref()
        .ok_or(DispatchError::MissingField("wazzup channelId"))?;
    let chat_type = message
        .chat_type
        .as_deref()
        .ok_or(DispatchError::MissingField("wazzup chatType"))?;
    // Media messages carry the file URL instead of text.
    let (text, content_uri) = match (message.kind, message.media_url.as_deref()) {
        (MessageKind::Text, _) | (_, None) => (Some(message.text.as_str()), None),
        (_, Some(uri)) => (None, Some(uri)),
    };
    Ok(SendRequest {
        channel_id,
        chat_type,
        chat_id: &message.chat_id,
        text,
        content_uri,
        crm_message_id: &message.message_id,
    })
}

#[async_trait]
impl ChannelHandle for WazzupChannel {
    fn id(&self) -> &str {
        WAZZUP_CHANNEL
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<(), DispatchError> {
        let body = send_request(message)?;
        let url = format!("{}/v3/message", self.base_url);
        send_with_retry(&self.policy, &self.api_key, "wazzup send", |token| {
            self.client.post(&url).bearer_auth(token).json(&body).send()
        })
        .await?;
        Ok(())
    }
}
