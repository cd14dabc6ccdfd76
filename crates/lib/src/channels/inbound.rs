//! Inbound message record and the outbound envelope built from it.

use serde::Serialize;

/// CRM entities an inbound Kommo message is attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmLinkage {
    /// Lead (or other entity) id.
    pub entity_id: Option<String>,
    /// Entity type as sent by Kommo (e.g. "lead", "2").
    pub entity_type: Option<String>,
    pub contact_id: Option<String>,
    /// Talk (dialog) id.
    pub dialog_id: Option<String>,
}

impl CrmLinkage {
    pub fn is_empty(&self) -> bool {
        self.entity_id.is_none()
            && self.entity_type.is_none()
            && self.contact_id.is_none()
            && self.dialog_id.is_none()
    }
}

/// A normalized message from a provider, to be answered by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Registry id of the provider that delivered it ("kommo", "kommo-chats", "wazzup").
    pub channel_id: String,
    pub chat_id: String,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "CrmLinkage::is_empty")]
    pub linkage: CrmLinkage,
    /// Provider chat type (e.g. Wazzup "whatsapp").
    pub chat_type: Option<String>,
    /// Provider-side channel id the message arrived on.
    pub source_channel: Option<String>,
}

impl InboundMessage {
    pub fn new(channel_id: &str, chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            chat_id: chat_id.into(),
            sender_id: None,
            sender_name: None,
            text: text.into(),
            linkage: CrmLinkage::default(),
            chat_type: None,
            source_channel: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Picture,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Picture => "picture",
            MessageKind::File => "file",
        }
    }
}

/// Reply envelope handed to a channel's send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub message_id: String,
    pub chat_id: String,
    pub text: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub linkage: CrmLinkage,
    pub chat_type: Option<String>,
    pub source_channel: Option<String>,
}

impl OutboundMessage {
    /// Text reply addressed to the chat the inbound message came from.
    pub fn reply_to(inbound: &InboundMessage, text: impl Into<String>) -> Self {
        Self {
            message_id: generate_message_id(),
            chat_id: inbound.chat_id.clone(),
            text: text.into(),
            kind: MessageKind::Text,
            media_url: None,
            linkage: inbound.linkage.clone(),
            chat_type: inbound.chat_type.clone(),
            source_channel: inbound.source_channel.clone(),
        }
    }

    pub fn with_media(mut self, kind: MessageKind, url: impl Into<String>) -> Self {
        self.kind = kind;
        self.media_url = Some(url.into());
        self
    }
}

/// `<unix millis>-<8 hex chars>`.
pub fn generate_message_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), &suffix[..8])
}
