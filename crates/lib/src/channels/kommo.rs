//! Kommo CRM channel: reply to a chat either with the OAuth bearer token directly,
//! or through a chat session (session token + CRM linkage, form-encoded).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::channels::registry::ChannelHandle;
use crate::channels::OutboundMessage;
use crate::config::{self, Config, KommoDispatchMode};
use crate::dispatch::{send_with_retry, DispatchError, RetryPolicy, StaticToken, TokenSource};
use crate::normalize::KOMMO_CHANNEL;
use crate::store::CredentialStore;

/// Operator identity the session speaks as.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Persona {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Short-lived chat session token plus persona metadata.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub token: String,
    pub persona: Persona,
}

#[derive(Debug, Deserialize)]
struct SessionEnvelope {
    response: SessionResponse,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    chats: SessionChats,
}

#[derive(Debug, Deserialize)]
struct SessionChats {
    session: SessionData,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    access_token: String,
    #[serde(default)]
    user: Option<Persona>,
}

pub struct KommoChannel {
    mode: KommoDispatchMode,
    base_url: Option<String>,
    amojo_base_url: String,
    tokens: Arc<dyn TokenSource>,
    store: Arc<CredentialStore>,
    policy: RetryPolicy,
    client: reqwest::Client,
}

impl KommoChannel {
    pub fn new(
        config: &Config,
        tokens: Arc<dyn TokenSource>,
        store: Arc<CredentialStore>,
    ) -> Self {
        Self {
            mode: config.kommo.dispatch,
            base_url: config::resolve_kommo_base_url(config),
            amojo_base_url: config::resolve_amojo_base_url(config),
            tokens,
            store,
            policy: RetryPolicy::from(&config.retry),
            client: reqwest::Client::new(),
        }
    }

    fn base_url(&self) -> Result<&str, DispatchError> {
        self.base_url
            .as_deref()
            .ok_or(DispatchError::NotConfigured("kommo.subdomain"))
    }

    /// POST the reply as JSON with the bearer token.
    async fn send_bearer(&self, message: &OutboundMessage) -> Result<(), DispatchError> {
        let url = format!("{}/api/v4/chats/messages", self.base_url()?);
        let mut body = json!({
            "chat_id": message.chat_id,
            "text": message.text,
            "type": message.kind.as_str(),
        });
        if let Some(ref media) = message.media_url {
            body["media"] = json!(media);
        }
        send_with_retry(&self.policy, self.tokens.as_ref(), "kommo send", |token| {
            self.client.post(&url).bearer_auth(token).json(&body).send()
        })
        .await?;
        Ok(())
    }

    /// Step one of session dispatch: trade the bearer token for a chat session.
    pub async fn create_session(&self) -> Result<ChatSession, DispatchError> {
        let url = format!("{}/ajax/v1/chats/session", self.base_url()?);
        let form = [("request[chats][session][action]", "create")];
        let res = send_with_retry(&self.policy, self.tokens.as_ref(), "kommo session", |token| {
            self.client
                .post(&url)
                .bearer_auth(token)
                .header("X-Requested-With", "XMLHttpRequest")
                .form(&form)
                .send()
        })
        .await?;
        let envelope: SessionEnvelope = res
            .json()
            .await
            .map_err(|e| DispatchError::InvalidResponse(format!("chat session: {}", e)))?;
        let data = envelope.response.chats.session;
        Ok(ChatSession {
            token: data.access_token,
            persona: data.user.unwrap_or_default(),
        })
    }

    /// Step two: post the reply with the session token and the CRM linkage fields.
    async fn send_session(&self, message: &OutboundMessage) -> Result<(), DispatchError> {
        let account_id = self
            .store
            .get()
            .await
            .account_id
            .ok_or(DispatchError::NotConfigured("kommo account id (run connect-channel or account-id)"))?;
        let session = self.create_session().await?;
        let url = format!(
            "{}/v1/chats/{}/{}/messages",
            self.amojo_base_url, account_id, message.chat_id
        );
        let form = session_form(message, &session.persona);
        let session_token = StaticToken(session.token);
        send_with_retry(&self.policy, &session_token, "kommo session send", |token| {
            self.client
                .post(&url)
                .header("X-Auth-Token", token)
                .form(&form)
                .send()
        })
        .await?;
        Ok(())
    }
}

fn session_form(message: &OutboundMessage, persona: &Persona) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("text", message.text.clone()),
        ("msgid", message.message_id.clone()),
    ];
    let optional = [
        ("entity_id", &message.linkage.entity_id),
        ("entity_type", &message.linkage.entity_type),
        ("dialog_id", &message.linkage.dialog_id),
        ("contact_id", &message.linkage.contact_id),
        ("persona_name", &persona.name),
        ("persona_avatar", &persona.avatar),
        ("media", &message.media_url),
    ];
    for (key, value) in optional {
        if let Some(v) = value {
            form.push((key, v.clone()));
        }
    }
    form
}

#[async_trait]
impl ChannelHandle for KommoChannel {
    fn id(&self) -> &str {
        KOMMO_CHANNEL
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<(), DispatchError> {
        match self.mode {
            KommoDispatchMode::Bearer => self.send_bearer(message).await,
            KommoDispatchMode::Session => self.send_session(message).await,
        }
    }
}
