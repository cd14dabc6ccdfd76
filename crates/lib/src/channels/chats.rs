//! Kommo Chats API client (custom channel over amojo).
//!
//! Channel-level calls are signed with the channel secret (Content-MD5 + HMAC-SHA1
//! `X-Signature`); account-level calls (account id, contact linking) use the OAuth
//! bearer token. The scope id returned by connect is kept in the credential store.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::channels::registry::ChannelHandle;
use crate::channels::{generate_message_id, MessageKind, OutboundMessage};
use crate::config::{self, Config};
use crate::dispatch::{send_with_retry, DispatchError, RetryPolicy, StaticToken, TokenSource};
use crate::normalize::KOMMO_CHATS_CHANNEL;
use crate::signing;
use crate::store::{CredentialStore, Credentials};

/// External chat participant.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// A message to deliver into a Kommo conversation.
#[derive(Debug, Clone)]
pub struct SendChatMessage {
    pub conversation_id: String,
    pub text: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub msgid: Option<String>,
    /// Sender id/name; the configured bot identity when None.
    pub sender: Option<(String, String)>,
}

pub struct KommoChatsClient {
    base_url: Option<String>,
    amojo_base_url: String,
    channel_id: Option<String>,
    secret: Option<String>,
    title: String,
    bot_user_id: String,
    bot_name: String,
    store: Arc<CredentialStore>,
    tokens: Arc<dyn TokenSource>,
    policy: RetryPolicy,
    client: reqwest::Client,
}

impl KommoChatsClient {
    pub fn new(
        config: &Config,
        tokens: Arc<dyn TokenSource>,
        store: Arc<CredentialStore>,
    ) -> Self {
        let chats = &config.kommo.chats;
        Self {
            base_url: config::resolve_kommo_base_url(config),
            amojo_base_url: config::resolve_amojo_base_url(config),
            channel_id: chats.channel_id.clone(),
            secret: config::resolve_channel_secret(config),
            title: chats.title.clone(),
            bot_user_id: chats.bot_user_id.clone(),
            bot_name: chats.bot_name.clone(),
            store,
            tokens,
            policy: RetryPolicy::from(&config.retry),
            client: reqwest::Client::new(),
        }
    }

    fn base_url(&self) -> Result<&str, DispatchError> {
        self.base_url
            .as_deref()
            .ok_or(DispatchError::NotConfigured("kommo.subdomain"))
    }

    /// Stored scope id, encoded for use as a path segment.
    async fn scope_id(&self) -> Result<String, DispatchError> {
        let scope_id = self
            .store
            .get()
            .await
            .scope_id
            .ok_or(DispatchError::NotConfigured("kommo chats scope id (run connect-channel)"))?;
        path_segment(&scope_id)
    }

    /// Signed request against the chats API; `path` may carry a query string.
    async fn signed(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, DispatchError> {
        let secret = self
            .secret
            .as_deref()
            .ok_or(DispatchError::NotConfigured("kommo.chats.channelSecret"))?;
        let bytes = match body {
            Some(b) => serde_json::to_vec(b)
                .map_err(|e| DispatchError::InvalidResponse(e.to_string()))?,
            None => Vec::new(),
        };
        let url = format!("{}{}", self.amojo_base_url, path);
        let label = format!("kommo chats {} {}", method, path);
        let unsigned = StaticToken(String::new());
        let res = send_with_retry(&self.policy, &unsigned, &label, |_| {
            let headers = signing::sign_request(
                secret,
                method.as_str(),
                path,
                &bytes,
                &signing::http_date_now(),
            );
            self.client
                .request(method.clone(), &url)
                .header("Date", headers.date)
                .header("Content-Type", headers.content_type)
                .header("Content-MD5", headers.content_md5)
                .header("X-Signature", headers.signature)
                .body(bytes.clone())
                .send()
        })
        .await?;
        read_json(res).await
    }

    /// Account-level request with the OAuth bearer token.
    async fn bearer(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, DispatchError> {
        let label = format!("kommo {} {}", method, url);
        let res = send_with_retry(&self.policy, self.tokens.as_ref(), &label, |token| {
            let req = self.client.request(method.clone(), url).bearer_auth(token);
            match body {
                Some(b) => req.json(b).send(),
                None => req.send(),
            }
        })
        .await?;
        read_json(res).await
    }

    /// Fetch the account's amojo id and remember it.
    pub async fn account_id(&self) -> Result<String, DispatchError> {
        let url = format!("{}/api/v4/account?with=amojo_id", self.base_url()?);
        let data = self.bearer(reqwest::Method::GET, &url, None).await?;
        let id = data
            .get("amojo_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| DispatchError::InvalidResponse("account has no amojo_id".to_string()))?;
        self.save(Credentials {
            account_id: Some(id.clone()),
            ..Default::default()
        })
        .await?;
        Ok(id)
    }

    /// Connect the channel to the account; stores the returned scope id.
    pub async fn connect_channel(
        &self,
        account_id: Option<String>,
        title: Option<String>,
    ) -> Result<Value, DispatchError> {
        let channel_id = self
            .channel_id
            .clone()
            .ok_or(DispatchError::NotConfigured("kommo.chats.channelId"))?;
        let account_id = match account_id {
            Some(id) => id,
            None => self
                .store
                .get()
                .await
                .account_id
                .ok_or(DispatchError::MissingField("account_id"))?,
        };
        let body = json!({
            "account_id": account_id,
            "title": title.unwrap_or_else(|| self.title.clone()),
            "hook_api_version": "v2",
        });
        let path = format!("/v2/origin/custom/{}/connect", path_segment(&channel_id)?);
        let data = self.signed(reqwest::Method::POST, &path, Some(&body)).await?;
        let scope_id = data
            .get("scope_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| DispatchError::InvalidResponse("connect returned no scope_id".to_string()))?;
        self.save(Credentials {
            account_id: Some(account_id),
            scope_id: Some(scope_id.clone()),
            ..Default::default()
        })
        .await?;
        log::info!("kommo chats: channel connected, scope {}", scope_id);
        Ok(data)
    }

    pub async fn create_chat(&self, conversation_id: &str, user: &ChatUser) -> Result<Value, DispatchError> {
        let mut profile = serde_json::Map::new();
        if let Some(ref phone) = user.phone {
            profile.insert("phone".to_string(), json!(phone));
        }
        if let Some(ref email) = user.email {
            profile.insert("email".to_string(), json!(email));
        }
        let mut user_json = json!({ "id": user.id, "name": user.name });
        if let Some(ref avatar) = user.avatar {
            user_json["avatar"] = json!(avatar);
        }
        if !profile.is_empty() {
            user_json["profile"] = Value::Object(profile);
        }
        let body = json!({ "conversation_id": conversation_id, "user": user_json });
        let path = format!("/v2/origin/custom/{}/chats", self.scope_id().await?);
        self.signed(reqwest::Method::POST, &path, Some(&body)).await
    }

    pub async fn send(&self, message: &SendChatMessage) -> Result<Value, DispatchError> {
        let now = chrono::Utc::now();
        let (sender_id, sender_name) = message
            .sender
            .clone()
            .unwrap_or_else(|| (self.bot_user_id.clone(), self.bot_name.clone()));
        let mut content = json!({ "type": message.kind.as_str(), "text": message.text });
        if let Some(ref media) = message.media_url {
            content["media"] = json!(media);
        }
        let body = json!({
            "event_type": "new_message",
            "payload": {
                "timestamp": now.timestamp(),
                "msec_timestamp": now.timestamp_millis(),
                "msgid": message.msgid.clone().unwrap_or_else(generate_message_id),
                "conversation_id": message.conversation_id,
                "sender": { "id": sender_id, "name": sender_name },
                "message": content,
                "silent": false,
            }
        });
        let path = format!("/v2/origin/custom/{}", self.scope_id().await?);
        self.signed(reqwest::Method::POST, &path, Some(&body)).await
    }

    pub async fn link_contact(&self, chat_id: &str, contact_id: &str) -> Result<Value, DispatchError> {
        let url = format!("{}/api/v4/contacts/chats", self.base_url()?);
        let contact: Value = contact_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| json!(contact_id));
        let body = json!([{ "chat_id": chat_id, "contact_id": contact }]);
        self.bearer(reqwest::Method::POST, &url, Some(&body)).await
    }

    pub async fn history(
        &self,
        conversation_id: &str,
        offset: Option<u32>,
        limit: Option<u32>,
    ) -> Result<Value, DispatchError> {
        let mut path = format!(
            "/v2/origin/custom/{}/chats/{}/history",
            self.scope_id().await?,
            path_segment(conversation_id)?
        );
        let query: Vec<String> = [("offset", offset), ("limit", limit)]
            .iter()
            .filter_map(|(k, v)| v.map(|v| format!("{}={}", k, v)))
            .collect();
        if !query.is_empty() {
            path.push('?');
            path.push_str(&query.join("&"));
        }
        self.signed(reqwest::Method::GET, &path, None).await
    }

    /// Report delivery status for a message the channel received (1 delivered, 2 read, -1 error).
    pub async fn update_status(
        &self,
        msgid: &str,
        status: i32,
        error_code: Option<i64>,
        error: Option<&str>,
    ) -> Result<Value, DispatchError> {
        let mut body = json!({ "msgid": msgid, "delivery_status": status });
        if let Some(code) = error_code {
            body["error_code"] = json!(code);
        }
        if let Some(e) = error {
            body["error"] = json!(e);
        }
        let path = format!(
            "/v2/origin/custom/{}/{}/delivery_status",
            self.scope_id().await?,
            path_segment(msgid)?
        );
        self.signed(reqwest::Method::POST, &path, Some(&body)).await
    }

    async fn save(&self, patch: Credentials) -> Result<(), DispatchError> {
        self.store
            .save(&patch)
            .await
            .map(|_| ())
            .map_err(|e| DispatchError::InvalidResponse(format!("saving credentials: {}", e)))
    }
}

/// Percent-encode one URL path segment. Empty and dot segments are rejected since the URL
/// parser would resolve them against the surrounding path.
fn path_segment(value: &str) -> Result<String, DispatchError> {
    if matches!(value, "" | "." | "..") {
        return Err(DispatchError::InvalidId(value.to_string()));
    }
    let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
    // byte_serialize writes spaces as '+'; a literal '+' is already %2B.
    Ok(encoded.replace('+', "%20"))
}

async fn read_json(res: reqwest::Response) -> Result<Value, DispatchError> {
    let text = res.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| DispatchError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl ChannelHandle for KommoChatsClient {
    fn id(&self) -> &str {
        KOMMO_CHATS_CHANNEL
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<(), DispatchError> {
        self.send(&SendChatMessage {
            conversation_id: message.chat_id.clone(),
            text: message.text.clone(),
            kind: message.kind,
            media_url: message.media_url.clone(),
            msgid: Some(message.message_id.clone()),
            sender: None,
        })
        .await
        .map(|_| ())
    }
}
