//! Operator endpoints: OAuth consent flow and the Kommo Chats admin API.
//!
//! Admin responses are `{"success": true, "data": ...}` or `{"success": false, "error": ...}`.

use crate::channels::{ChatUser, MessageKind, SendChatMessage};
use crate::dispatch::DispatchError;
use crate::gateway::GatewayState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Upstream(#[from] DispatchError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_)
            | ApiError::Upstream(DispatchError::MissingField(_))
            | ApiError::Upstream(DispatchError::InvalidId(_)) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::warn!("api request failed: {}", self);
        }
        (status, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn ok(data: Value) -> ApiResult {
    Ok(Json(json!({ "success": true, "data": data })))
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid request body: {}", e)))
}

fn required(value: &str, name: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{} is required", name)));
    }
    Ok(())
}

/// GET /oauth/authorize: remember a fresh state and redirect to the Kommo consent page.
pub async fn oauth_authorize(State(state): State<GatewayState>) -> Result<Response, ApiError> {
    let oauth = state.kommo_tokens.oauth();
    if !oauth.is_configured() {
        return Err(DispatchError::NotConfigured("kommo.clientId / kommo.clientSecret").into());
    }
    let nonce = state.oauth_states.issue().await;
    let url = oauth.authorize_url(&nonce)?;
    Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    /// Account host, sent by Kommo alongside the code.
    referer: Option<String>,
}

/// GET /oauth/callback: exchange the code for tokens and persist them.
pub async fn oauth_callback(
    State(state): State<GatewayState>,
    Query(query): Query<CallbackQuery>,
) -> ApiResult {
    let code = query.code.unwrap_or_default();
    required(&code, "code")?;
    let nonce = query.state.unwrap_or_default();
    if !state.oauth_states.take(&nonce).await {
        log::warn!("oauth callback with unknown state");
        return Err(ApiError::BadRequest("unknown or expired state".to_string()));
    }
    let saved = state
        .kommo_tokens
        .exchange_and_store(&code, query.referer.as_deref())
        .await?;
    ok(json!({ "expiresAt": saved.expires_at }))
}

/// GET /api/chat/account-id
pub async fn account_id(State(state): State<GatewayState>) -> ApiResult {
    let id = state.chats.account_id().await?;
    ok(json!({ "accountId": id }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest {
    account_id: Option<String>,
    title: Option<String>,
}

/// POST /api/chat/connect-channel
pub async fn connect_channel(State(state): State<GatewayState>, body: Bytes) -> ApiResult {
    let req: ConnectRequest = if body.is_empty() {
        ConnectRequest::default()
    } else {
        parse_body(&body)?
    };
    ok(state.chats.connect_channel(req.account_id, req.title).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChatRequest {
    conversation_id: String,
    user: ChatUser,
}

/// POST /api/chat/create
pub async fn create_chat(State(state): State<GatewayState>, body: Bytes) -> ApiResult {
    let req: CreateChatRequest = parse_body(&body)?;
    required(&req.conversation_id, "conversationId")?;
    required(&req.user.id, "user.id")?;
    ok(state.chats.create_chat(&req.conversation_id, &req.user).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    conversation_id: String,
    #[serde(default)]
    text: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    media: Option<String>,
    msgid: Option<String>,
    sender_id: Option<String>,
    sender_name: Option<String>,
}

fn parse_kind(kind: Option<&str>) -> Result<MessageKind, ApiError> {
    match kind.unwrap_or("text") {
        "text" => Ok(MessageKind::Text),
        "picture" => Ok(MessageKind::Picture),
        "file" => Ok(MessageKind::File),
        other => Err(ApiError::BadRequest(format!("unsupported message type {}", other))),
    }
}

/// POST /api/chat/send-message
pub async fn send_message(State(state): State<GatewayState>, body: Bytes) -> ApiResult {
    let req: SendMessageRequest = parse_body(&body)?;
    required(&req.conversation_id, "conversationId")?;
    let kind = parse_kind(req.kind.as_deref())?;
    if kind == MessageKind::Text {
        required(&req.text, "text")?;
    } else if req.media.is_none() {
        return Err(ApiError::BadRequest("media is required for media messages".to_string()));
    }
    let sender = match req.sender_id {
        Some(id) => Some((id.clone(), req.sender_name.unwrap_or(id))),
        None => None,
    };
    let message = SendChatMessage {
        conversation_id: req.conversation_id,
        text: req.text,
        kind,
        media_url: req.media,
        msgid: req.msgid,
        sender,
    };
    ok(state.chats.send(&message).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkContactRequest {
    chat_id: String,
    contact_id: Value,
}

/// POST /api/chat/link-contact
pub async fn link_contact(State(state): State<GatewayState>, body: Bytes) -> ApiResult {
    let req: LinkContactRequest = parse_body(&body)?;
    required(&req.chat_id, "chatId")?;
    let contact_id = match req.contact_id {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => return Err(ApiError::BadRequest("contactId is required".to_string())),
    };
    required(&contact_id, "contactId")?;
    ok(state.chats.link_contact(&req.chat_id, &contact_id).await?)
}

/// Raw strings so malformed numbers surface as `ApiError` rather than a `Query` rejection.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    offset: Option<String>,
    limit: Option<String>,
}

fn parse_count(value: Option<&str>, name: &str) -> Result<Option<u32>, ApiError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("{} must be a non-negative integer", name))),
    }
}

/// GET /api/chat/history/:conversation_id
pub async fn history(
    State(state): State<GatewayState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    let offset = parse_count(query.offset.as_deref(), "offset")?;
    let limit = parse_count(query.limit.as_deref(), "limit")?;
    ok(state.chats.history(&conversation_id, offset, limit).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStatusRequest {
    msgid: String,
    status: i32,
    error_code: Option<i64>,
    error: Option<String>,
}

/// POST /api/chat/update-status
pub async fn update_status(State(state): State<GatewayState>, body: Bytes) -> ApiResult {
    let req: UpdateStatusRequest = parse_body(&body)?;
    required(&req.msgid, "msgid")?;
    ok(state
        .chats
        .update_status(&req.msgid, req.status, req.error_code, req.error.as_deref())
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_maps_to_bad_request() {
        let res = ApiError::Upstream(DispatchError::MissingField("account_id")).into_response();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let res = ApiError::Upstream(DispatchError::Unauthorized).into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn parse_kind_accepts_known_types() {
        assert_eq!(parse_kind(None).unwrap(), MessageKind::Text);
        assert_eq!(parse_kind(Some("picture")).unwrap(), MessageKind::Picture);
        assert!(parse_kind(Some("sticker")).is_err());
    }

    #[test]
    fn history_counts_are_validated() {
        assert_eq!(parse_count(None, "limit").unwrap(), None);
        assert_eq!(parse_count(Some(" 20 "), "limit").unwrap(), Some(20));
        assert!(matches!(
            parse_count(Some("abc"), "limit"),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            parse_count(Some("-1"), "offset"),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn body_without_required_field_is_rejected() {
        let body = Bytes::from_static(br#"{"text":"hola"}"#);
        assert!(matches!(
            parse_body::<SendMessageRequest>(&body),
            Err(ApiError::BadRequest(_))
        ));
    }
}
