//! Inbound webhook receivers. Every event is relayed inline and then acknowledged with 200,
//! whatever the relay outcome; only a bad chats-hook signature is rejected.

use crate::config;
use crate::gateway::GatewayState;
use crate::normalize::{self, IgnoreReason, Normalized};
use crate::relay;
use crate::signing;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
};

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

/// POST /kommo-webhook: CRM message or note events, JSON or bracket-notation form.
pub async fn kommo_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let event = match normalize::decode_body(&body, content_type(&headers)) {
        Some(root) => normalize::normalize_kommo(&root),
        None => Normalized::Ignore(IgnoreReason::Unparsable),
    };
    relay::relay(&state.registry, &state.selector, event).await;
    StatusCode::OK
}

/// POST /webhook/chat/:scope_id: Kommo Chats API hook, signed with the channel secret.
pub async fn chats_webhook(
    State(state): State<GatewayState>,
    Path(scope_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(secret) = config::resolve_channel_secret(&state.config) else {
        log::warn!("chats hook for scope {} rejected: no channel secret configured", scope_id);
        return StatusCode::UNAUTHORIZED;
    };
    let signature = headers
        .get("X-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !signing::verify_signature(&secret, &body, signature) {
        log::warn!("chats hook for scope {} rejected: bad signature", scope_id);
        return StatusCode::UNAUTHORIZED;
    }
    if let Some(stored) = state.store.get().await.scope_id {
        if stored != scope_id {
            log::debug!("chats hook scope {} differs from connected scope {}", scope_id, stored);
        }
    }
    let event = match serde_json::from_slice(&body) {
        Ok(root) => normalize::normalize_chats_hook(&root, &state.config.kommo.chats.bot_user_id),
        Err(_) => Normalized::Ignore(IgnoreReason::Unparsable),
    };
    relay::relay(&state.registry, &state.selector, event).await;
    StatusCode::OK
}

/// POST /wazzup-webhook: each entry of `messages` is relayed in order; `{"test": true}` pings are acknowledged.
pub async fn wazzup_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let events = match normalize::decode_body(&body, content_type(&headers)) {
        Some(root) => normalize::normalize_wazzup(&root),
        None => vec![Normalized::Ignore(IgnoreReason::Unparsable)],
    };
    for event in events {
        relay::relay(&state.registry, &state.selector, event).await;
    }
    StatusCode::OK
}
