//! Integration tests: webhooks in, replies out. Upstream APIs are mockito servers; the gateway
//! runs on a free port with its credential store in a temp dir.

use mockito::Matcher;
use relay::config::{Config, KommoDispatchMode};
use relay::gateway;
use relay::signing;
use serde_json::json;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

/// Config pointing every upstream at `upstream`, with fast backoff.
fn config_for(upstream: &str) -> Config {
    let mut config = Config::default();
    config.gateway.bind = "127.0.0.1".to_string();
    config.kommo.base_url = Some(upstream.to_string());
    config.kommo.amojo_base_url = Some(upstream.to_string());
    config.kommo.client_id = Some("client-1".to_string());
    config.kommo.client_secret = Some("client-secret".to_string());
    config.kommo.access_token = Some("a-old".to_string());
    config.kommo.refresh_token = Some("r-old".to_string());
    config.kommo.dispatch = KommoDispatchMode::Bearer;
    config.kommo.chats.channel_secret = Some("chan-secret".to_string());
    config.kommo.chats.scope_id = Some("scope-1".to_string());
    config.wazzup.base_url = Some(upstream.to_string());
    config.wazzup.api_key = Some("wz-key".to_string());
    config.retry.backoff_ms = 10;
    config
}

/// Start the gateway and wait for /health. Returns its base URL and the temp dir holding the store.
async fn start(mut config: Config) -> (String, TempDir) {
    let port = free_port();
    let dir = tempfile::tempdir().expect("temp dir");
    config.gateway.port = port;
    let config_path = dir.path().join("config.json");
    tokio::spawn(async move {
        let _ = gateway::run_gateway(config, config_path).await;
    });

    let base = format!("http://127.0.0.1:{}", port);
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(resp) = client.get(format!("{}/health", base)).send().await {
            if resp.status().is_success() {
                return (base, dir);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("gateway did not come up on {}", base);
}

async fn post_form(url: &str, body: &str) -> reqwest::StatusCode {
    reqwest::Client::new()
        .post(url)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(body.to_string())
        .send()
        .await
        .expect("webhook request")
        .status()
}

#[tokio::test]
async fn kommo_message_without_text_is_acknowledged_without_reply() {
    let mut upstream = mockito::Server::new_async().await;
    let send = upstream
        .mock("POST", "/api/v4/chats/messages")
        .expect(0)
        .create_async()
        .await;
    let (base, _dir) = start(config_for(&upstream.url())).await;

    let status = post_form(
        &format!("{}/kommo-webhook", base),
        "message[add][0][chat_id]=chat-1&message[add][0][type]=incoming",
    )
    .await;

    assert_eq!(status, reqwest::StatusCode::OK);
    send.assert_async().await;
}

#[tokio::test]
async fn kommo_outgoing_message_is_not_answered() {
    let mut upstream = mockito::Server::new_async().await;
    let send = upstream
        .mock("POST", "/api/v4/chats/messages")
        .expect(0)
        .create_async()
        .await;
    let (base, _dir) = start(config_for(&upstream.url())).await;

    let status = post_form(
        &format!("{}/kommo-webhook", base),
        "message[add][0][chat_id]=chat-1&message[add][0][text]=hola&message[add][0][type]=outgoing",
    )
    .await;

    assert_eq!(status, reqwest::StatusCode::OK);
    send.assert_async().await;
}

#[tokio::test]
async fn kommo_greeting_gets_greeting_reply() {
    let mut upstream = mockito::Server::new_async().await;
    let config = config_for(&upstream.url());
    let expected = relay::reply::ReplySelector::new(&config.replies)
        .select("hola")
        .to_string();
    let send = upstream
        .mock("POST", "/api/v4/chats/messages")
        .match_header("authorization", "Bearer a-old")
        .match_body(Matcher::PartialJson(json!({
            "chat_id": "chat-1",
            "text": expected,
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let (base, _dir) = start(config).await;

    let status = post_form(
        &format!("{}/kommo-webhook", base),
        "message[add][0][chat_id]=chat-1&message[add][0][text]=%C2%A1HOLA!&message[add][0][type]=incoming",
    )
    .await;

    assert_eq!(status, reqwest::StatusCode::OK);
    send.assert_async().await;
}

#[tokio::test]
async fn unauthorized_send_refreshes_once_and_retries() {
    let mut upstream = mockito::Server::new_async().await;
    let stale = upstream
        .mock("POST", "/api/v4/chats/messages")
        .match_header("authorization", "Bearer a-old")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let refresh = upstream
        .mock("POST", "/oauth2/access_token")
        .match_body(Matcher::PartialJson(json!({
            "grant_type": "refresh_token",
            "refresh_token": "r-old",
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token_type":"Bearer","expires_in":86400,"access_token":"a-new","refresh_token":"r-new"}"#)
        .expect(1)
        .create_async()
        .await;
    let fresh = upstream
        .mock("POST", "/api/v4/chats/messages")
        .match_header("authorization", "Bearer a-new")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let (base, dir) = start(config_for(&upstream.url())).await;

    let status = post_form(
        &format!("{}/kommo-webhook", base),
        "message[add][0][chat_id]=chat-1&message[add][0][text]=precio&message[add][0][type]=incoming",
    )
    .await;

    assert_eq!(status, reqwest::StatusCode::OK);
    stale.assert_async().await;
    refresh.assert_async().await;
    fresh.assert_async().await;

    let stored: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("tokens.json")).expect("store written"),
    )
    .expect("store is JSON");
    assert_eq!(stored["accessToken"], "a-new");
    assert_eq!(stored["refreshToken"], "r-new");
}

#[tokio::test]
async fn wazzup_rate_limit_gives_up_and_still_acknowledges() {
    let mut upstream = mockito::Server::new_async().await;
    let send = upstream
        .mock("POST", "/v3/message")
        .match_header("authorization", "Bearer wz-key")
        .with_status(429)
        .expect(3)
        .create_async()
        .await;
    let (base, _dir) = start(config_for(&upstream.url())).await;

    let started = Instant::now();
    let res = reqwest::Client::new()
        .post(format!("{}/wazzup-webhook", base))
        .json(&json!({
            "messages": [{
                "messageId": "m-1",
                "channelId": "ch-1",
                "chatType": "whatsapp",
                "chatId": "79990001122",
                "type": "text",
                "status": "inbound",
                "text": "hola"
            }]
        }))
        .send()
        .await
        .expect("webhook request");

    assert_eq!(res.status(), reqwest::StatusCode::OK);
    // 10ms after the first 429, 20ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(30));
    send.assert_async().await;
}

#[tokio::test]
async fn wazzup_test_ping_is_acknowledged() {
    let mut upstream = mockito::Server::new_async().await;
    let send = upstream
        .mock("POST", "/v3/message")
        .expect(0)
        .create_async()
        .await;
    let (base, _dir) = start(config_for(&upstream.url())).await;

    let res = reqwest::Client::new()
        .post(format!("{}/wazzup-webhook", base))
        .json(&json!({ "test": true }))
        .send()
        .await
        .expect("webhook request");

    assert_eq!(res.status(), reqwest::StatusCode::OK);
    send.assert_async().await;
}

fn chats_hook_body(sender_id: &str) -> String {
    json!({
        "account_id": "acct-1",
        "time": 1700000000,
        "message": {
            "receiver": { "id": "client-9", "client_id": "client-9" },
            "sender": { "id": sender_id, "name": "Ana" },
            "conversation": { "id": "conv-amojo", "client_id": "conv-1" },
            "timestamp": 1700000000,
            "msec_timestamp": 1700000000000u64,
            "message": { "id": "msg-1", "type": "text", "text": "hola" }
        }
    })
    .to_string()
}

#[tokio::test]
async fn chats_hook_with_bad_signature_is_rejected() {
    let mut upstream = mockito::Server::new_async().await;
    let send = upstream
        .mock("POST", Matcher::Regex("^/v2/origin/custom/".to_string()))
        .expect(0)
        .create_async()
        .await;
    let (base, _dir) = start(config_for(&upstream.url())).await;

    let res = reqwest::Client::new()
        .post(format!("{}/webhook/chat/scope-1", base))
        .header("content-type", "application/json")
        .header("X-Signature", signing::sign_payload("wrong-secret", b"{}"))
        .body(chats_hook_body("operator-1"))
        .send()
        .await
        .expect("webhook request");

    assert_eq!(res.status(), reqwest::StatusCode::UNAUTHORIZED);
    send.assert_async().await;
}

#[tokio::test]
async fn chats_hook_echo_from_bot_is_not_answered() {
    let mut upstream = mockito::Server::new_async().await;
    let send = upstream
        .mock("POST", Matcher::Regex("^/v2/origin/custom/".to_string()))
        .expect(0)
        .create_async()
        .await;
    let config = config_for(&upstream.url());
    let body = chats_hook_body(&config.kommo.chats.bot_user_id);
    let (base, _dir) = start(config).await;

    let res = reqwest::Client::new()
        .post(format!("{}/webhook/chat/scope-1", base))
        .header("content-type", "application/json")
        .header("X-Signature", signing::sign_payload("chan-secret", body.as_bytes()))
        .body(body)
        .send()
        .await
        .expect("webhook request");

    assert_eq!(res.status(), reqwest::StatusCode::OK);
    send.assert_async().await;
}

#[tokio::test]
async fn chats_hook_from_client_gets_one_signed_reply() {
    let mut upstream = mockito::Server::new_async().await;
    let send = upstream
        .mock("POST", "/v2/origin/custom/scope-1")
        .match_header("x-signature", Matcher::Regex("^[0-9a-f]{40}$".to_string()))
        .match_header("content-md5", Matcher::Regex("^[0-9a-f]{32}$".to_string()))
        .match_body(Matcher::PartialJson(json!({
            "event_type": "new_message",
            "payload": {
                "conversation_id": "conv-1",
                "sender": { "id": "chatrelay-bot" },
                "message": { "type": "text" }
            }
        })))
        .with_status(200)
        .with_body(r#"{"new_message":{"msgid":"m"}}"#)
        .expect(1)
        .create_async()
        .await;
    let body = chats_hook_body("client-9");
    let (base, _dir) = start(config_for(&upstream.url())).await;

    let res = reqwest::Client::new()
        .post(format!("{}/webhook/chat/scope-1", base))
        .header("content-type", "application/json")
        .header("X-Signature", signing::sign_payload("chan-secret", body.as_bytes()))
        .body(body)
        .send()
        .await
        .expect("webhook request");

    assert_eq!(res.status(), reqwest::StatusCode::OK);
    send.assert_async().await;
}

#[tokio::test]
async fn chats_hook_without_channel_secret_is_rejected() {
    let mut upstream = mockito::Server::new_async().await;
    let send = upstream
        .mock("POST", Matcher::Regex("^/v2/origin/custom/".to_string()))
        .expect(0)
        .create_async()
        .await;
    let mut config = config_for(&upstream.url());
    config.kommo.chats.channel_secret = None;
    let body = chats_hook_body("client-9");
    let (base, _dir) = start(config).await;

    let res = reqwest::Client::new()
        .post(format!("{}/webhook/chat/scope-1", base))
        .header("content-type", "application/json")
        .header("X-Signature", signing::sign_payload("chan-secret", body.as_bytes()))
        .body(body)
        .send()
        .await
        .expect("webhook request");

    assert_eq!(res.status(), reqwest::StatusCode::UNAUTHORIZED);
    send.assert_async().await;
}

#[tokio::test]
async fn deeply_nested_form_is_acknowledged() {
    let mut upstream = mockito::Server::new_async().await;
    let send = upstream
        .mock("POST", "/api/v4/chats/messages")
        .expect(0)
        .create_async()
        .await;
    let (base, _dir) = start(config_for(&upstream.url())).await;

    let body = format!("message{}=x", "[]".repeat(100_000));
    let status = post_form(&format!("{}/kommo-webhook", base), &body).await;

    assert_eq!(status, reqwest::StatusCode::OK);
    let health = reqwest::Client::new()
        .get(format!("{}/health", base))
        .send()
        .await
        .expect("gateway still up");
    assert!(health.status().is_success());
    send.assert_async().await;
}

#[tokio::test]
async fn oauth_callback_with_unknown_state_is_rejected() {
    let upstream = mockito::Server::new_async().await;
    let (base, _dir) = start(config_for(&upstream.url())).await;

    let res = reqwest::Client::new()
        .get(format!("{}/oauth/callback?code=abc&state=never-issued", base))
        .send()
        .await
        .expect("callback request");

    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.expect("error JSON");
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn admin_send_message_requires_conversation_id() {
    let upstream = mockito::Server::new_async().await;
    let (base, _dir) = start(config_for(&upstream.url())).await;

    let res = reqwest::Client::new()
        .post(format!("{}/api/chat/send-message", base))
        .json(&json!({ "text": "hola" }))
        .send()
        .await
        .expect("api request");

    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_history_rejects_malformed_limit() {
    let upstream = mockito::Server::new_async().await;
    let (base, _dir) = start(config_for(&upstream.url())).await;

    let res = reqwest::Client::new()
        .get(format!("{}/api/chat/history/conv-1?limit=abc", base))
        .send()
        .await
        .expect("api request");

    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.expect("error JSON");
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap_or_default().contains("limit"));
}

#[tokio::test]
async fn admin_history_keeps_conversation_id_in_one_segment() {
    let mut upstream = mockito::Server::new_async().await;
    let history = upstream
        .mock("GET", "/v2/origin/custom/scope-1/chats/a%2Fb/history")
        .match_query(Matcher::UrlEncoded("limit".into(), "5".into()))
        .match_header("x-signature", Matcher::Regex("^[0-9a-f]{40}$".to_string()))
        .with_status(200)
        .with_body(r#"{"messages":[]}"#)
        .expect(1)
        .create_async()
        .await;
    let (base, _dir) = start(config_for(&upstream.url())).await;

    let res = reqwest::Client::new()
        .get(format!("{}/api/chat/history/a%2Fb?limit=5", base))
        .send()
        .await
        .expect("api request");

    assert_eq!(res.status(), reqwest::StatusCode::OK);
    history.assert_async().await;
}
