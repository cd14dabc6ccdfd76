//! Integration test: start the gateway on a free port, GET /health, assert health JSON.
//! No upstream credentials needed. The server task is left running when the test ends.

use relay::config::Config;
use relay::gateway;
use std::time::Duration;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

#[tokio::test]
async fn gateway_health_reports_credential_presence() {
    let port = free_port();
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let config_path = temp_dir.path().join("config.json");

    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();
    config.wazzup.api_key = Some("wz-key".to_string());

    let gateway_handle = tokio::spawn(async move {
        let _ = gateway::run_gateway(config, config_path).await;
    });

    let url = format!("http://127.0.0.1:{}/health", port);
    let client = reqwest::Client::new();
    let mut last_err = None;
    for _ in 0..100 {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let json: serde_json::Value = resp.json().await.expect("parse JSON");
                assert_eq!(json.get("status").and_then(|v| v.as_str()), Some("ok"));
                let creds = json.get("credentials").expect("credentials object");
                assert_eq!(creds.get("wazzupApiKey").and_then(|v| v.as_bool()), Some(true));
                assert!(creds.get("kommoAccessToken").and_then(|v| v.as_bool()).is_some());
                // Values are never echoed back.
                assert!(!json.to_string().contains("wz-key"));
                return;
            }
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    gateway_handle.abort();
    panic!(
        "GET {} did not return 200 with health JSON within 5s; last error: {:?}",
        url, last_err
    );
}
