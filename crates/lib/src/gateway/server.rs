//! Gateway HTTP server: webhook receivers, OAuth flow and the chats admin API on one port.

use crate::channels::{ChannelRegistry, KommoChannel, KommoChatsClient, WazzupChannel};
use crate::config::{self, Config};
use crate::dispatch::TokenSource;
use crate::gateway::{api, webhooks};
use crate::oauth::{KommoOAuth, KommoTokens, PendingStates};
use crate::reply::ReplySelector;
use crate::store::{CredentialStore, Credentials};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared state for the gateway (config, credentials, channels, reply rules).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub store: Arc<CredentialStore>,
    /// Kommo bearer tokens (store-backed, refreshed through OAuth).
    pub kommo_tokens: Arc<KommoTokens>,
    pub registry: Arc<ChannelRegistry>,
    pub selector: Arc<ReplySelector>,
    pub chats: Arc<KommoChatsClient>,
    /// OAuth `state` values handed out by /oauth/authorize and not yet consumed.
    pub oauth_states: Arc<PendingStates>,
}

impl GatewayState {
    /// Load the credential store, seed it from config/env, and register every channel that
    /// has what it needs to send.
    pub async fn build(config: Config, config_path: &Path) -> Result<Self> {
        let store_path = config::resolve_store_path(&config, config_path);
        let store = Arc::new(
            CredentialStore::load(&store_path)
                .await
                .with_context(|| format!("loading credential store {}", store_path.display()))?,
        );
        store
            .seed(&seed_credentials(&config))
            .await
            .with_context(|| format!("seeding credential store {}", store_path.display()))?;

        let kommo_tokens = Arc::new(KommoTokens::new(
            store.clone(),
            KommoOAuth::from_config(&config),
        ));
        let tokens: Arc<dyn TokenSource> = kommo_tokens.clone();
        let registry = Arc::new(ChannelRegistry::new());

        if config::resolve_kommo_base_url(&config).is_some() {
            registry
                .register(Arc::new(KommoChannel::new(&config, tokens.clone(), store.clone())))
                .await;
            log::info!("kommo channel registered ({:?} dispatch)", config.kommo.dispatch);
        } else {
            log::info!("kommo channel disabled: no kommo.subdomain or kommo.baseUrl");
        }

        if let Some(key) = config::resolve_wazzup_api_key(&config) {
            registry
                .register(Arc::new(WazzupChannel::new(&config, key)))
                .await;
            log::info!("wazzup channel registered");
        } else {
            log::info!("wazzup channel disabled: no wazzup.apiKey or WAZZUP_API_KEY");
        }

        let chats = Arc::new(KommoChatsClient::new(&config, tokens, store.clone()));
        if config::resolve_channel_secret(&config).is_some() {
            registry.register(chats.clone()).await;
            log::info!("kommo chats channel registered");
        }

        Ok(Self {
            selector: Arc::new(ReplySelector::new(&config.replies)),
            config: Arc::new(config),
            store,
            kommo_tokens,
            registry,
            chats,
            oauth_states: Arc::new(PendingStates::default()),
        })
    }
}

/// Config/env credentials used to fill keys the store does not have yet.
fn seed_credentials(config: &Config) -> Credentials {
    Credentials {
        access_token: config::resolve_kommo_access_token(config),
        refresh_token: config::resolve_kommo_refresh_token(config),
        expires_at: None,
        account_id: config.kommo.chats.account_id.clone(),
        scope_id: config.kommo.chats.scope_id.clone(),
    }
}

/// All routes, bound to `state`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/health", get(health_http))
        .route("/kommo-webhook", post(webhooks::kommo_webhook))
        .route("/webhook/chat/:scope_id", post(webhooks::chats_webhook))
        .route("/wazzup-webhook", post(webhooks::wazzup_webhook))
        .route("/oauth/authorize", get(api::oauth_authorize))
        .route("/oauth/callback", get(api::oauth_callback))
        .route("/api/chat/account-id", get(api::account_id))
        .route("/api/chat/connect-channel", post(api::connect_channel))
        .route("/api/chat/create", post(api::create_chat))
        .route("/api/chat/send-message", post(api::send_message))
        .route("/api/chat/link-contact", post(api::link_contact))
        .route("/api/chat/history/:conversation_id", get(api::history))
        .route("/api/chat/update-status", post(api::update_status))
        .with_state(state)
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// Blocks until shutdown (e.g. Ctrl+C).
/// `config_path` locates the default credential store (`tokens.json` next to it).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let state = GatewayState::build(config, &config_path).await?;
    log::info!(
        "credential store: {}; channels: {}",
        state.store.path().display(),
        state.registry.ids().await.join(", ")
    );
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}

/// GET /health (and GET /): liveness plus which credentials are present. Never the values.
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let config = &state.config;
    let creds = state.store.get().await;
    Json(json!({
        "status": "ok",
        "credentials": {
            "kommoAccessToken": creds.access_token.is_some(),
            "kommoRefreshToken": creds.refresh_token.is_some(),
            "kommoClientSecret": config::resolve_kommo_client_secret(config).is_some(),
            "kommoChannelSecret": config::resolve_channel_secret(config).is_some(),
            "kommoScopeId": creds.scope_id.is_some(),
            "wazzupApiKey": config::resolve_wazzup_api_key(config).is_some(),
        },
        "channels": state.registry.ids().await,
    }))
}
