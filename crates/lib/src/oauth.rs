//! Kommo OAuth: consent URL, authorization-code exchange and token refresh.
//!
//! Tokens obtained here are persisted to the credential store; `KommoTokens` is the
//! `TokenSource` used by every bearer-authenticated Kommo call.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{self, Config};
use crate::dispatch::{ensure_success, DispatchError, TokenSource};
use crate::store::{CredentialStore, Credentials};

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenResponse {
    /// Store patch: access token, refresh token when issued, and absolute expiry.
    pub fn to_credentials(&self) -> Credentials {
        Credentials {
            access_token: Some(self.access_token.clone()),
            refresh_token: self.refresh_token.clone(),
            expires_at: self
                .expires_in
                .map(|s| chrono::Utc::now().timestamp() + s),
            ..Default::default()
        }
    }
}

/// OAuth client for one Kommo integration.
#[derive(Clone)]
pub struct KommoOAuth {
    base_url: Option<String>,
    oauth_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
    client: reqwest::Client,
}

impl KommoOAuth {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config::resolve_kommo_base_url(config),
            oauth_url: config::resolve_oauth_url(config),
            client_id: config.kommo.client_id.clone(),
            client_secret: config::resolve_kommo_client_secret(config),
            redirect_uri: config.kommo.redirect_uri.clone(),
            client: reqwest::Client::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }

    /// Consent page URL. `state` is echoed back to the callback.
    pub fn authorize_url(&self, state: &str) -> Result<String, DispatchError> {
        let client_id = self
            .client_id
            .as_deref()
            .ok_or(DispatchError::NotConfigured("kommo.clientId"))?;
        let url = url::Url::parse_with_params(
            &self.oauth_url,
            &[
                ("client_id", client_id),
                ("state", state),
                ("mode", "post_message"),
            ],
        )
        .map_err(|e| DispatchError::InvalidResponse(format!("invalid oauth url: {}", e)))?;
        Ok(url.into())
    }

    /// Exchange an authorization code. `referer` is the account host Kommo passes to the
    /// callback; it is used when no base URL is configured.
    pub async fn exchange_code(
        &self,
        code: &str,
        referer: Option<&str>,
    ) -> Result<TokenResponse, DispatchError> {
        let base = match (&self.base_url, referer) {
            (Some(b), _) => b.clone(),
            (None, Some(host)) if !host.trim().is_empty() => {
                format!("https://{}", host.trim().trim_end_matches('/'))
            }
            _ => return Err(DispatchError::NotConfigured("kommo.subdomain")),
        };
        self.token_request(
            &base,
            json!({
                "grant_type": "authorization_code",
                "code": code,
            }),
        )
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, DispatchError> {
        let base = self
            .base_url
            .clone()
            .ok_or(DispatchError::NotConfigured("kommo.subdomain"))?;
        self.token_request(
            &base,
            json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }),
        )
        .await
    }

    async fn token_request(
        &self,
        base: &str,
        mut body: serde_json::Value,
    ) -> Result<TokenResponse, DispatchError> {
        let client_id = self
            .client_id
            .as_deref()
            .ok_or(DispatchError::NotConfigured("kommo.clientId"))?;
        let client_secret = self
            .client_secret
            .as_deref()
            .ok_or(DispatchError::NotConfigured("kommo.clientSecret"))?;
        body["client_id"] = json!(client_id);
        body["client_secret"] = json!(client_secret);
        if let Some(ref uri) = self.redirect_uri {
            body["redirect_uri"] = json!(uri);
        }
        let url = format!("{}/oauth2/access_token", base);
        let res = self.client.post(&url).json(&body).send().await?;
        let res = ensure_success(res).await?;
        let tokens: TokenResponse = res.json().await?;
        Ok(tokens)
    }
}

/// Kommo bearer tokens backed by the credential store, refreshed through OAuth.
pub struct KommoTokens {
    store: Arc<CredentialStore>,
    oauth: KommoOAuth,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl KommoTokens {
    pub fn new(store: Arc<CredentialStore>, oauth: KommoOAuth) -> Self {
        Self {
            store,
            oauth,
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn oauth(&self) -> &KommoOAuth {
        &self.oauth
    }

    /// Exchange an authorization code and persist the result.
    pub async fn exchange_and_store(
        &self,
        code: &str,
        referer: Option<&str>,
    ) -> Result<Credentials, DispatchError> {
        let tokens = self.oauth.exchange_code(code, referer).await?;
        let saved = self
            .store
            .save(&tokens.to_credentials())
            .await
            .map_err(|e| DispatchError::Refresh(e.to_string()))?;
        log::info!("kommo oauth: authorization code exchanged, tokens stored");
        Ok(saved)
    }
}

#[async_trait]
impl TokenSource for KommoTokens {
    async fn access_token(&self) -> Result<String, DispatchError> {
        self.store
            .get()
            .await
            .access_token
            .ok_or(DispatchError::NotConfigured("kommo access token"))
    }

    /// Single flight: when another task already replaced `stale`, its token is reused.
    async fn refresh(&self, stale: &str) -> Result<String, DispatchError> {
        let _gate = self.refresh_gate.lock().await;
        let current = self.store.get().await;
        if let Some(ref token) = current.access_token {
            if token != stale {
                log::debug!("kommo oauth: token already refreshed by another request");
                return Ok(token.clone());
            }
        }
        let refresh_token = current
            .refresh_token
            .ok_or_else(|| DispatchError::Refresh("no refresh token stored".to_string()))?;
        let tokens = self
            .oauth
            .refresh(&refresh_token)
            .await
            .map_err(|e| DispatchError::Refresh(e.to_string()))?;
        self.store
            .save(&tokens.to_credentials())
            .await
            .map_err(|e| DispatchError::Refresh(e.to_string()))?;
        log::info!("kommo oauth: access token refreshed");
        Ok(tokens.access_token)
    }
}

/// OAuth `state` values handed out by the authorize redirect and not yet used.
/// Entries expire after `ttl`; at most `capacity` are kept, oldest evicted first.
pub struct PendingStates {
    ttl: Duration,
    capacity: usize,
    issued: tokio::sync::Mutex<HashMap<String, Instant>>,
}

impl Default for PendingStates {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), 1024)
    }
}

impl PendingStates {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            issued: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Remember a fresh random state and return it.
    pub async fn issue(&self) -> String {
        let state = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        let mut issued = self.issued.lock().await;
        issued.retain(|_, at| now.duration_since(*at) < self.ttl);
        while issued.len() >= self.capacity {
            let oldest = issued
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    issued.remove(&k);
                }
                None => break,
            }
        }
        issued.insert(state.clone(), now);
        state
    }

    /// Consume `state`. False when it was never issued, already used, or expired.
    pub async fn take(&self, state: &str) -> bool {
        match self.issued.lock().await.remove(state) {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.issued.lock().await.len()
    }
}
