//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.chatrelay/config.json`) and environment.
//! Long-lived tokens that change at runtime live in the credential store (`store.rs`);
//! values here only seed it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Kommo CRM settings (OAuth app, dispatch policy, Chats API channel).
    #[serde(default)]
    pub kommo: KommoConfig,

    /// Wazzup messaging gateway settings.
    #[serde(default)]
    pub wazzup: WazzupConfig,

    /// Keyword rules for canned replies.
    #[serde(default)]
    pub replies: RepliesConfig,

    /// Retry policy for outbound calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Credential store file. Relative paths are resolved against the config file's parent.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for webhooks and the admin API (default 3000).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    3000
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// How replies are delivered to a Kommo chat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KommoDispatchMode {
    /// POST the reply to the chats API with the OAuth bearer token.
    #[default]
    Bearer,

    /// Create a chat session first, then post the reply with the session token and CRM linkage.
    Session,
}

/// Kommo account, OAuth app and dispatch settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KommoConfig {
    /// Account subdomain (`<subdomain>.kommo.com`).
    pub subdomain: Option<String>,
    /// Override for the account API base URL. Defaults to `https://<subdomain>.kommo.com`.
    pub base_url: Option<String>,
    /// Override for the chats (amojo) API base URL.
    pub amojo_base_url: Option<String>,
    /// Override for the OAuth consent page.
    pub oauth_url: Option<String>,
    pub client_id: Option<String>,
    /// Overridden by KOMMO_CLIENT_SECRET env.
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    /// Initial access token; seeds the credential store. Overridden by KOMMO_ACCESS_TOKEN env.
    pub access_token: Option<String>,
    /// Initial refresh token; seeds the credential store. Overridden by KOMMO_REFRESH_TOKEN env.
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub dispatch: KommoDispatchMode,
    /// Chats API channel registration.
    #[serde(default)]
    pub chats: KommoChatsConfig,
}

/// Kommo Chats API (custom channel) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KommoChatsConfig {
    /// Channel id issued by Kommo when the channel was registered.
    pub channel_id: Option<String>,
    /// Channel secret used for HMAC signing. Overridden by KOMMO_CHANNEL_SECRET env.
    pub channel_secret: Option<String>,
    /// Account amojo id; seeds the credential store (normally learned via connect).
    pub account_id: Option<String>,
    /// Scope id; seeds the credential store (normally learned via connect).
    pub scope_id: Option<String>,
    /// Sender id used for relay replies; hook messages from this sender are echoes.
    #[serde(default = "default_bot_user_id")]
    pub bot_user_id: String,
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    /// Channel title shown in Kommo when connecting.
    #[serde(default = "default_channel_title")]
    pub title: String,
}

fn default_bot_user_id() -> String {
    "chatrelay-bot".to_string()
}

fn default_bot_name() -> String {
    "Bot".to_string()
}

fn default_channel_title() -> String {
    "chatrelay".to_string()
}

impl Default for KommoChatsConfig {
    fn default() -> Self {
        Self {
            channel_id: None,
            channel_secret: None,
            account_id: None,
            scope_id: None,
            bot_user_id: default_bot_user_id(),
            bot_name: default_bot_name(),
            title: default_channel_title(),
        }
    }
}

/// Wazzup settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WazzupConfig {
    /// API key. Overridden by WAZZUP_API_KEY env.
    pub api_key: Option<String>,
    /// Override for the API base URL.
    pub base_url: Option<String>,
}

/// One keyword group: any keyword found in the lowercased text selects the reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRule {
    pub keywords: Vec<String>,
    pub reply: String,
}

/// Ordered keyword rules plus the fallback reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepliesConfig {
    #[serde(default = "default_reply_rules")]
    pub rules: Vec<ReplyRule>,
    #[serde(default = "default_fallback_reply")]
    pub fallback: String,
}

fn default_reply_rules() -> Vec<ReplyRule> {
    vec![
        ReplyRule {
            keywords: vec!["hola".to_string(), "buenos".to_string()],
            reply: "¡Hola! ¿En qué te puedo ayudar hoy? 😊".to_string(),
        },
        ReplyRule {
            keywords: vec!["cotizar".to_string(), "precio".to_string()],
            reply: "Perfecto, dime qué producto te interesa y te paso precios.".to_string(),
        },
    ]
}

fn default_fallback_reply() -> String {
    "No entendí, ¿puedes repetir?".to_string()
}

impl Default for RepliesConfig {
    fn default() -> Self {
        Self {
            rules: default_reply_rules(),
            fallback: default_fallback_reply(),
        }
    }
}

/// Retry settings for 429 backoff (delay = backoffMs * attempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    2000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

const DEFAULT_AMOJO_BASE_URL: &str = "https://amojo.kommo.com";
const DEFAULT_OAUTH_URL: &str = "https://www.kommo.com/oauth";
const DEFAULT_WAZZUP_BASE_URL: &str = "https://api.wazzup24.com";

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn trimmed(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Kommo account API base URL: explicit baseUrl, else derived from the subdomain.
pub fn resolve_kommo_base_url(config: &Config) -> Option<String> {
    trimmed(config.kommo.base_url.as_ref())
        .or_else(|| {
            trimmed(config.kommo.subdomain.as_ref()).map(|s| format!("https://{}.kommo.com", s))
        })
        .map(|u| u.trim_end_matches('/').to_string())
}

pub fn resolve_amojo_base_url(config: &Config) -> String {
    trimmed(config.kommo.amojo_base_url.as_ref())
        .unwrap_or_else(|| DEFAULT_AMOJO_BASE_URL.to_string())
        .trim_end_matches('/')
        .to_string()
}

pub fn resolve_oauth_url(config: &Config) -> String {
    trimmed(config.kommo.oauth_url.as_ref()).unwrap_or_else(|| DEFAULT_OAUTH_URL.to_string())
}

pub fn resolve_wazzup_base_url(config: &Config) -> String {
    trimmed(config.wazzup.base_url.as_ref())
        .unwrap_or_else(|| DEFAULT_WAZZUP_BASE_URL.to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve the Kommo access token seed: env KOMMO_ACCESS_TOKEN overrides config.
pub fn resolve_kommo_access_token(config: &Config) -> Option<String> {
    env_non_empty("KOMMO_ACCESS_TOKEN").or_else(|| trimmed(config.kommo.access_token.as_ref()))
}

/// Resolve the Kommo refresh token seed: env KOMMO_REFRESH_TOKEN overrides config.
pub fn resolve_kommo_refresh_token(config: &Config) -> Option<String> {
    env_non_empty("KOMMO_REFRESH_TOKEN").or_else(|| trimmed(config.kommo.refresh_token.as_ref()))
}

/// Resolve the OAuth client secret: env KOMMO_CLIENT_SECRET overrides config.
pub fn resolve_kommo_client_secret(config: &Config) -> Option<String> {
    env_non_empty("KOMMO_CLIENT_SECRET").or_else(|| trimmed(config.kommo.client_secret.as_ref()))
}

/// Resolve the Chats API channel secret: env KOMMO_CHANNEL_SECRET overrides config.
pub fn resolve_channel_secret(config: &Config) -> Option<String> {
    env_non_empty("KOMMO_CHANNEL_SECRET")
        .or_else(|| trimmed(config.kommo.chats.channel_secret.as_ref()))
}

/// Resolve the Wazzup API key: env WAZZUP_API_KEY overrides config.
pub fn resolve_wazzup_api_key(config: &Config) -> Option<String> {
    env_non_empty("WAZZUP_API_KEY").or_else(|| trimmed(config.wazzup.api_key.as_ref()))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CHATRELAY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".chatrelay").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Resolve the credential store path: `storePath` if set (relative to the config file's parent), else `tokens.json` next to the config file.
pub fn resolve_store_path(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.store_path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent.join(p)
            }
        }
        _ => config_parent.join("tokens.json"),
    }
}

/// Load config from the given path (or CHATRELAY_CONFIG_PATH / default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Write a default config file if none exists. Returns true when a file was created.
pub fn init_config_file(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&Config::default())?;
    std::fs::write(path, json)
        .with_context(|| format!("writing default config to {}", path.display()))?;
    log::info!("created default config at {}", path.display());
    Ok(true)
}
