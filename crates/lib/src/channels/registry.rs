//! Channel registry: register and lookup outbound channels by id.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::channels::OutboundMessage;
use crate::dispatch::DispatchError;

/// An upstream platform the relay can reply through.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel id (e.g. "kommo", "wazzup"); matches `InboundMessage::channel_id`.
    fn id(&self) -> &str;

    /// Deliver a reply, authenticating and retrying per the channel's policy.
    async fn send_message(&self, message: &OutboundMessage) -> Result<(), DispatchError>;
}

/// Registry of channel ids to handles. Shared across the gateway.
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn ChannelHandle>>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register under the handle's own id, replacing any previous handle.
    pub async fn register(&self, handle: Arc<dyn ChannelHandle>) {
        let id = handle.id().to_string();
        if self.inner.write().await.insert(id.clone(), handle).is_some() {
            log::debug!("channel {} replaced", id);
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ChannelHandle>> {
        let g = self.inner.read().await;
        g.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let g = self.inner.read().await;
        let mut ids: Vec<String> = g.keys().cloned().collect();
        ids.sort();
        ids
    }
}
