//! Channel registry: register channels by id and attach them to the bus's outbound side.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::bus::{spawn_dispatcher, ChannelFilter, MessageBus};

/// Handle to a running channel (stop, send message).
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel id (e.g. "telegram").
    fn id(&self) -> &str;
    /// Stop the channel connector.
    fn stop(&self);
    /// Send a text message to a conversation (e.g. Telegram chat_id). Default returns error.
    async fn send_message(&self, _chat_id: &str, _text: &str) -> Result<(), String> {
        Err("send not implemented".to_string())
    }
}

/// Registry of channel ids to handles. Shared across gateway.
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

    pub async fn register(&self, handle: Arc<dyn ChannelHandle>) {
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(handle.id().to_string(), handle) {
            old.stop();
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

    /// Subscribe every registered channel to outbound messages for its id. Messages with
    /// `deliver = false` are dropped here; send failures are logged by the dispatcher.
    pub async fn attach_outbound(&self, bus: &MessageBus) -> Vec<JoinHandle<()>> {
        let g = self.inner.read().await;
        g.iter()
            .map(|(id, handle)| {
                let sub = bus.subscribe_outbound(ChannelFilter::channel(id.clone()));
                let handle = handle.clone();
                spawn_dispatcher(format!("channel {}", id), sub, move |msg| {
                    let handle = handle.clone();
                    async move {
                        if !msg.deliver {
                            log::debug!("channel {}: skipping internal message for {}", handle.id(), msg.chat_id);
                            return Ok(());
                        }
                        handle.send_message(&msg.chat_id, &msg.content).await
                    }
                })
            })
            .collect()
    }

    pub async fn stop_all(&self) {
        let g = self.inner.read().await;
        for handle in g.values() {
            handle.stop();
        }
    }
}
