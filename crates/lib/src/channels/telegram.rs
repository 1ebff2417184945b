//! Telegram channel: long-poll getUpdates into the bus and sendMessage via Bot API.

use crate::bus::{Delivery, InboundMessage, MessageBus};
use crate::channels::registry::ChannelHandle;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
/// Seconds the server holds a getUpdates request open.
const POLL_SECS: u64 = 30;
const RETRY_DELAY: Duration = Duration::from_secs(2);
/// sendMessage text limit, in characters.
pub const TELEGRAM_MAX_MESSAGE: usize = 4096;

/// Every Bot API reply: `{"ok": bool, "result": ..., "description": ...}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// One getUpdates item. Only plain messages are read.
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<UpdateMessage>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMessage {
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<Sender>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct Sender {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

impl TelegramUpdate {
    /// The bus message for this update, if it carries text.
    pub fn to_inbound(&self, channel_id: &str) -> Option<InboundMessage> {
        let msg = self.message.as_ref()?;
        let text = msg.text.as_ref().or(msg.caption.as_ref())?;
        let sender = match &msg.from {
            Some(Sender { id, username: Some(name) }) => format!("{}|{}", id, name),
            Some(user) => user.id.to_string(),
            None => "unknown".to_string(),
        };
        Some(InboundMessage::user(channel_id, msg.chat.id.to_string(), sender, text.as_str()))
    }
}

pub struct TelegramChannel {
    id: String,
    token: Option<String>,
    api_base: String,
    stop: CancellationToken,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: Option<String>) -> Self {
        Self {
            id: "telegram".to_string(),
            token,
            api_base: telegram_api_base(),
            stop: CancellationToken::new(),
            client: reqwest::Client::new(),
        }
    }

    /// POST a Bot API method and unwrap its envelope.
    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T, String> {
        let token = self.token.as_deref().ok_or("telegram bot token not configured")?;
        let url = format!("{}/bot{}/{}", self.api_base, token, method);
        let res = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("{}: {}", method, e))?;
        let status = res.status();
        let envelope: Envelope<T> = res
            .json()
            .await
            .map_err(|e| format!("{}: {} (status {})", method, e, status))?;
        match envelope {
            Envelope { ok: true, result: Some(result), .. } => Ok(result),
            Envelope { description, .. } => Err(format!(
                "{} failed ({}): {}",
                method,
                status,
                description.unwrap_or_else(|| "no description".to_string())
            )),
        }
    }

    /// Updates after `offset`, held open up to the poll window.
    async fn poll(&self, offset: Option<i64>) -> Result<Vec<TelegramUpdate>, String> {
        let mut body = json!({ "timeout": POLL_SECS, "allowed_updates": ["message"] });
        if let Some(off) = offset {
            body["offset"] = json!(off);
        }
        self.call("getUpdates", &body).await
    }

    /// Start the getUpdates loop; runs until `stop` is called.
    pub fn start_inbound(self: Arc<Self>, bus: Arc<MessageBus>) -> JoinHandle<()> {
        log::info!("telegram: polling for updates");
        tokio::spawn(async move { self.poll_loop(bus).await })
    }

    async fn poll_loop(&self, bus: Arc<MessageBus>) {
        let mut offset = None;
        loop {
            let batch = tokio::select! {
                _ = self.stop.cancelled() => break,
                batch = self.poll(offset) => batch,
            };
            let updates = match batch {
                Ok(u) => u,
                Err(e) => {
                    log::debug!("telegram: {}", e);
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    }
                }
            };
            if let Some(last) = updates.iter().map(|u| u.update_id).max() {
                offset = Some(last + 1);
            }
            for inbound in updates.iter().filter_map(|u| u.to_inbound(&self.id)) {
                let chat = inbound.chat_id.clone();
                let outcome = bus.publish_inbound(inbound).await;
                if outcome != Delivery::Queued {
                    log::warn!("telegram: message from chat {} not accepted ({:?})", chat, outcome);
                }
            }
        }
        log::info!("telegram: polling stopped");
    }

    /// Send `text` to a chat, split to fit the message limit.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), String> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE) {
            let _: Value = self
                .call("sendMessage", &json!({ "chat_id": chat_id, "text": chunk }))
                .await?;
        }
        Ok(())
    }
}

/// Split `text` into pieces of at most `limit` characters, preferring line breaks.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.chars().count() > limit {
        let hard = rest.char_indices().nth(limit).map(|(i, _)| i).unwrap_or(rest.len());
        let cut = rest[..hard].rfind('\n').filter(|&i| i > 0).unwrap_or(hard);
        chunks.push(rest[..cut].to_string());
        rest = rest[cut..].strip_prefix('\n').unwrap_or(&rest[cut..]);
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

#[async_trait]
impl ChannelHandle for TelegramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), String> {
        TelegramChannel::send_message(self, chat_id, text).await
    }
}

/// Bot API base URL; `TELEGRAM_API_BASE` points it at a test server.
pub fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string())
}
