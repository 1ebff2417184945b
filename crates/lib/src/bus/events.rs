//! Bus message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What produced an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// A person on a chat channel.
    User,
    /// A scheduled cron job.
    Cron,
    /// The periodic HEARTBEAT.md check.
    Heartbeat,
    /// Completion report from a subagent.
    Subagent,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::User => "user",
            TriggerKind::Cron => "cron",
            TriggerKind::Heartbeat => "heartbeat",
            TriggerKind::Subagent => "subagent",
        }
    }
}

/// Where a reply should go when it differs from the message's own channel/chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryTarget {
    pub channel: String,
    pub chat_id: String,
}

impl DeliveryTarget {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
        }
    }
}

/// A message into the agent core. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    pub channel: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    /// Opaque attachment references (file paths, URLs).
    #[serde(default)]
    pub media: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub trigger: TriggerKind,
    /// Delivery defaults for replies and the `message` tool (set by cron jobs and subagent reports).
    #[serde(default)]
    pub delivery: Option<DeliveryTarget>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
        trigger: TriggerKind,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            media: Vec::new(),
            timestamp: Utc::now(),
            trigger,
            delivery: None,
        }
    }

    /// A message typed by a user on a chat channel.
    pub fn user(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(channel, chat_id, sender_id, content, TriggerKind::User)
    }

    pub fn with_delivery(mut self, target: Option<DeliveryTarget>) -> Self {
        self.delivery = target;
        self
    }

    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }

    /// Session key: `channel:chat_id`.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }

    /// Target for the reply: the delivery default when present, otherwise the origin.
    pub fn reply_target(&self) -> DeliveryTarget {
        self.delivery
            .clone()
            .unwrap_or_else(|| DeliveryTarget::new(&self.channel, &self.chat_id))
    }
}

/// A message out of the agent core, consumed by the channel adapter for `channel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Inbound message id this answers, if any.
    pub reply_to: Option<String>,
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    /// When false, adapters must not forward the message to the user.
    pub deliver: bool,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            reply_to: None,
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            deliver: true,
        }
    }

    pub fn to_target(target: &DeliveryTarget, content: impl Into<String>) -> Self {
        Self::new(&target.channel, &target.chat_id, content)
    }

    pub fn reply_to(mut self, inbound_id: impl Into<String>) -> Self {
        self.reply_to = Some(inbound_id.into());
        self
    }

    pub fn with_deliver(mut self, deliver: bool) -> Self {
        self.deliver = deliver;
        self
    }

    pub fn target(&self) -> DeliveryTarget {
        DeliveryTarget::new(&self.channel, &self.chat_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_target_prefers_delivery_defaults() {
        let plain = InboundMessage::user("telegram", "42", "u1", "hi");
        assert_eq!(plain.reply_target(), DeliveryTarget::new("telegram", "42"));
        assert_eq!(plain.session_key(), "telegram:42");

        let cron = InboundMessage::new("cron", "job1", "cron", "ping", TriggerKind::Cron)
            .with_delivery(Some(DeliveryTarget::new("telegram", "7")));
        assert_eq!(cron.reply_target(), DeliveryTarget::new("telegram", "7"));
        assert_eq!(cron.session_key(), "cron:job1");
    }

    #[test]
    fn trigger_kind_serializes_lowercase() {
        let v = serde_json::to_value(TriggerKind::Subagent).unwrap();
        assert_eq!(v, serde_json::json!("subagent"));
    }
}
