//! `message` tool: send text to a chat channel mid-turn.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::{opt_str_arg, str_arg, Capability, Tool, ToolContext, ToolError};
use crate::bus::{Delivery, DeliveryTarget, MessageBus, OutboundMessage};

pub struct MessageTool {
    bus: Arc<MessageBus>,
}

impl MessageTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

/// Explicit channel/chat_id win; otherwise the context's delivery defaults, then its origin.
fn resolve_target(args: &Map<String, Value>, ctx: &ToolContext) -> DeliveryTarget {
    let default = ctx.default_target();
    DeliveryTarget::new(
        opt_str_arg(args, "channel").unwrap_or(default.channel.as_str()),
        opt_str_arg(args, "chat_id").unwrap_or(default.chat_id.as_str()),
    )
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user. Defaults to the current conversation; set channel and chat_id to send elsewhere."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "Message text"},
                "channel": {"type": "string", "description": "Target channel (optional)"},
                "chat_id": {"type": "string", "description": "Target chat id (optional)"}
            },
            "required": ["content"]
        })
    }

    fn capability(&self) -> Capability {
        Capability::Messaging
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let content = str_arg(&args, "content")?;
        let target = resolve_target(&args, ctx);
        let msg = OutboundMessage::to_target(&target, content);
        match self.bus.publish_outbound(msg).await {
            Delivery::Queued => {
                ctx.sent.record(target.clone());
                Ok(format!("Message sent to {}:{}", target.channel, target.chat_id))
            }
            Delivery::Unrouted => Ok(format!(
                "No active adapter for channel {}; message not delivered",
                target.channel
            )),
            Delivery::Dropped => Err(ToolError::RuntimeFailure(format!(
                "outbound queue for {} is full; message dropped",
                target.channel
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelFilter;
    use std::time::Duration;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn defaults_to_cron_delivery_target() {
        let bus = Arc::new(MessageBus::default());
        let mut out = bus.subscribe_outbound(ChannelFilter::Any);
        let tool = MessageTool::new(bus.clone());
        let mut ctx = ToolContext::new("cron", "job1", "/tmp", Duration::from_secs(5));
        ctx.delivery = Some(DeliveryTarget::new("telegram", "77"));

        tool.execute(args(json!({"content": "reminder"})), &ctx).await.unwrap();
        let sent = out.try_recv().unwrap();
        assert_eq!((sent.channel.as_str(), sent.chat_id.as_str()), ("telegram", "77"));
        assert!(ctx.sent.contains(&DeliveryTarget::new("telegram", "77")));
    }

    #[tokio::test]
    async fn explicit_target_overrides_defaults() {
        let bus = Arc::new(MessageBus::default());
        let mut out = bus.subscribe_outbound(ChannelFilter::Any);
        let tool = MessageTool::new(bus.clone());
        let ctx = ToolContext::new("telegram", "1", "/tmp", Duration::from_secs(5));

        tool.execute(args(json!({"content": "hi", "chat_id": "2"})), &ctx).await.unwrap();
        let sent = out.try_recv().unwrap();
        assert_eq!((sent.channel.as_str(), sent.chat_id.as_str()), ("telegram", "2"));
        assert!(!ctx.sent.contains(&DeliveryTarget::new("telegram", "1")));
    }

    #[tokio::test]
    async fn unrouted_message_is_not_recorded() {
        let bus = Arc::new(MessageBus::default());
        let tool = MessageTool::new(bus);
        let ctx = ToolContext::new("telegram", "1", "/tmp", Duration::from_secs(5));
        let out = tool.execute(args(json!({"content": "hi"})), &ctx).await.unwrap();
        assert!(out.contains("not delivered"));
        assert!(!ctx.sent.contains(&ctx.default_target()));
    }
}
