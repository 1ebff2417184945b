//! In-process message bus between channel adapters, the scheduler, and the agent loop.
//!
//! Inbound messages flow from channels (and the cron/heartbeat/subagent producers) to the
//! agent; outbound messages flow from the agent and the `message` tool back to channels.

mod events;
mod queue;

pub use events::{DeliveryTarget, InboundMessage, OutboundMessage, TriggerKind};
pub use queue::{
    spawn_dispatcher, BackpressurePolicy, ChannelFilter, Delivery, MessageBus, Routed,
    Subscription,
};
