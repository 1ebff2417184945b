//! Chat channels (e.g. Telegram).
//!
//! Adapters publish user messages to the bus; the registry wires each adapter to the bus's
//! outbound side so replies for its channel id reach it.

mod registry;
mod telegram;

pub use registry::{ChannelHandle, ChannelRegistry};
pub use telegram::{split_message, TelegramChannel, TelegramUpdate, TELEGRAM_MAX_MESSAGE};
