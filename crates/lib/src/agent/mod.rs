//! Agent loop: consume inbound messages, run one turn per message, publish one reply.
//!
//! Messages for the same session are queued and processed strictly in arrival order by a
//! single worker; different sessions run concurrently.

mod context;
mod memory;
mod subagent;
mod summary;
mod turn;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bus::{InboundMessage, MessageBus, OutboundMessage, Subscription, TriggerKind};

pub use context::{load_workspace_file, user_content, ContextBuilder};
pub use memory::MemoryStore;
pub use subagent::{SpawnOrigin, SubagentSpawner, REPORT_PREFIX, SUBAGENT_CHANNEL};
pub use summary::{estimate_tokens, Summarizer, SummarySettings, SUMMARY_MARKER};
pub use turn::{
    AbortReason, AgentRuntime, AgentSettings, TurnOutcome, TurnReport, TurnState, DEFAULT_MAX_ITERATIONS,
    EMPTY_REPLY,
};

/// Heartbeat replies containing this token are kept out of the chat.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

pub struct AgentLoop {
    runtime: Arc<AgentRuntime>,
    bus: Arc<MessageBus>,
    /// Pending messages per session. A key is present while its worker runs.
    queues: Mutex<HashMap<String, VecDeque<InboundMessage>>>,
}

impl AgentLoop {
    pub fn new(runtime: Arc<AgentRuntime>, bus: Arc<MessageBus>) -> Self {
        Self {
            runtime,
            bus,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    /// Dispatch inbound messages until the subscription closes or `shutdown` fires, then wait
    /// for in-flight turns to finish.
    pub async fn run(self: Arc<Self>, mut inbound: Subscription<InboundMessage>, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        log::info!("agent loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(msg) => {
                        if let Some(key) = self.enqueue(msg) {
                            workers.spawn(self.clone().drain(key));
                        }
                    }
                    None => break,
                },
                Some(done) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = done {
                        log::error!("agent worker failed: {}", e);
                    }
                }
            }
        }
        inbound.close();
        while let Some(done) = workers.join_next().await {
            if let Err(e) = done {
                log::error!("agent worker failed: {}", e);
            }
        }
        log::info!("agent loop stopped");
    }

    /// Queue `msg`; returns the session key when no worker owns it yet.
    fn enqueue(&self, msg: InboundMessage) -> Option<String> {
        let key = msg.session_key();
        let mut queues = match self.queues.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match queues.get_mut(&key) {
            Some(pending) => {
                log::debug!("agent {}: busy, queued ({} waiting)", key, pending.len() + 1);
                pending.push_back(msg);
                None
            }
            None => {
                queues.insert(key.clone(), VecDeque::from([msg]));
                Some(key)
            }
        }
    }

    fn next_for(&self, key: &str) -> Option<InboundMessage> {
        let mut queues = match self.queues.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = queues.get_mut(key).and_then(VecDeque::pop_front);
        if next.is_none() {
            queues.remove(key);
        }
        next
    }

    async fn drain(self: Arc<Self>, key: String) {
        while let Some(msg) = self.next_for(&key) {
            let this = self.clone();
            let id = msg.id.clone();
            if let Err(e) = tokio::spawn(async move { this.process_message(msg).await }).await {
                log::error!("agent {}: turn for message {} panicked: {}", key, id, e);
            }
        }
    }

    /// Run one turn and publish its reply. Returns the reply, or None when the `message` tool
    /// already delivered to the reply target.
    pub async fn process_message(&self, msg: InboundMessage) -> Option<OutboundMessage> {
        let preview: String = msg.content.chars().take(80).collect();
        log::info!(
            "agent {}: processing {} message from {}: {}",
            msg.session_key(),
            msg.trigger.as_str(),
            msg.sender_id,
            preview
        );
        let ctx = self.runtime.tool_context(&msg);
        let report = self.runtime.run_turn(&msg, &ctx).await;
        let target = msg.reply_target();

        if report.is_complete() && ctx.sent.contains(&target) {
            log::debug!("agent {}: reply already sent with the message tool", msg.session_key());
            return None;
        }

        let out = OutboundMessage::to_target(&target, report.reply.as_str())
            .reply_to(&msg.id)
            .with_deliver(should_deliver(&msg, &report));
        let delivery = self.bus.publish_outbound(out.clone()).await;
        log::debug!("agent {}: reply to {}:{} {:?}", msg.session_key(), target.channel, target.chat_id, delivery);
        Some(out)
    }

    /// One turn outside the bus (CLI). Returns the reply text.
    pub async fn process_direct(&self, content: &str, channel: &str, chat_id: &str) -> String {
        let msg = InboundMessage::user(channel, chat_id, "user", content);
        let ctx = self.runtime.tool_context(&msg);
        self.runtime.run_turn(&msg, &ctx).await.reply
    }
}

/// Scheduled turns without a delivery target, and heartbeat acknowledgements, stay internal.
fn should_deliver(msg: &InboundMessage, report: &TurnReport) -> bool {
    match msg.trigger {
        TriggerKind::Heartbeat if report.reply.contains(HEARTBEAT_OK) => false,
        TriggerKind::Cron | TriggerKind::Heartbeat => msg.delivery.is_some(),
        TriggerKind::User | TriggerKind::Subagent => true,
    }
}
