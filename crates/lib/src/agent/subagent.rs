//! Background subagents: an isolated turn on a fresh session, reported back through the bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use super::turn::{AgentRuntime, TurnReport};
use crate::bus::{DeliveryTarget, InboundMessage, MessageBus, TriggerKind};

/// Channel name of subagent sessions (`subagent:<id>`).
pub const SUBAGENT_CHANNEL: &str = "subagent";
/// Prefix of the completion report the parent session receives.
pub const REPORT_PREFIX: &str = "[System: subagent]";

/// Where a subagent was spawned from, and where its report goes.
#[derive(Debug, Clone)]
pub struct SpawnOrigin {
    pub channel: String,
    pub chat_id: String,
    /// Delivery defaults of the spawning turn (e.g. a cron job's target).
    pub delivery: Option<DeliveryTarget>,
}

pub struct SubagentSpawner {
    runtime: Arc<AgentRuntime>,
    bus: Arc<MessageBus>,
    running: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl SubagentSpawner {
    pub fn new(runtime: Arc<AgentRuntime>, bus: Arc<MessageBus>) -> Self {
        Self {
            runtime,
            bus,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a subagent and return its id immediately.
    pub fn spawn(&self, task: &str, label: Option<&str>, origin: SpawnOrigin) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let label = label
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .unwrap_or_else(|| default_label(task));
        log::info!("subagent {} ({}) spawned from {}:{}", id, label, origin.channel, origin.chat_id);

        let runtime = self.runtime.clone();
        let bus = self.bus.clone();
        let running = self.running.clone();
        let task = task.to_string();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let inner = tokio::spawn(run_subagent(runtime, task_id.clone(), task.clone()));
            let (status, result) = match inner.await {
                Ok(report) => (status_of(&report), report.reply),
                Err(e) => {
                    log::error!("subagent {} crashed: {}", task_id, e);
                    ("failed", "The subagent crashed before finishing.".to_string())
                }
            };
            let content = format!(
                "{} Subagent '{}' (id {}) {}.\n\nTask: {}\n\nResult:\n{}\n\n\
                 Summarize this naturally for the user in a sentence or two.",
                REPORT_PREFIX, label, task_id, status, task, result
            );
            let report = InboundMessage::new(
                origin.channel,
                origin.chat_id,
                format!("{}:{}", SUBAGENT_CHANNEL, task_id),
                content,
                TriggerKind::Subagent,
            )
            .with_delivery(origin.delivery);
            let delivery = bus.publish_inbound(report).await;
            log::info!("subagent {} {}; report {:?}", task_id, status, delivery);
            if let Ok(mut g) = running.lock() {
                g.remove(&task_id);
            }
        });
        if let Ok(mut g) = self.running.lock() {
            if !handle.is_finished() {
                g.insert(id.clone(), handle);
            }
        }
        id
    }

    pub fn running(&self) -> usize {
        self.running
            .lock()
            .map(|g| g.values().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }
}

async fn run_subagent(runtime: Arc<AgentRuntime>, id: String, task: String) -> TurnReport {
    let seed = InboundMessage::new(SUBAGENT_CHANNEL, &id, "spawner", task, TriggerKind::Subagent);
    let ctx = runtime.tool_context(&seed);
    runtime.run_turn(&seed, &ctx).await
}

fn status_of(report: &TurnReport) -> &'static str {
    if report.is_complete() {
        "completed"
    } else {
        "stopped early"
    }
}

fn default_label(task: &str) -> String {
    let first: String = task.chars().take(30).collect();
    if task.chars().count() > 30 {
        format!("{}...", first.trim_end())
    } else {
        first
    }
}
