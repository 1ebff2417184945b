//! Heartbeat: periodically hand `HEARTBEAT.md` to the agent as a synthetic inbound message.
//!
//! Skipped while the file holds nothing actionable (headings, comments, empty checklist items).

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bus::{Delivery, DeliveryTarget, InboundMessage, MessageBus, TriggerKind};

pub const HEARTBEAT_FILE: &str = "HEARTBEAT.md";
pub const HEARTBEAT_CHANNEL: &str = "heartbeat";
pub const HEARTBEAT_CHAT: &str = "main";

const PROMPT: &str = "Read the task list below (from HEARTBEAT.md in your workspace) and act on \
anything that needs attention now. If nothing needs attention, reply with just: HEARTBEAT_OK";

fn comment_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").ok()).as_ref()
}

pub fn strip_html_comments(s: &str) -> String {
    match comment_re() {
        Some(re) => re.replace_all(s, "").into_owned(),
        None => s.to_string(),
    }
}

/// True when no line carries content beyond headings and empty checklist items.
pub fn is_effectively_empty(content: &str) -> bool {
    strip_html_comments(content).lines().all(|line| {
        let line = line.trim();
        line.is_empty()
            || line.starts_with('#')
            || matches!(line, "-" | "*" | "- [ ]" | "* [ ]" | "- [x]" | "* [x]")
    })
}

pub struct HeartbeatService {
    workspace: PathBuf,
    interval: Duration,
    delivery: Option<DeliveryTarget>,
}

impl HeartbeatService {
    pub fn new(workspace: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            workspace: workspace.into(),
            interval,
            delivery: None,
        }
    }

    pub fn with_delivery(mut self, target: Option<DeliveryTarget>) -> Self {
        self.delivery = target;
        self
    }

    fn path(&self) -> PathBuf {
        self.workspace.join(HEARTBEAT_FILE)
    }

    /// Read the file and publish one heartbeat if it has work. Returns whether one was sent.
    pub async fn beat(&self, bus: &MessageBus) -> bool {
        let Some(tasks) = read_tasks(&self.path()).await else {
            log::debug!("heartbeat: nothing to do");
            return false;
        };
        let msg = InboundMessage::new(
            HEARTBEAT_CHANNEL,
            HEARTBEAT_CHAT,
            "heartbeat",
            format!("{}\n\n{}", PROMPT, tasks.trim()),
            TriggerKind::Heartbeat,
        )
        .with_delivery(self.delivery.clone());
        match bus.publish_inbound(msg).await {
            Delivery::Queued => {
                log::info!("heartbeat: tasks sent to agent");
                true
            }
            other => {
                log::warn!("heartbeat: not delivered ({:?})", other);
                false
            }
        }
    }

    /// First beat after one interval, then every interval until `shutdown`.
    pub async fn run(self: Arc<Self>, bus: Arc<MessageBus>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("heartbeat: every {}s", self.interval.as_secs());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.beat(&bus).await;
                }
            }
        }
        log::info!("heartbeat stopped");
    }
}

async fn read_tasks(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) if !is_effectively_empty(&s) => Some(strip_html_comments(&s)),
        Ok(_) => None,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("heartbeat: reading {}: {}", path.display(), e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelFilter;

    #[test]
    fn template_only_files_are_empty() {
        let template = "# Heartbeat Tasks\n\n<!-- Add tasks below.\n- [ ] example -->\n\n## Active\n\n- [ ]\n";
        assert!(is_effectively_empty(template));
        assert!(is_effectively_empty(""));
        assert!(!is_effectively_empty("# Tasks\n- [ ] water the plants"));
    }

    #[test]
    fn comments_are_stripped_across_lines() {
        assert_eq!(strip_html_comments("a<!-- x\ny -->b"), "ab");
    }

    #[tokio::test]
    async fn beat_publishes_only_with_tasks() {
        let ws = std::env::temp_dir().join(format!("crier-hb-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&ws).unwrap();
        let bus = MessageBus::default();
        let mut sub = bus.subscribe_inbound(ChannelFilter::channel(HEARTBEAT_CHANNEL));
        let svc = HeartbeatService::new(&ws, Duration::from_secs(60))
            .with_delivery(Some(DeliveryTarget::new("telegram", "7")));

        assert!(!svc.beat(&bus).await);
        std::fs::write(ws.join(HEARTBEAT_FILE), "- [ ] check the weather").unwrap();
        assert!(svc.beat(&bus).await);

        let msg = sub.try_recv().unwrap();
        assert_eq!(msg.trigger, TriggerKind::Heartbeat);
        assert_eq!(msg.session_key(), "heartbeat:main");
        assert!(msg.content.contains("check the weather"));
        assert_eq!(msg.reply_target(), DeliveryTarget::new("telegram", "7"));
        let _ = std::fs::remove_dir_all(ws);
    }
}
