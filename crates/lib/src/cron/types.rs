//! Cron job records and errors.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    /// Malformed expression, bad datetime, zero interval, or a past-due `at` at creation.
    #[error("invalid schedule: {0}")]
    ScheduleInvalid(String),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("cron store error: {0}")]
    Store(String),
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CronSchedule {
    /// Once, at an absolute instant.
    At { at: DateTime<Utc> },
    /// Every N seconds.
    Every {
        #[serde(rename = "everySeconds")]
        every_seconds: u64,
    },
    /// Cron expression (5 or 6 fields), evaluated in local time.
    Cron { expr: String },
}

impl CronSchedule {
    pub fn kind(&self) -> &'static str {
        match self {
            CronSchedule::At { .. } => "at",
            CronSchedule::Every { .. } => "every",
            CronSchedule::Cron { .. } => "cron",
        }
    }

    pub fn is_one_time(&self) -> bool {
        matches!(self, CronSchedule::At { .. })
    }
}

/// Outcome of the last fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    /// The agent's inbound queue was full.
    Dropped,
    /// Nothing was subscribed to inbound messages.
    Unrouted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: CronSchedule,
    pub message: String,
    /// Route the agent's reply to `channel`/`to`.
    #[serde(default)]
    pub deliver: bool,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: Option<JobStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub schedule: CronSchedule,
    pub message: String,
    pub deliver: bool,
    pub channel: Option<String>,
    pub to: Option<String>,
}

impl CronJob {
    /// Next fire in local time, or `-` when none is scheduled.
    pub fn next_run_display(&self) -> String {
        self.next_run_at
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

impl NewJob {
    pub fn new(name: impl Into<String>, schedule: CronSchedule, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schedule,
            message: message.into(),
            deliver: false,
            channel: None,
            to: None,
        }
    }

    pub fn deliver_to(mut self, channel: impl Into<String>, to: impl Into<String>) -> Self {
        self.deliver = true;
        self.channel = Some(channel.into());
        self.to = Some(to.into());
        self
    }
}
