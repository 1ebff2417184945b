//! Cron service: job lifecycle and the periodic evaluator.
//!
//! A single tick loop scans enabled jobs whose next fire has elapsed, records each fire
//! (one-time jobs are removed, recurring jobs get their next fire computed from the current
//! time, so missed fires are not replayed), then publishes one inbound message per job.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::schedule::{first_fire, next_after, validate};
use super::{CronError, CronJob, CronSchedule, CronStore, JobStatus, NewJob};
use crate::bus::{Delivery, DeliveryTarget, InboundMessage, MessageBus, TriggerKind};

/// How far in the past an `at` time may be when the job is created.
const PAST_DUE_GRACE_SECS: i64 = 60;

/// Source of "now" for scheduling decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time anchored at construction and advanced by tokio's clock, so a paused or
/// auto-advancing test runtime drives the schedule.
pub struct TokioClock {
    wall: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            wall: Utc::now(),
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}

pub struct CronService {
    store: CronStore,
    clock: Arc<dyn Clock>,
    /// Jobs being dispatched right now.
    firing: Mutex<HashSet<String>>,
    tick_lock: tokio::sync::Mutex<()>,
}

impl CronService {
    pub fn new(store: CronStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            firing: Mutex::new(HashSet::new()),
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &CronStore {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validate and persist a new job. Nothing is stored when validation fails.
    pub async fn add_job(&self, new: NewJob) -> Result<CronJob, CronError> {
        let now = self.clock.now();
        if new.message.trim().is_empty() {
            return Err(CronError::InvalidJob("message must not be empty".to_string()));
        }
        let channel = non_blank(new.channel);
        let to = non_blank(new.to);
        if new.deliver && (channel.is_none() || to.is_none()) {
            return Err(CronError::InvalidJob(
                "delivery needs both a channel and a recipient".to_string(),
            ));
        }
        validate(&new.schedule, now, chrono::Duration::seconds(PAST_DUE_GRACE_SECS))?;
        let next_run_at = first_fire(&new.schedule, now)?;
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let name = if new.name.trim().is_empty() {
            new.message.chars().take(30).collect()
        } else {
            new.name
        };
        let job = CronJob {
            id,
            name,
            enabled: true,
            schedule: new.schedule,
            message: new.message,
            deliver: new.deliver,
            channel,
            to,
            next_run_at,
            last_run_at: None,
            last_status: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(job.clone()).await?;
        log::info!("cron: added job {} '{}'", job.id, job.name);
        Ok(job)
    }

    /// Jobs ordered by next fire; disabled jobs only when `include_disabled`.
    pub async fn list_jobs(&self, include_disabled: bool) -> Result<Vec<CronJob>, CronError> {
        let mut jobs: Vec<CronJob> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|j| include_disabled || j.enabled)
            .collect();
        jobs.sort_by_key(|j| (j.next_run_at.is_none(), j.next_run_at));
        Ok(jobs)
    }

    pub async fn remove_job(&self, id: &str) -> Result<CronJob, CronError> {
        let job = self.store.remove(id).await?;
        log::info!("cron: removed job {}", id);
        Ok(job)
    }

    /// Enable or disable a job. Enabling recomputes the next fire from now.
    pub async fn enable_job(&self, id: &str, enabled: bool) -> Result<CronJob, CronError> {
        let now = self.clock.now();
        let current = self.store.get(id).await?;
        let next = if enabled {
            first_fire(&current.schedule, now)?
        } else {
            None
        };
        self.store
            .update(id, |j| {
                j.enabled = enabled;
                j.next_run_at = next;
                j.updated_at = now;
            })
            .await
    }

    /// Bring persisted jobs up to date at scheduler start: recurring jobs whose fire was
    /// missed are rescheduled from now; one-time jobs keep their instant and fire on the next tick.
    pub async fn start(&self) -> Result<(), CronError> {
        let now = self.clock.now();
        for job in self.store.list().await? {
            if !job.enabled {
                continue;
            }
            let stale = match job.schedule {
                CronSchedule::At { .. } => job.next_run_at.is_none(),
                _ => job.next_run_at.map_or(true, |t| t < now),
            };
            if !stale {
                continue;
            }
            match first_fire(&job.schedule, now) {
                Ok(next) => {
                    self.store
                        .update(&job.id, |j| {
                            j.next_run_at = next;
                            j.enabled = next.is_some();
                        })
                        .await?;
                }
                Err(e) => {
                    log::warn!("cron: disabling job {}: {}", job.id, e);
                    self.store
                        .update(&job.id, |j| {
                            j.enabled = false;
                            j.next_run_at = None;
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// One evaluation pass. Returns how many jobs fired.
    pub async fn tick(&self, bus: &MessageBus) -> Result<usize, CronError> {
        let _pass = self.tick_lock.lock().await;
        let now = self.clock.now();
        let due: Vec<CronJob> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|j| j.enabled && j.next_run_at.is_some_and(|t| t <= now))
            .collect();

        let mut fired = 0;
        for job in due {
            if !self.mark_firing(&job.id) {
                log::debug!("cron: job {} already firing, skipping", job.id);
                continue;
            }
            let result = self.fire(&job, bus).await;
            self.clear_firing(&job.id);
            match result {
                Ok(()) => fired += 1,
                Err(CronError::NotFound(_)) => log::debug!("cron: job {} removed while firing", job.id),
                Err(e) => log::warn!("cron: recording fire of job {} failed: {}", job.id, e),
            }
        }
        Ok(fired)
    }

    /// Record the fire first, then publish. A job whose fire cannot be recorded is not
    /// published, so a store failure can delay a job but never repeat a one-time one.
    async fn fire(&self, job: &CronJob, bus: &MessageBus) -> Result<(), CronError> {
        let fired_at = self.clock.now();
        if job.schedule.is_one_time() {
            self.store.remove(&job.id).await?;
        } else {
            let next = next_after(&job.schedule, fired_at);
            self.store
                .update(&job.id, |j| {
                    j.last_run_at = Some(fired_at);
                    j.updated_at = fired_at;
                    match next {
                        Ok(Some(t)) => j.next_run_at = Some(t),
                        Ok(None) | Err(_) => {
                            j.enabled = false;
                            j.next_run_at = None;
                        }
                    }
                })
                .await?;
        }

        let status = match bus.publish_inbound(job_message(job, fired_at)).await {
            Delivery::Queued => JobStatus::Ok,
            Delivery::Dropped => JobStatus::Dropped,
            Delivery::Unrouted => JobStatus::Unrouted,
        };
        if status == JobStatus::Ok {
            log::info!("cron: fired job {} '{}'", job.id, job.name);
        } else {
            log::warn!("cron: job {} fired but inbound message was {:?}", job.id, status);
        }
        if !job.schedule.is_one_time() {
            if let Err(e) = self.store.update(&job.id, |j| j.last_status = Some(status)).await {
                log::debug!("cron: recording status of job {} failed: {}", job.id, e);
            }
        }
        Ok(())
    }

    fn mark_firing(&self, id: &str) -> bool {
        self.firing
            .lock()
            .map(|mut set| set.insert(id.to_string()))
            .unwrap_or(false)
    }

    fn clear_firing(&self, id: &str) {
        if let Ok(mut set) = self.firing.lock() {
            set.remove(id);
        }
    }

    /// Tick loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, bus: Arc<MessageBus>, every: Duration, shutdown: CancellationToken) {
        if let Err(e) = self.start().await {
            log::error!("cron: startup reconciliation failed: {}", e);
        }
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("cron: scheduler running (tick {:?})", every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(&bus).await {
                        log::warn!("cron: tick failed: {}", e);
                    }
                }
            }
        }
        log::info!("cron: scheduler stopped");
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Inbound message for one fire. Each job has its own session (`cron:<id>`).
fn job_message(job: &CronJob, fired_at: DateTime<Utc>) -> InboundMessage {
    let mut msg = InboundMessage::new("cron", &job.id, "cron", &job.message, TriggerKind::Cron);
    msg.timestamp = fired_at;
    if job.deliver {
        if let (Some(channel), Some(to)) = (&job.channel, &job.to) {
            msg.delivery = Some(DeliveryTarget::new(channel, to));
        }
    }
    msg
}
