//! Cron scheduler: durable jobs that inject synthetic inbound messages on a schedule.

mod schedule;
mod service;
mod store;
mod types;

pub use schedule::{describe, format_interval, next_after, parse_at, parse_cron_expr};
pub use service::{Clock, CronService, SystemClock, TokioClock};
pub use store::CronStore;
pub use types::{CronError, CronJob, CronSchedule, JobStatus, NewJob};
