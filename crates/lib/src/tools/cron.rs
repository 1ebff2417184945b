//! `cron` tool: let the model add, list and remove scheduled jobs.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::{opt_str_arg, str_arg, Capability, Tool, ToolContext, ToolError};
use crate::cron::{describe, parse_at, CronError, CronJob, CronSchedule, CronService, NewJob};

pub struct CronTool {
    service: Arc<CronService>,
}

impl CronTool {
    pub fn new(service: Arc<CronService>) -> Self {
        Self { service }
    }

    async fn add(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let message = str_arg(args, "message")?;
        let schedule = match str_arg(args, "schedule_type")? {
            "at" => CronSchedule::At {
                at: parse_at(str_arg(args, "at")?).map_err(to_tool_error)?,
            },
            "every" => CronSchedule::Every {
                every_seconds: args
                    .get("every_seconds")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| ToolError::ArgumentInvalid("every_seconds is required for schedule_type=every".to_string()))?,
            },
            "cron" => CronSchedule::Cron {
                expr: str_arg(args, "cron_expr")?.to_string(),
            },
            other => {
                return Err(ToolError::ArgumentInvalid(format!("unknown schedule_type {}", other)))
            }
        };
        let mut job = NewJob::new(opt_str_arg(args, "name").unwrap_or_default(), schedule, message);
        if args.get("deliver").and_then(Value::as_bool).unwrap_or(true) {
            let target = ctx.default_target();
            job = job.deliver_to(
                opt_str_arg(args, "channel").unwrap_or(target.channel.as_str()),
                opt_str_arg(args, "to").unwrap_or(target.chat_id.as_str()),
            );
        }
        let created = self.service.add_job(job).await.map_err(to_tool_error)?;
        Ok(summarize_created(&created))
    }

    async fn list(&self) -> Result<String, ToolError> {
        let jobs = self.service.list_jobs(false).await.map_err(to_tool_error)?;
        if jobs.is_empty() {
            return Ok("No scheduled tasks.".to_string());
        }
        let lines: Vec<String> = jobs
            .iter()
            .map(|j| {
                format!(
                    "- {} (ID: {}) {}, next: {}",
                    j.name,
                    j.id,
                    describe(&j.schedule),
                    j.next_run_display()
                )
            })
            .collect();
        Ok(format!("Scheduled tasks:\n{}", lines.join("\n")))
    }

    async fn remove(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let id = str_arg(args, "job_id")?;
        self.service.remove_job(id).await.map_err(to_tool_error)?;
        Ok(format!("Removed scheduled task {}", id))
    }
}

fn to_tool_error(e: CronError) -> ToolError {
    match e {
        CronError::Store(m) => ToolError::RuntimeFailure(m),
        other => ToolError::ArgumentInvalid(other.to_string()),
    }
}

fn summarize_created(job: &CronJob) -> String {
    let mut out = format!(
        "Created scheduled task '{}' (ID: {})\n  Schedule: {}\n  Next run: {}",
        job.name,
        job.id,
        describe(&job.schedule),
        job.next_run_display()
    );
    if let (true, Some(channel), Some(to)) = (job.deliver, &job.channel, &job.to) {
        out.push_str(&format!("\n  Will deliver to: {}:{}", channel, to));
    }
    out
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> &str {
        "Schedule reminders and recurring tasks. action=add needs message and schedule_type \
         (at with an ISO time, every with every_seconds, or cron with cron_expr); \
         action=list shows jobs; action=remove needs job_id."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["add", "list", "remove"]},
                "name": {"type": "string", "description": "Short label for the job"},
                "message": {"type": "string", "description": "Instruction run when the job fires"},
                "schedule_type": {"type": "string", "enum": ["at", "every", "cron"]},
                "at": {"type": "string", "description": "ISO-8601 time for schedule_type=at"},
                "every_seconds": {"type": "integer", "minimum": 1},
                "cron_expr": {"type": "string", "description": "Cron expression, e.g. '0 9 * * 1-5'"},
                "deliver": {"type": "boolean", "description": "Send the result to the user (default true)"},
                "channel": {"type": "string"},
                "to": {"type": "string", "description": "Recipient chat id"},
                "job_id": {"type": "string", "description": "Job to remove"}
            },
            "required": ["action"]
        })
    }

    fn capability(&self) -> Capability {
        Capability::Scheduling
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        match str_arg(&args, "action")? {
            "add" => self.add(&args, ctx).await,
            "list" => self.list().await,
            "remove" => self.remove(&args).await,
            other => Err(ToolError::ArgumentInvalid(format!("unknown action {}", other))),
        }
    }
}
