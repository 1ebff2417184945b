//! `spawn` tool: hand a task to a background subagent.
//!
//! Holds the spawner weakly: the spawner owns the runtime, whose registry owns this tool.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Weak;

use super::{opt_str_arg, str_arg, Capability, Tool, ToolContext, ToolError};
use crate::agent::{SpawnOrigin, SubagentSpawner, SUBAGENT_CHANNEL};

pub struct SpawnTool {
    spawner: Weak<SubagentSpawner>,
}

impl SpawnTool {
    pub fn new(spawner: Weak<SubagentSpawner>) -> Self {
        Self { spawner }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a subagent to handle a task in the background. Use it for longer tasks that can \
         run independently; the subagent reports back to this conversation when it is done."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "What the subagent should do"},
                "label": {"type": "string", "description": "Short label for the task (optional)"}
            },
            "required": ["task"]
        })
    }

    fn capability(&self) -> Capability {
        Capability::Delegation
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        if ctx.channel == SUBAGENT_CHANNEL {
            return Err(ToolError::Blocked("subagents cannot spawn subagents".to_string()));
        }
        let task = str_arg(&args, "task")?;
        if task.trim().is_empty() {
            return Err(ToolError::ArgumentInvalid("task must not be empty".to_string()));
        }
        let spawner = self
            .spawner
            .upgrade()
            .ok_or_else(|| ToolError::RuntimeFailure("subagent spawner is not running".to_string()))?;
        let origin = SpawnOrigin {
            channel: ctx.channel.clone(),
            chat_id: ctx.chat_id.clone(),
            delivery: ctx.delivery.clone(),
        };
        let id = spawner.spawn(task, opt_str_arg(&args, "label"), origin);
        Ok(format!(
            "Subagent {} started. It will report back here when it finishes.",
            id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn refused_inside_subagent_sessions() {
        let tool = SpawnTool::new(Weak::new());
        let ctx = ToolContext::new(SUBAGENT_CHANNEL, "abc", "/tmp", Duration::from_secs(5));
        let err = tool
            .execute(json!({"task": "more"}).as_object().cloned().unwrap(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Blocked(_)));
    }

    #[tokio::test]
    async fn dropped_spawner_is_runtime_failure() {
        let tool = SpawnTool::new(Weak::new());
        let ctx = ToolContext::new("telegram", "1", "/tmp", Duration::from_secs(5));
        let err = tool
            .execute(json!({"task": "research"}).as_object().cloned().unwrap(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::RuntimeFailure(_)));
    }
}
