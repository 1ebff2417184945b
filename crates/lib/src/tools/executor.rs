//! Tool executor: uniform safety policy around every invocation.
//!
//! Arguments are validated against the tool schema, shell-capable tools are checked against
//! the command denylist, each call runs in its own task under a wall-clock timeout, and
//! output is cut to the tool's character budget with a visible marker.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{
    validate_arguments, Capability, CommandGuard, Tool, ToolContext, ToolError, ToolRegistry,
    ToolResult,
};
use crate::llm::ToolCall;

#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// Used when neither the tool nor the context sets a timeout.
    pub default_timeout: Duration,
    pub guard: Arc<CommandGuard>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            guard: Arc::new(CommandGuard::default()),
        }
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    policy: ExecutionPolicy,
    shutdown: CancellationToken,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, policy: ExecutionPolicy) -> Self {
        Self {
            registry,
            policy,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancel in-flight invocations when `token` fires.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Resolve and run one model-issued call. Never fails: errors become the result.
    pub async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let name = call.function.name.as_str();
        let outcome = match self.registry.resolve(name).await {
            Ok(tool) => self.invoke(tool, &call.id, &call.function.arguments, ctx).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(result) => result,
            Err(e) => {
                log::warn!("tool {} ({}): {}", name, call.id, e);
                ToolResult::failed(&call.id, name, e)
            }
        }
    }

    /// Run `tool` under the execution policy.
    pub async fn invoke(
        &self,
        tool: Arc<dyn Tool>,
        call_id: &str,
        arguments: &Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let name = tool.name().to_string();
        let args = validate_arguments(&tool.parameters(), arguments)?;

        if tool.capability() == Capability::Shell {
            if let Some(command) = args.get("command").and_then(Value::as_str) {
                self.policy.guard.check(command)?;
            }
        }

        let limit = tool
            .timeout()
            .or(Some(ctx.timeout).filter(|d| !d.is_zero()))
            .unwrap_or(self.policy.default_timeout);

        let task_tool = tool.clone();
        let task_ctx = ctx.clone();
        let mut handle = tokio::spawn(async move { task_tool.execute(args, &task_ctx).await });

        let outcome = tokio::select! {
            res = tokio::time::timeout(limit, &mut handle) => match res {
                Ok(Ok(r)) => r,
                Ok(Err(join)) if join.is_panic() => {
                    log::error!("tool {} panicked", name);
                    Err(ToolError::RuntimeFailure("tool panicked".to_string()))
                }
                Ok(Err(_)) => Err(ToolError::RuntimeFailure("tool task was cancelled".to_string())),
                Err(_) => {
                    handle.abort();
                    log::warn!("tool {} timed out after {:?}", name, limit);
                    Err(ToolError::Timeout(limit))
                }
            },
            _ = self.shutdown.cancelled() => {
                handle.abort();
                Err(ToolError::RuntimeFailure("cancelled by shutdown".to_string()))
            }
        };

        let output = outcome?;
        let (output, truncated) = truncate_output(&output, tool.output_limit());
        Ok(ToolResult::ok(call_id, &name, output, truncated))
    }
}

/// Cut `s` to `limit` characters, appending a marker with the number of dropped characters.
pub fn truncate_output(s: &str, limit: usize) -> (String, bool) {
    match s.char_indices().nth(limit) {
        None => (s.to_string(), false),
        Some((idx, _)) => {
            let rest = s[idx..].chars().count();
            (
                format!("{}\n... (truncated, {} more chars)", &s[..idx], rest),
                true,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SleepTool {
        secs: u64,
        timeout: Option<Duration>,
    }

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            "sleep"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn capability(&self) -> Capability {
            Capability::Filesystem
        }
        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }
        async fn execute(&self, _args: Map<String, Value>, _ctx: &ToolContext) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(self.secs)).await;
            Ok("woke".to_string())
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes text"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }
        fn capability(&self) -> Capability {
            Capability::Messaging
        }
        fn output_limit(&self) -> usize {
            10
        }
        async fn execute(&self, args: Map<String, Value>, _ctx: &ToolContext) -> Result<String, ToolError> {
            if args["text"] == "panic" {
                panic!("echo panic");
            }
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    /// Shell-capable tool that only counts how often it actually ran.
    struct CountingShell(Arc<AtomicUsize>);

    #[async_trait]
    impl Tool for CountingShell {
        fn name(&self) -> &str {
            "exec"
        }
        fn description(&self) -> &str {
            "pretend shell"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"command": {"type": "string"}}, "required": ["command"]})
        }
        fn capability(&self) -> Capability {
            Capability::Shell
        }
        async fn execute(&self, _args: Map<String, Value>, _ctx: &ToolContext) -> Result<String, ToolError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok("ran".to_string())
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new("test", "1", std::env::temp_dir(), Duration::from_secs(60))
    }

    async fn executor_with(tools: Vec<Arc<dyn Tool>>, guard: CommandGuard) -> ToolExecutor {
        let registry = Arc::new(ToolRegistry::new());
        for t in tools {
            registry.register(t).await.unwrap();
        }
        ToolExecutor::new(
            registry,
            ExecutionPolicy {
                default_timeout: Duration::from_secs(60),
                guard: Arc::new(guard),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out_at_its_budget() {
        let exec = executor_with(
            vec![Arc::new(SleepTool { secs: 5, timeout: Some(Duration::from_secs(1)) })],
            CommandGuard::default(),
        )
        .await;
        let start = tokio::time::Instant::now();
        let result = exec
            .execute_call(&ToolCall::new("c1", "sleep", json!({})), &ctx())
            .await;
        assert_eq!(result.error, Some(ToolError::Timeout(Duration::from_secs(1))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn context_timeout_applies_without_tool_override() {
        let exec = executor_with(vec![Arc::new(SleepTool { secs: 5, timeout: None })], CommandGuard::default()).await;
        let mut c = ctx();
        c.timeout = Duration::from_secs(2);
        let result = exec.execute_call(&ToolCall::new("c1", "sleep", json!({})), &c).await;
        assert_eq!(result.error, Some(ToolError::Timeout(Duration::from_secs(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_in_flight_call() {
        let token = CancellationToken::new();
        let exec = executor_with(vec![Arc::new(SleepTool { secs: 30, timeout: None })], CommandGuard::default())
            .await
            .with_shutdown(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });
        let result = exec.execute_call(&ToolCall::new("c1", "sleep", json!({})), &ctx()).await;
        assert!(matches!(result.error, Some(ToolError::RuntimeFailure(ref m)) if m.contains("shutdown")));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn output_is_truncated_with_marker() {
        let exec = executor_with(vec![Arc::new(EchoTool)], CommandGuard::default()).await;
        let result = exec
            .execute_call(&ToolCall::new("c1", "echo", json!({"text": "abcdefghijklmnop"})), &ctx())
            .await;
        assert!(result.truncated);
        assert_eq!(result.output, "abcdefghij\n... (truncated, 6 more chars)");
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_arguments_become_results() {
        let exec = executor_with(vec![Arc::new(EchoTool)], CommandGuard::default()).await;
        let unknown = exec.execute_call(&ToolCall::new("c1", "nope", json!({})), &ctx()).await;
        assert_eq!(unknown.error, Some(ToolError::UnknownTool("nope".to_string())));
        let bad = exec.execute_call(&ToolCall::new("c2", "echo", json!({"text": 1})), &ctx()).await;
        assert!(matches!(bad.error, Some(ToolError::ArgumentInvalid(_))));
        assert_eq!(bad.call_id, "c2");
    }

    #[tokio::test]
    async fn panicking_tool_is_a_runtime_failure() {
        let exec = executor_with(vec![Arc::new(EchoTool)], CommandGuard::default()).await;
        let result = exec
            .execute_call(&ToolCall::new("c1", "echo", json!({"text": "panic"})), &ctx())
            .await;
        assert_eq!(result.error, Some(ToolError::RuntimeFailure("tool panicked".to_string())));
    }

    #[test]
    fn truncation_is_char_safe() {
        let (s, t) = truncate_output("héllo wörld", 4);
        assert!(t);
        assert!(s.starts_with("héll\n"));
        assert_eq!(truncate_output("short", 10), ("short".to_string(), false));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn denylisted_commands_never_run(
            token in "[a-z]{4,10}",
            prefix in "[a-z]{0,6}",
            suffix in "[a-z0-9 ]{0,12}",
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let runs = Arc::new(AtomicUsize::new(0));
            let guard = CommandGuard::from_patterns(&[format!(r"\b{}\b", token)]).unwrap();
            let result = rt.block_on(async {
                let exec = executor_with(vec![Arc::new(CountingShell(runs.clone()))], guard).await;
                let command = format!("{} {} {}", prefix, token, suffix);
                exec.execute_call(&ToolCall::new("c1", "exec", json!({"command": command})), &ctx()).await
            });
            prop_assert!(matches!(result.error, Some(ToolError::Blocked(_))));
            prop_assert_eq!(runs.load(Ordering::SeqCst), 0);
        }
    }
}
