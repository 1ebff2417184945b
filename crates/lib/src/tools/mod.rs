//! Tool layer: the `Tool` trait, registry, argument validation, the safety-enforcing
//! executor, and the built-in tools.
//!
//! Tool-level failures never abort a session: the executor turns them into a `ToolResult`
//! carrying the error text so the model can adapt.

mod cron;
mod executor;
mod filesystem;
mod mcp;
mod message;
mod registry;
mod schema;
mod shell;
mod spawn;
mod web;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus::{DeliveryTarget, TriggerKind};
use crate::llm::ChatMessage;

pub use cron::CronTool;
pub use executor::{truncate_output, ExecutionPolicy, ToolExecutor};
pub use filesystem::{resolve_in_workspace, EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
pub use mcp::{
    connect_servers, register_mcp_tools, McpCallResult, McpClient, McpContent, McpError, McpTool, McpToolDef,
};
pub use message::MessageTool;
pub use registry::{ToolDescriptor, ToolRegistry};
pub use schema::validate_arguments;
pub use shell::{CommandGuard, ExecTool};
pub use spawn::SpawnTool;
pub use web::WebFetchTool;
pub use crate::llm::ToolDefinition;

/// Output budget for tools that do not set their own.
pub const DEFAULT_OUTPUT_LIMIT: usize = 50_000;

/// Broad class of side effect a tool has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Filesystem,
    Shell,
    Network,
    Messaging,
    Delegation,
    Scheduling,
    /// Provided by an external MCP server.
    External,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Filesystem => "filesystem",
            Capability::Shell => "shell",
            Capability::Network => "network",
            Capability::Messaging => "messaging",
            Capability::Delegation => "delegation",
            Capability::Scheduling => "scheduling",
            Capability::External => "external",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("duplicate tool: {0}")]
    DuplicateTool(String),
    #[error("invalid arguments: {0}")]
    ArgumentInvalid(String),
    #[error("blocked by safety policy: {0}")]
    Blocked(String),
    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("tool failed: {0}")]
    RuntimeFailure(String),
}

/// Targets the `message` tool delivered to during one turn.
#[derive(Debug, Clone, Default)]
pub struct SentLog {
    inner: Arc<Mutex<HashSet<DeliveryTarget>>>,
}

impl SentLog {
    pub fn record(&self, target: DeliveryTarget) {
        if let Ok(mut g) = self.inner.lock() {
            g.insert(target);
        }
    }

    pub fn contains(&self, target: &DeliveryTarget) -> bool {
        self.inner.lock().map(|g| g.contains(target)).unwrap_or(false)
    }
}

/// Everything a tool invocation may know about where it runs.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub channel: String,
    pub chat_id: String,
    pub session_key: String,
    pub trigger: TriggerKind,
    /// Delivery defaults from the triggering cron job or subagent report.
    pub delivery: Option<DeliveryTarget>,
    pub workspace: PathBuf,
    /// Per-invocation budget; a tool's own timeout takes precedence.
    pub timeout: Duration,
    pub sent: SentLog,
}

impl ToolContext {
    pub fn new(channel: &str, chat_id: &str, workspace: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            session_key: format!("{}:{}", channel, chat_id),
            trigger: TriggerKind::User,
            delivery: None,
            workspace: workspace.into(),
            timeout,
            sent: SentLog::default(),
        }
    }

    /// Where replies and `message` tool output go when no target is given.
    pub fn default_target(&self) -> DeliveryTarget {
        self.delivery
            .clone()
            .unwrap_or_else(|| DeliveryTarget::new(&self.channel, &self.chat_id))
    }
}

/// A named, schema-described capability invocable by the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema (object) for the arguments.
    fn parameters(&self) -> Value;
    fn capability(&self) -> Capability;

    /// Character budget for the output.
    fn output_limit(&self) -> usize {
        DEFAULT_OUTPUT_LIMIT
    }

    /// Overrides the context's timeout when set.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Run with arguments already validated against `parameters()`.
    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError>;
}

/// Outcome of one tool call, paired to the call by id.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub output: String,
    pub error: Option<ToolError>,
    pub truncated: bool,
}

impl ToolResult {
    pub fn ok(call_id: &str, name: &str, output: String, truncated: bool) -> Self {
        Self {
            call_id: call_id.to_string(),
            name: name.to_string(),
            output,
            error: None,
            truncated,
        }
    }

    pub fn failed(call_id: &str, name: &str, error: ToolError) -> Self {
        Self {
            call_id: call_id.to_string(),
            name: name.to_string(),
            output: String::new(),
            error: Some(error),
            truncated: false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Text the model sees.
    pub fn content(&self) -> String {
        match &self.error {
            Some(e) => format!("Error: {}", e),
            None => self.output.clone(),
        }
    }

    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::tool_result(&self.call_id, &self.name, self.content())
    }
}

/// Required string argument.
pub(crate) fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::ArgumentInvalid(format!("missing string argument '{}'", key)))
}

/// Optional non-empty string argument.
pub(crate) fn opt_str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
