//! MCP (Model Context Protocol) client for external tool servers over stdio.
//!
//! Messages are newline-delimited JSON-RPC 2.0. A background task reads the server's output
//! and completes pending requests by id; anything that is not a JSON object is server logging
//! and skipped. Each server tool is registered as `<server>_<tool>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{Capability, Tool, ToolContext, ToolError, ToolRegistry};
use crate::config::{McpConfig, McpServerConfig};

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("mcp io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mcp error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("mcp request timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("mcp server closed the connection")]
    Closed,
    #[error("invalid mcp message: {0}")]
    Decode(#[from] serde_json::Error),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, McpError>>>>>;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Deserialize)]
struct RpcMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Deserialize)]
struct ToolList {
    #[serde(default)]
    tools: Vec<McpToolDef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmbeddedResource {
    pub uri: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// One block of a `tools/call` result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpContent {
    Text {
        text: String,
    },
    Image {
        #[serde(rename = "mimeType", default)]
        mime_type: String,
    },
    Resource {
        resource: EmbeddedResource,
    },
    #[serde(other)]
    Unsupported,
}

impl fmt::Display for McpContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpContent::Text { text } => write!(f, "{}", text),
            McpContent::Image { mime_type } => write!(f, "[image: {}]", mime_type),
            McpContent::Resource { resource } => match &resource.text {
                Some(text) => write!(f, "{}\n{}", resource.uri, text),
                None => write!(f, "{}", resource.uri),
            },
            McpContent::Unsupported => write!(f, "[unsupported content]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct McpCallResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl McpCallResult {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connection to one MCP server.
pub struct McpClient {
    server: String,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    timeout: Duration,
    reader: JoinHandle<()>,
    /// Killed when the client is dropped.
    _child: Option<Mutex<Child>>,
}

impl McpClient {
    /// Start the server process and complete the handshake.
    pub async fn connect(config: &McpServerConfig, workdir: &Path) -> Result<Self, McpError> {
        log::info!("mcp {}: starting {} {:?}", config.name, config.command, config.args);
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if workdir.is_dir() {
            cmd.current_dir(workdir);
        }
        let mut child = cmd.spawn().map_err(|source| McpError::Spawn {
            command: config.command.clone(),
            source,
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(McpError::Closed);
        };
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let mut client = Self::from_stream(&config.name, stdout, stdin, timeout);
        client._child = Some(Mutex::new(child));
        client.initialize().await?;
        Ok(client)
    }

    /// Speak the protocol over an existing byte stream.
    pub fn from_stream<R, W>(server: &str, reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            server.to_string(),
            reader,
            pending.clone(),
            closed.clone(),
        ));
        Self {
            server: server.to_string(),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            timeout,
            reader,
            _child: None,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn initialize(&self) -> Result<(), McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "crier", "version": env!("CARGO_PKG_VERSION")},
        });
        let result = self.request("initialize", Some(params)).await?;
        log::info!(
            "mcp {}: initialized (protocol {})",
            self.server,
            result.get("protocolVersion").and_then(Value::as_str).unwrap_or("unknown")
        );
        self.notify("notifications/initialized").await
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        let result = self.request("tools/list", None).await?;
        let list: ToolList = serde_json::from_value(result)?;
        log::debug!("mcp {}: {} tools", self.server, list.tools.len());
        Ok(list.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<McpCallResult, McpError> {
        let params = json!({"name": name, "arguments": arguments});
        let result = self.request("tools/call", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        log::debug!("mcp {}: request {} {}", self.server, id, method);
        let message = RpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        };
        if let Err(e) = self.send(&message).await {
            lock(&self.pending).remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(McpError::Timeout(self.timeout))
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        let message = RpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        };
        self.send(&message).await
    }

    async fn send(&self, message: &RpcRequest<'_>) -> Result<(), McpError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(server: String, reader: R, pending: Pending, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch(&server, &line, &pending),
            Ok(None) => {
                log::warn!("mcp {}: server closed its output", server);
                break;
            }
            Err(e) => {
                log::warn!("mcp {}: read failed: {}", server, e);
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every waiting request.
    lock(&pending).clear();
}

fn dispatch(server: &str, line: &str, pending: &Pending) {
    let line = line.trim();
    if !line.starts_with('{') {
        if !line.is_empty() {
            log::debug!("mcp {}: skipping non-JSON output: {}", server, line);
        }
        return;
    }
    let msg: RpcMessage = match serde_json::from_str(line) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("mcp {}: unreadable message: {}", server, e);
            return;
        }
    };
    if let Some(method) = msg.method {
        log::debug!("mcp {}: ignoring server message {}", server, method);
        return;
    }
    let Some(id) = msg.id.as_ref().and_then(Value::as_u64) else {
        return;
    };
    let Some(tx) = lock(pending).remove(&id) else {
        log::debug!("mcp {}: response for unknown request {}", server, id);
        return;
    };
    let outcome = match msg.error {
        Some(e) => Err(McpError::Rpc {
            code: e.code,
            message: e.message,
        }),
        None => Ok(msg.result.unwrap_or(Value::Null)),
    };
    let _ = tx.send(outcome);
}

/// A server tool exposed to the model.
pub struct McpTool {
    client: Arc<McpClient>,
    remote_name: String,
    name: String,
    description: String,
    parameters: Value,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, def: McpToolDef) -> Self {
        let name: String = format!("{}_{}", client.server(), def.name)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        let summary = def
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(def.name.as_str());
        let description = format!("[{}] {}", client.server(), summary);
        let parameters = if def.input_schema.is_object() {
            def.input_schema
        } else {
            json!({"type": "object", "properties": {}})
        };
        Self {
            client,
            remote_name: def.name,
            name,
            description,
            parameters,
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    fn capability(&self) -> Capability {
        Capability::External
    }

    async fn execute(&self, args: Map<String, Value>, _ctx: &ToolContext) -> Result<String, ToolError> {
        let result = self
            .client
            .call_tool(&self.remote_name, args)
            .await
            .map_err(|e| match e {
                McpError::Timeout(after) => ToolError::Timeout(after),
                other => ToolError::RuntimeFailure(other.to_string()),
            })?;
        let text = result.text();
        if result.is_error {
            return Err(ToolError::RuntimeFailure(text));
        }
        if text.is_empty() {
            return Ok("(no output)".to_string());
        }
        Ok(text)
    }
}

/// Register every tool the server lists. Names already taken are skipped with a warning.
/// Returns the registered names.
pub async fn register_mcp_tools(client: &Arc<McpClient>, registry: &ToolRegistry) -> Result<Vec<String>, McpError> {
    let defs = client.list_tools().await?;
    let mut added = Vec::with_capacity(defs.len());
    for def in defs {
        let tool = McpTool::new(client.clone(), def);
        let name = tool.name.clone();
        match registry.register(Arc::new(tool)).await {
            Ok(()) => added.push(name),
            Err(e) => log::warn!("mcp {}: skipping tool: {}", client.server(), e),
        }
    }
    log::info!("mcp {}: registered {} tools", client.server(), added.len());
    Ok(added)
}

/// Start every configured server and register its tools. Servers that fail are logged and
/// left out.
pub async fn connect_servers(config: &McpConfig, workdir: &Path, registry: &ToolRegistry) -> Vec<Arc<McpClient>> {
    let mut clients = Vec::new();
    for server in config.active_servers() {
        let client = match McpClient::connect(server, workdir).await {
            Ok(c) => Arc::new(c),
            Err(e) => {
                log::error!("mcp {}: connect failed: {}", server.name, e);
                continue;
            }
        };
        match register_mcp_tools(&client, registry).await {
            Ok(_) => clients.push(client),
            Err(e) => log::error!("mcp {}: listing tools failed: {}", server.name, e),
        }
    }
    clients
}
