//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.crier/config.json`) and environment.
//! Every field has a default, so `{}` is a complete config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::{AgentSettings, SummarySettings};
use crate::bus::{BackpressurePolicy, DeliveryTarget};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Channel settings (e.g. Telegram).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Agent defaults (backend, model, workspace, loop limits).
    #[serde(default)]
    pub agents: AgentsConfig,

    /// LLM provider endpoints.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Tool execution policy.
    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub cron: CronConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the health endpoint (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Per-channel config (e.g. Telegram bot token).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// Start the adapter when a token is available (default true).
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TelegramChannelConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
}

/// Which provider client to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Ollama,
    /// Any OpenAI-compatible chat completions endpoint.
    Openai,
}

/// Agent defaults (backend, model, workspace, loop limits).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(default)]
    pub backend: BackendKind,
    /// Model name as the backend knows it (e.g. "llama3.2:latest", "gpt-4o-mini").
    pub model: Option<String>,
    /// Workspace root (default ~/.crier/workspace). Overridden by CRIER_WORKSPACE env.
    pub workspace: Option<PathBuf>,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    /// Run the tool calls of one model response concurrently.
    #[serde(default)]
    pub parallel_tool_calls: bool,
    /// Prior messages included in each prompt.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub auto_summary: AutoSummaryConfig,
}

fn default_max_tool_iterations() -> u32 {
    crate::agent::DEFAULT_MAX_ITERATIONS
}

fn default_history_limit() -> usize {
    50
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            model: None,
            workspace: None,
            max_tool_iterations: default_max_tool_iterations(),
            parallel_tool_calls: false,
            history_limit: default_history_limit(),
            auto_summary: AutoSummaryConfig::default(),
        }
    }
}

/// Summarize old history once the prompt grows past `thresholdHigh` tokens, keeping the most
/// recent `thresholdLow` tokens verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSummaryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_threshold_low")]
    pub threshold_low: usize,
    #[serde(default = "default_threshold_high")]
    pub threshold_high: usize,
    #[serde(default = "default_summary_target")]
    pub target_length: usize,
    /// Replaces the built-in summary instruction.
    pub prompt: Option<String>,
}

fn default_threshold_low() -> usize {
    3000
}

fn default_threshold_high() -> usize {
    4000
}

fn default_summary_target() -> usize {
    300
}

impl Default for AutoSummaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_low: default_threshold_low(),
            threshold_high: default_threshold_high(),
            target_length: default_summary_target(),
            prompt: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    #[serde(default)]
    pub ollama: OllamaProviderConfig,
    #[serde(default)]
    pub openai: OpenAiProviderConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OllamaProviderConfig {
    /// Default http://127.0.0.1:11434.
    pub base_url: Option<String>,
    /// Passed through as Ollama's `keep_alive` (e.g. "10m").
    #[serde(default)]
    pub keep_alive: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiProviderConfig {
    /// Default https://api.openai.com/v1.
    pub base_url: Option<String>,
    /// Overridden by OPENAI_API_KEY env when set.
    pub api_key: Option<String>,
}

/// Tool execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    /// Default per-invocation timeout.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub exec: ExecToolConfig,
    #[serde(default)]
    pub web: WebToolConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            exec: ExecToolConfig::default(),
            web: WebToolConfig::default(),
            mcp: McpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecToolConfig {
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra denylist regexes, checked in addition to the built-in ones.
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    #[serde(default = "default_exec_max_output")]
    pub max_output_chars: usize,
}

fn default_exec_max_output() -> usize {
    10_000
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            deny_patterns: Vec::new(),
            max_output_chars: default_exec_max_output(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebToolConfig {
    #[serde(default = "default_web_max_chars")]
    pub max_chars: usize,
}

fn default_web_max_chars() -> usize {
    50_000
}

impl Default for WebToolConfig {
    fn default() -> Self {
        Self {
            max_chars: default_web_max_chars(),
        }
    }
}

/// External tool servers speaking MCP over stdio.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    /// Prefix for the server's tool names (`<name>_<tool>`).
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-request timeout.
    #[serde(default = "default_mcp_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_mcp_timeout_secs() -> u64 {
    30
}

impl McpConfig {
    /// Servers to start: none unless MCP is enabled, and never ones without a name or command.
    pub fn active_servers(&self) -> impl Iterator<Item = &McpServerConfig> {
        self.servers
            .iter()
            .filter(move |s| self.enabled && s.enabled)
            .filter(|s| !s.name.trim().is_empty() && !s.command.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackpressureMode {
    #[default]
    DropNewest,
    Wait,
}

/// Bus queue sizing and what happens when a subscriber's queue is full.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub backpressure: BackpressureMode,
    /// Upper bound on a blocked publish in "wait" mode.
    #[serde(default = "default_wait_millis")]
    pub wait_millis: u64,
}

fn default_bus_capacity() -> usize {
    256
}

fn default_wait_millis() -> u64 {
    5_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
            backpressure: BackpressureMode::default(),
            wait_millis: default_wait_millis(),
        }
    }
}

impl BusConfig {
    pub fn policy(&self) -> BackpressurePolicy {
        match self.backpressure {
            BackpressureMode::DropNewest => BackpressurePolicy::DropNewest,
            BackpressureMode::Wait => BackpressurePolicy::Wait(Duration::from_millis(self.wait_millis)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronConfig {
    /// Scheduler tick.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    /// Job store file (default `<configDir>/cron/jobs.json`).
    pub store_path: Option<PathBuf>,
}

fn default_tick_millis() -> u64 {
    1_000
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            tick_millis: default_tick_millis(),
            store_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    /// Where heartbeat results are delivered; both must be set.
    pub channel: Option<String>,
    pub chat_id: Option<String>,
}

fn default_heartbeat_interval() -> u64 {
    30 * 60
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_heartbeat_interval(),
            channel: None,
            chat_id: None,
        }
    }
}

impl HeartbeatConfig {
    pub fn delivery(&self) -> Option<DeliveryTarget> {
        match (&self.channel, &self.chat_id) {
            (Some(c), Some(id)) if !c.trim().is_empty() && !id.trim().is_empty() => {
                Some(DeliveryTarget::new(c.trim(), id.trim()))
            }
            _ => None,
        }
    }
}

fn env_or(var: &str, fallback: Option<&String>) -> Option<String> {
    std::env::var(var)
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| fallback.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    env_or("TELEGRAM_BOT_TOKEN", config.channels.telegram.bot_token.as_ref())
}

/// Resolve the OpenAI API key: env OPENAI_API_KEY overrides config.
pub fn resolve_openai_key(config: &Config) -> Option<String> {
    env_or("OPENAI_API_KEY", config.providers.openai.api_key.as_ref())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CRIER_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".crier").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

fn config_dir(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Workspace root: CRIER_WORKSPACE, then config, then `workspace` next to the config file.
pub fn resolve_workspace_dir(config: &Config, config_path: &Path) -> PathBuf {
    std::env::var("CRIER_WORKSPACE")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .or_else(|| config.agents.defaults.workspace.clone())
        .unwrap_or_else(|| config_dir(config_path).join("workspace"))
}

/// Cron store file; relative overrides resolve against the config directory.
pub fn resolve_cron_store_path(config: &Config, config_path: &Path) -> PathBuf {
    match &config.cron.store_path {
        Some(p) if p.is_absolute() => p.clone(),
        Some(p) if !p.as_os_str().is_empty() => config_dir(config_path).join(p),
        _ => config_dir(config_path).join("cron").join("jobs.json"),
    }
}

/// Agent loop settings from config.
pub fn agent_settings(config: &Config) -> AgentSettings {
    let defaults = &config.agents.defaults;
    let model = defaults
        .model
        .as_ref()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| match defaults.backend {
            BackendKind::Ollama => "llama3.2:latest".to_string(),
            BackendKind::Openai => "gpt-4o-mini".to_string(),
        });
    AgentSettings {
        model,
        max_iterations: defaults.max_tool_iterations.max(1),
        parallel_tool_calls: defaults.parallel_tool_calls,
        history_limit: defaults.history_limit,
        tool_timeout: Duration::from_secs(config.tools.timeout_secs),
    }
}

/// Summary settings when auto-summary is enabled.
pub fn summary_settings(config: &Config) -> Option<SummarySettings> {
    let auto = &config.agents.defaults.auto_summary;
    if !auto.enabled {
        return None;
    }
    let mut settings = SummarySettings {
        retain_tokens: auto.threshold_low,
        trigger_tokens: auto.threshold_high,
        target_tokens: auto.target_length,
        ..SummarySettings::default()
    };
    if let Some(prompt) = auto.prompt.as_ref().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        settings.prompt = prompt.to_string();
    }
    Some(settings)
}

/// Load config from the default path (or CRIER_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
