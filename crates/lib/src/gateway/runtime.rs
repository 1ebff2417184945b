//! Runtime assembly: build every component from config and start the background tasks.
//!
//! All shared state lives here and is handed to components explicitly; nothing is global.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentLoop, AgentRuntime, ContextBuilder, SubagentSpawner, Summarizer};
use crate::bus::{ChannelFilter, MessageBus};
use crate::channels::{ChannelHandle, ChannelRegistry, TelegramChannel};
use crate::config::{self, BackendKind, Config};
use crate::cron::{CronService, CronStore, SystemClock};
use crate::heartbeat::HeartbeatService;
use crate::llm::{LlmBackend, OllamaClient, OpenAiClient};
use crate::session::SessionStore;
use crate::tools::{
    connect_servers, CommandGuard, CronTool, EditFileTool, ExecTool, ExecutionPolicy, ListDirTool, McpClient,
    MessageTool, ReadFileTool, SpawnTool, ToolExecutor, ToolRegistry, WebFetchTool, WriteFileTool,
};

/// Build the configured LLM backend.
pub fn build_backend(config: &Config) -> Arc<dyn LlmBackend> {
    match config.agents.defaults.backend {
        BackendKind::Ollama => {
            let ollama = &config.providers.ollama;
            let client = OllamaClient::new(ollama.base_url.clone());
            match &ollama.keep_alive {
                Some(k) => Arc::new(client.with_keep_alive(k)),
                None => Arc::new(client),
            }
        }
        BackendKind::Openai => Arc::new(OpenAiClient::new(
            config.providers.openai.base_url.clone(),
            config::resolve_openai_key(config),
        )),
    }
}

/// Every long-lived component, wired together.
pub struct Runtime {
    pub config: Config,
    pub workspace: PathBuf,
    pub bus: Arc<MessageBus>,
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<ToolRegistry>,
    pub agent: Arc<AgentLoop>,
    pub spawner: Arc<SubagentSpawner>,
    pub cron: Arc<CronService>,
    pub channels: Arc<ChannelRegistry>,
    /// Connected MCP servers; dropping a client stops its server.
    pub mcp: Vec<Arc<McpClient>>,
    pub shutdown: CancellationToken,
}

impl Runtime {
    /// Assemble with the backend named in config.
    pub async fn assemble(config: Config, config_path: &Path) -> Result<Self> {
        let backend = build_backend(&config);
        Self::assemble_with_backend(config, config_path, backend).await
    }

    pub async fn assemble_with_backend(
        config: Config,
        config_path: &Path,
        backend: Arc<dyn LlmBackend>,
    ) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let workspace = config::resolve_workspace_dir(&config, config_path);
        let bus = Arc::new(MessageBus::new(config.bus.capacity, config.bus.policy()));
        let sessions = Arc::new(SessionStore::with_persistence(workspace.join("sessions")));

        let store_path = config::resolve_cron_store_path(&config, config_path);
        let cron = Arc::new(CronService::new(CronStore::open(&store_path), Arc::new(SystemClock)));

        let guard = CommandGuard::new(&config.tools.exec.deny_patterns)
            .context("compiling tools.exec.denyPatterns")?;
        let policy = ExecutionPolicy {
            default_timeout: Duration::from_secs(config.tools.timeout_secs),
            guard: Arc::new(guard),
        };

        let registry = Arc::new(ToolRegistry::new());
        let exec = &config.tools.exec;
        let builtins: Vec<Arc<dyn crate::tools::Tool>> = vec![
            Arc::new(ReadFileTool),
            Arc::new(WriteFileTool),
            Arc::new(EditFileTool),
            Arc::new(ListDirTool),
            Arc::new(ExecTool::new(Duration::from_secs(exec.timeout_secs), exec.max_output_chars)),
            Arc::new(WebFetchTool::new(config.tools.web.max_chars)),
            Arc::new(MessageTool::new(bus.clone())),
            Arc::new(CronTool::new(cron.clone())),
        ];
        for tool in builtins {
            registry.register(tool).await.context("registering built-in tools")?;
        }
        let mcp = connect_servers(&config.tools.mcp, &workspace, &registry).await;

        let settings = config::agent_settings(&config);
        let mut context = ContextBuilder::new(&workspace);
        if let Some(summary) = config::summary_settings(&config) {
            log::info!("auto-summary enabled (T1={}, T2={})", summary.retain_tokens, summary.trigger_tokens);
            let summarizer = Summarizer::new(backend.clone(), settings.model.clone(), summary);
            context = context.with_summarizer(Arc::new(summarizer));
        }

        let executor = Arc::new(ToolExecutor::new(registry.clone(), policy).with_shutdown(shutdown.clone()));
        let runtime = Arc::new(
            AgentRuntime::new(
                backend,
                executor,
                sessions.clone(),
                context,
                settings,
            )
            .with_shutdown(shutdown.clone()),
        );
        let agent = Arc::new(AgentLoop::new(runtime.clone(), bus.clone()));
        let spawner = Arc::new(SubagentSpawner::new(runtime, bus.clone()));
        registry
            .register(Arc::new(SpawnTool::new(Arc::downgrade(&spawner))))
            .await
            .context("registering spawn tool")?;
        log::info!(
            "runtime assembled: {} tools ({} mcp servers), workspace {}, cron store {}",
            registry.len().await,
            mcp.len(),
            workspace.display(),
            store_path.display()
        );

        Ok(Self {
            config,
            workspace,
            bus,
            sessions,
            registry,
            agent,
            spawner,
            cron,
            channels: Arc::new(ChannelRegistry::new()),
            mcp,
            shutdown,
        })
    }

    /// Start the agent loop, scheduler, heartbeat and channels.
    pub async fn start(&self) -> Result<Running> {
        let mut tasks = Vec::new();

        let inbound = self.bus.subscribe_inbound(ChannelFilter::Any);
        tasks.push(tokio::spawn(self.agent.clone().run(inbound, self.shutdown.clone())));

        tasks.push(tokio::spawn(self.cron.clone().run(
            self.bus.clone(),
            Duration::from_millis(self.config.cron.tick_millis.max(10)),
            self.shutdown.clone(),
        )));

        let hb = &self.config.heartbeat;
        if hb.enabled && hb.interval_secs > 0 {
            let service = Arc::new(
                HeartbeatService::new(&self.workspace, Duration::from_secs(hb.interval_secs))
                    .with_delivery(hb.delivery()),
            );
            tasks.push(tokio::spawn(service.run(self.bus.clone(), self.shutdown.clone())));
        }

        let telegram = &self.config.channels.telegram;
        match config::resolve_telegram_token(&self.config) {
            Some(token) if telegram.enabled => {
                let channel = Arc::new(TelegramChannel::new(Some(token)));
                tasks.push(channel.clone().start_inbound(self.bus.clone()));
                self.channels.register(channel.clone()).await;
                log::info!("{} channel registered and getUpdates loop started", channel.id());
            }
            Some(_) => log::info!("telegram channel disabled in config"),
            None => log::debug!("no telegram bot token; telegram channel not started"),
        }
        let dispatchers = self.channels.attach_outbound(&self.bus).await;

        Ok(Running { tasks, dispatchers })
    }
}

/// Handles of the started background tasks.
pub struct Running {
    tasks: Vec<JoinHandle<()>>,
    dispatchers: Vec<JoinHandle<()>>,
}

impl Running {
    /// Cancel shared work, stop channels, and wait for the background tasks.
    pub async fn stop(self, runtime: &Runtime) {
        runtime.shutdown.cancel();
        runtime.channels.stop_all().await;
        for h in self.tasks {
            if let Err(e) = h.await {
                log::warn!("background task ended abnormally: {}", e);
            }
        }
        for d in self.dispatchers {
            d.abort();
        }
        log::info!("background tasks finished");
    }
}
