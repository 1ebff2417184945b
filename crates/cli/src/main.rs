use clap::{Args, Parser, Subcommand};
use crier::config::{self, Config};
use crier::cron::{describe, parse_at, CronJob, CronSchedule, CronService, CronStore, NewJob, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "crier")]
#[command(about = "Crier personal assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config, workspace, AGENTS.md, HEARTBEAT.md).
    Init {
        /// Config file path (default: CRIER_CONFIG_PATH or ~/.crier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway: agent loop, cron scheduler, heartbeat, channels, and the health endpoint.
    Gateway {
        /// Config file path (default: CRIER_CONFIG_PATH or ~/.crier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP port (default from config or 15151)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Run one agent turn in-process and print the reply.
    Agent {
        /// Message to send
        #[arg(long, short)]
        message: String,

        /// Session as channel:chat_id
        #[arg(long, short, default_value = "cli:direct")]
        session: String,

        /// Config file path (default: CRIER_CONFIG_PATH or ~/.crier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Manage scheduled jobs.
    Cron {
        /// Config file path (default: CRIER_CONFIG_PATH or ~/.crier/config.json)
        #[arg(long, short, value_name = "PATH", global = true)]
        config: Option<PathBuf>,

        #[command(subcommand)]
        command: CronCommands,
    },
}

#[derive(Subcommand)]
enum CronCommands {
    /// List jobs
    List {
        /// Include disabled jobs
        #[arg(long, short)]
        all: bool,
    },
    /// Add a job
    Add(AddArgs),
    /// Remove a job
    Remove { id: String },
    /// Enable (or with --disable, disable) a job
    Enable {
        id: String,
        #[arg(long)]
        disable: bool,
    },
}

#[derive(Args)]
struct AddArgs {
    /// Job name
    #[arg(long, short)]
    name: String,
    /// Message handed to the agent when the job fires
    #[arg(long, short)]
    message: String,
    /// Run every N seconds
    #[arg(long, short, conflicts_with_all = ["cron", "at"])]
    every: Option<u64>,
    /// Cron expression, e.g. "0 9 * * 1-5"
    #[arg(long, conflicts_with = "at")]
    cron: Option<String>,
    /// Run once at an ISO-8601 time, e.g. 2026-01-31T09:00:00
    #[arg(long)]
    at: Option<String>,
    /// Deliver the agent's reply to a chat
    #[arg(long, short)]
    deliver: bool,
    /// Delivery channel (e.g. telegram)
    #[arg(long, requires = "deliver")]
    channel: Option<String>,
    /// Delivery recipient (chat id)
    #[arg(long, requires = "deliver")]
    to: Option<String>,
}

impl AddArgs {
    fn into_job(self) -> anyhow::Result<NewJob> {
        let schedule = match (self.every, self.cron, self.at) {
            (Some(every_seconds), None, None) => CronSchedule::Every { every_seconds },
            (None, Some(expr), None) => CronSchedule::Cron { expr },
            (None, None, Some(at)) => CronSchedule::At { at: parse_at(&at)? },
            _ => anyhow::bail!("invalid schedule: pass exactly one of --every, --cron or --at"),
        };
        let job = NewJob::new(self.name, schedule, self.message);
        if !self.deliver {
            return Ok(job);
        }
        match (self.channel, self.to) {
            (Some(channel), Some(to)) if !channel.trim().is_empty() && !to.trim().is_empty() => {
                Ok(job.deliver_to(channel, to))
            }
            _ => anyhow::bail!("--deliver needs both --channel and --to"),
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("crier {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Gateway { config, port }) => run_gateway(config, port).await,
        Some(Commands::Agent { message, session, config }) => run_agent(config, &session, &message).await,
        Some(Commands::Cron { config, command }) => run_cron(config, command).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = crier::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    crier::gateway::run_gateway(config, path).await
}

async fn run_agent(config_path: Option<PathBuf>, session: &str, message: &str) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    crier::init::require_initialized(&path, &config)?;
    let (channel, chat_id) = session.split_once(':').unwrap_or(("cli", session));
    let runtime = crier::gateway::Runtime::assemble(config, &path).await?;
    let reply = runtime.agent.process_direct(message, channel, chat_id).await;
    println!("{}", reply.trim());
    Ok(())
}

fn cron_service(config: &Config, path: &std::path::Path) -> CronService {
    let store = CronStore::open(config::resolve_cron_store_path(config, path));
    CronService::new(store, Arc::new(SystemClock))
}

async fn run_cron(config_path: Option<PathBuf>, command: CronCommands) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    let service = cron_service(&config, &path);
    match command {
        CronCommands::List { all } => {
            let jobs = service.list_jobs(all).await?;
            if jobs.is_empty() {
                println!("No scheduled jobs.");
            }
            for job in &jobs {
                println!("{}", format_job(job));
            }
        }
        CronCommands::Add(args) => {
            let job = service.add_job(args.into_job()?).await?;
            println!("Added job '{}' ({})", job.name, job.id);
        }
        CronCommands::Remove { id } => {
            service.remove_job(&id).await?;
            println!("Removed job {}", id);
        }
        CronCommands::Enable { id, disable } => {
            let job = service.enable_job(&id, !disable).await?;
            println!("Job {} {}", job.id, if job.enabled { "enabled" } else { "disabled" });
        }
    }
    Ok(())
}

fn format_job(job: &CronJob) -> String {
    let status = if job.enabled { "enabled" } else { "disabled" };
    format!("{}  {}  {}  {}  next: {}", job.id, job.name, describe(&job.schedule), status, job.next_run_display())
}
