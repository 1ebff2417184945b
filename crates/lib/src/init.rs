//! Initialize the configuration directory: create ~/.crier, default config, and the workspace.
//!
//! Layout mirrors `crates/lib/config/`: `config/workspace/*.md` → `~/.crier/workspace/*.md`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config;

static DEFAULT_AGENT_CTX: &str = include_str!("../config/workspace/AGENTS.md");
static DEFAULT_HEARTBEAT: &str = include_str!("../config/workspace/HEARTBEAT.md");

/// Ensure the configuration directory has been initialized (config file and workspace exist).
pub fn require_initialized(config_path: &Path, config: &config::Config) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `crier init` first (config file not found: {})",
            config_path.display()
        );
    }
    let workspace = config::resolve_workspace_dir(config, config_path);
    if !workspace.exists() {
        anyhow::bail!(
            "configuration not initialized; run `crier init` first (workspace not found: {})",
            workspace.display()
        );
    }
    Ok(())
}

fn seed(path: &Path, body: &str) -> Result<()> {
    if path.exists() {
        log::debug!("{} already exists, skipping", path.display());
        return Ok(());
    }
    std::fs::write(path, body).with_context(|| format!("writing {}", path.display()))?;
    log::info!("wrote {}", path.display());
    Ok(())
}

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with `{}` if missing.
/// - Creates the `workspace` subdirectory (with `memory/`) and seeds `AGENTS.md` and
///   `HEARTBEAT.md` from the templates if missing.
///
/// Existing files are never overwritten. Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;
    seed(config_path, "{}")?;

    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;
    let workspace = config::resolve_workspace_dir(&config, config_path);
    std::fs::create_dir_all(workspace.join("memory"))
        .with_context(|| format!("creating workspace directory {}", workspace.display()))?;
    seed(&workspace.join("AGENTS.md"), DEFAULT_AGENT_CTX)?;
    seed(&workspace.join(crate::heartbeat::HEARTBEAT_FILE), DEFAULT_HEARTBEAT)?;

    Ok(config_dir.to_path_buf())
}
