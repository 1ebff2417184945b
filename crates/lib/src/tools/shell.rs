//! `exec` tool and the command denylist.
//!
//! Commands are split into argv with shell-words and spawned directly; no shell is involved.
//! Chaining, substitution and redirection metacharacters are denied outright.

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Map, Value};
use std::process::Stdio;
use std::time::Duration;

use super::{opt_str_arg, resolve_in_workspace, str_arg, Capability, Tool, ToolContext, ToolError};

const DEFAULT_DENY_PATTERNS: &[&str] = &[
    r"\brm\b.*\s-[a-z]*[rf]",
    r"\brm\b.*\s--(?:recursive|force)\b",
    r"\bfind\b.*\s-(?:delete|exec\s+rm)\b",
    r"\bshred\b",
    r"\bdel\s+/[fq]",
    r"\brmdir\s+/s",
    r"(?:^|[;&|]\s*)format\b",
    r"\b(?:mkfs(?:\.\w+)?|diskpart)\b",
    r"\bdd\s+if=",
    r">\s*/dev/sd",
    r"\b(?:shutdown|reboot|poweroff|halt)\b",
    r":\(\)\s*\{.*\};\s*:",
    r"[;&|`<>]",
    r"\$\(",
];

/// Compiled denylist. A match fails closed with `Blocked`.
#[derive(Debug, Clone)]
pub struct CommandGuard {
    deny: Vec<Regex>,
}

impl Default for CommandGuard {
    fn default() -> Self {
        Self {
            deny: DEFAULT_DENY_PATTERNS
                .iter()
                .filter_map(|p| compile(p).ok())
                .collect(),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

impl CommandGuard {
    /// Built-in patterns plus `extra`.
    pub fn new(extra: &[String]) -> Result<Self, regex::Error> {
        let mut guard = Self::default();
        for p in extra {
            guard.deny.push(compile(p)?);
        }
        Ok(guard)
    }

    /// Only the given patterns.
    pub fn from_patterns(patterns: &[String]) -> Result<Self, regex::Error> {
        let deny = patterns.iter().map(|p| compile(p)).collect::<Result<_, _>>()?;
        Ok(Self { deny })
    }

    pub fn check(&self, command: &str) -> Result<(), ToolError> {
        match self.deny.iter().find(|re| re.is_match(command)) {
            Some(re) => {
                log::warn!("blocked command matching {}", re.as_str());
                Err(ToolError::Blocked(format!(
                    "command matches denied pattern `{}`",
                    re.as_str()
                )))
            }
            None => Ok(()),
        }
    }
}

/// Runs a command in the workspace. The denylist is applied by the executor before this runs.
pub struct ExecTool {
    timeout: Duration,
    output_limit: usize,
}

impl ExecTool {
    pub fn new(timeout: Duration, output_limit: usize) -> Self {
        Self {
            timeout,
            output_limit,
        }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Run a single command (no shell: no pipes, redirection or chaining) in the workspace and return its output."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Command line, e.g. `ls -la src`"},
                "working_dir": {"type": "string", "description": "Directory inside the workspace (default: workspace root)"}
            },
            "required": ["command"]
        })
    }

    fn capability(&self) -> Capability {
        Capability::Shell
    }

    fn output_limit(&self) -> usize {
        self.output_limit
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let command = str_arg(&args, "command")?;
        let argv = shell_words::split(command)
            .map_err(|e| ToolError::ArgumentInvalid(format!("cannot parse command: {}", e)))?;
        let Some((program, rest)) = argv.split_first() else {
            return Err(ToolError::ArgumentInvalid("empty command".to_string()));
        };
        let cwd = match opt_str_arg(&args, "working_dir") {
            Some(dir) => resolve_in_workspace(&ctx.workspace, dir)?,
            None => ctx.workspace.clone(),
        };

        log::debug!("exec: {} (cwd {})", command, cwd.display());
        let output = tokio::process::Command::new(program)
            .args(rest)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolError::RuntimeFailure(format!("failed to start {}: {}", program, e)))?;

        let mut parts = Vec::new();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
            parts.push(stdout.into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            parts.push(format!("STDERR:\n{}", stderr));
        }
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            parts.push(format!("\nExit code: {}", code));
        }
        if parts.is_empty() {
            return Ok("(no output)".to_string());
        }
        Ok(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ExecutionPolicy, ToolExecutor, ToolRegistry};
    use crate::llm::ToolCall;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn default_patterns_block_destructive_commands() {
        let guard = CommandGuard::default();
        for cmd in [
            "rm -rf /",
            "rm -r build",
            "rm -v -rf victim",
            "rm --recursive --force victim",
            "rm victim -rf",
            "rm --force victim",
            "find victim -delete",
            "find . -name '*.log' -exec rm {} +",
            "shred -u secrets.txt",
            "RM -Rf ~",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            "sudo shutdown -h now",
            "reboot",
            ":(){ :|:& };:",
            "ls; rm x",
            "cat a > b",
            "echo $(whoami)",
            "echo `id`",
            "true && false",
            "format c:",
        ] {
            assert!(matches!(guard.check(cmd), Err(ToolError::Blocked(_))), "allowed {}", cmd);
        }
    }

    #[test]
    fn ordinary_commands_pass() {
        let guard = CommandGuard::default();
        for cmd in [
            "ls -la",
            "git status",
            "cargo --version",
            "echo format-me",
            "cat README.md",
            "rm -v notes.txt",
            "find . -name '*.md'",
            "confirm --force",
        ] {
            assert!(guard.check(cmd).is_ok(), "blocked {}", cmd);
        }
    }

    #[test]
    fn extra_patterns_extend_defaults() {
        let guard = CommandGuard::new(&[r"\bcurl\b".to_string()]).unwrap();
        assert!(guard.check("curl example.com").is_err());
        assert!(guard.check("rm -rf x").is_err());
        assert!(CommandGuard::new(&["(".to_string()]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn recursive_rm_is_blocked_wherever_the_flag_sits(
            leading in prop::collection::vec("-[vi]", 0..3),
            operand in "[a-z][a-z0-9_.]{0,10}",
            flag in prop_oneof![
                Just("-r"), Just("-R"), Just("-rf"), Just("-fr"), Just("-vr"), Just("-f"),
                Just("--recursive"), Just("--force"),
            ],
            flag_last in any::<bool>(),
        ) {
            let mut argv = vec!["rm".to_string()];
            argv.extend(leading);
            if flag_last {
                argv.push(operand);
                argv.push(flag.to_string());
            } else {
                argv.push(flag.to_string());
                argv.push(operand);
            }
            let command = argv.join(" ");
            prop_assert!(
                matches!(CommandGuard::default().check(&command), Err(ToolError::Blocked(_))),
                "allowed {}", command
            );
        }
    }

    fn temp_workspace() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("crier-exec-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn executor() -> ToolExecutor {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(Arc::new(ExecTool::new(Duration::from_secs(10), 10_000)))
            .await
            .unwrap();
        ToolExecutor::new(registry, ExecutionPolicy::default())
    }

    #[tokio::test]
    async fn runs_command_in_workspace() {
        let ws = temp_workspace();
        std::fs::write(ws.join("marker.txt"), "x").unwrap();
        let exec = executor().await;
        let ctx = ToolContext::new("test", "1", &ws, Duration::from_secs(10));
        let result = exec
            .execute_call(&ToolCall::new("c1", "exec", json!({"command": "ls"})), &ctx)
            .await;
        assert!(result.error.is_none(), "{:?}", result.error);
        assert!(result.output.contains("marker.txt"));
        let _ = std::fs::remove_dir_all(&ws);
    }

    #[tokio::test]
    async fn blocked_command_spawns_nothing() {
        let ws = temp_workspace();
        let exec = executor().await;
        let ctx = ToolContext::new("test", "1", &ws, Duration::from_secs(10));
        let result = exec
            .execute_call(&ToolCall::new("c1", "exec", json!({"command": "touch created; rm -rf ."})), &ctx)
            .await;
        assert!(matches!(result.error, Some(ToolError::Blocked(_))));
        assert!(!ws.join("created").exists());
        let _ = std::fs::remove_dir_all(&ws);
    }

    #[tokio::test]
    async fn long_option_delete_leaves_directory_in_place() {
        let ws = temp_workspace();
        std::fs::create_dir_all(ws.join("victim/inner")).unwrap();
        let exec = executor().await;
        let ctx = ToolContext::new("test", "1", &ws, Duration::from_secs(10));
        for command in ["rm --recursive --force victim", "rm victim -rf", "find victim -delete"] {
            let result = exec
                .execute_call(&ToolCall::new("c1", "exec", json!({"command": command})), &ctx)
                .await;
            assert!(matches!(result.error, Some(ToolError::Blocked(_))), "{} ran", command);
        }
        assert!(ws.join("victim/inner").is_dir());
        let _ = std::fs::remove_dir_all(&ws);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let ws = temp_workspace();
        let exec = executor().await;
        let ctx = ToolContext::new("test", "1", &ws, Duration::from_secs(10));
        let result = exec
            .execute_call(&ToolCall::new("c1", "exec", json!({"command": "ls does-not-exist"})), &ctx)
            .await;
        assert!(result.error.is_none());
        assert!(result.output.contains("Exit code:"));
        let _ = std::fs::remove_dir_all(&ws);
    }
}
