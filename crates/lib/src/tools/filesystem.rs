//! File tools: read, write, edit, list. Every path is confined to the workspace root.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Component, Path, PathBuf};

use super::{str_arg, Capability, Tool, ToolContext, ToolError};

const MAX_WRITE_BYTES: usize = 10 * 1024 * 1024;

/// Resolve `raw` (relative to `workspace`, or absolute) and reject anything outside the root.
///
/// `..` components are folded lexically and symlinks are resolved on the longest existing
/// prefix, so neither can be used to step out of the workspace.
pub fn resolve_in_workspace(workspace: &Path, raw: &str) -> Result<PathBuf, ToolError> {
    let root = canonicalize_prefix(&normalize(workspace));
    let raw_path = Path::new(raw.trim());
    let joined = if raw_path.is_absolute() {
        raw_path.to_path_buf()
    } else {
        root.join(raw_path)
    };
    let resolved = canonicalize_prefix(&normalize(&joined));
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(ToolError::ArgumentInvalid(format!(
            "path {} is outside the workspace",
            raw
        )))
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn canonicalize_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
    let mut out = std::fs::canonicalize(&existing).unwrap_or(existing);
    for name in tail.into_iter().rev() {
        out.push(name);
    }
    out
}

fn path_schema(extra: Value) -> Value {
    let mut props = json!({
        "path": {"type": "string", "description": "Path relative to the workspace"}
    });
    let mut required = vec![json!("path")];
    if let (Some(p), Some(e)) = (props.as_object_mut(), extra.as_object()) {
        for (k, v) in e {
            p.insert(k.clone(), v.clone());
            required.push(json!(k));
        }
    }
    json!({"type": "object", "properties": props, "required": required})
}

fn io_failure(action: &str, path: &Path, e: std::io::Error) -> ToolError {
    ToolError::RuntimeFailure(format!("{} {}: {}", action, path.display(), e))
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace."
    }

    fn parameters(&self) -> Value {
        path_schema(json!({}))
    }

    fn capability(&self) -> Capability {
        Capability::Filesystem
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let raw = str_arg(&args, "path")?;
        let path = resolve_in_workspace(&ctx.workspace, raw)?;
        if !path.is_file() {
            return Err(ToolError::ArgumentInvalid(format!("not a file: {}", raw)));
        }
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_failure("reading", &path, e))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace, creating parent directories as needed."
    }

    fn parameters(&self) -> Value {
        path_schema(json!({"content": {"type": "string", "description": "Full file content"}}))
    }

    fn capability(&self) -> Capability {
        Capability::Filesystem
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let raw = str_arg(&args, "path")?;
        let content = str_arg(&args, "content")?;
        if content.len() > MAX_WRITE_BYTES {
            return Err(ToolError::ArgumentInvalid(format!(
                "content is {} bytes; limit is {}",
                content.len(),
                MAX_WRITE_BYTES
            )));
        }
        let path = resolve_in_workspace(&ctx.workspace, raw)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure("creating", parent, e))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_failure("writing", &path, e))?;
        Ok(format!("Wrote {} bytes to {}", content.len(), raw))
    }
}

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace one exact occurrence of old_text with new_text in a workspace file."
    }

    fn parameters(&self) -> Value {
        path_schema(json!({
            "old_text": {"type": "string", "description": "Exact text to replace; must occur once"},
            "new_text": {"type": "string", "description": "Replacement text"}
        }))
    }

    fn capability(&self) -> Capability {
        Capability::Filesystem
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let raw = str_arg(&args, "path")?;
        let old_text = str_arg(&args, "old_text")?;
        let new_text = str_arg(&args, "new_text")?;
        let path = resolve_in_workspace(&ctx.workspace, raw)?;
        if !path.is_file() {
            return Err(ToolError::ArgumentInvalid(format!("not a file: {}", raw)));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_failure("reading", &path, e))?;
        match content.matches(old_text).count() {
            0 => Err(ToolError::ArgumentInvalid("old_text not found in file".to_string())),
            1 => {
                let updated = content.replacen(old_text, new_text, 1);
                tokio::fs::write(&path, updated)
                    .await
                    .map_err(|e| io_failure("writing", &path, e))?;
                Ok(format!("Edited {}", raw))
            }
            n => Err(ToolError::ArgumentInvalid(format!(
                "old_text appears {} times; include more context so it is unique",
                n
            ))),
        }
    }
}

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a workspace directory. Directories are shown with a trailing slash."
    }

    fn parameters(&self) -> Value {
        path_schema(json!({}))
    }

    fn capability(&self) -> Capability {
        Capability::Filesystem
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let raw = str_arg(&args, "path")?;
        let path = resolve_in_workspace(&ctx.workspace, raw)?;
        if !path.is_dir() {
            return Err(ToolError::ArgumentInvalid(format!("not a directory: {}", raw)));
        }
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| io_failure("listing", &path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| io_failure("listing", &path, e))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        if names.is_empty() {
            return Ok(format!("Directory {} is empty", raw));
        }
        names.sort();
        Ok(names.join("\n"))
    }
}
