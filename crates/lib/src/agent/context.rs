//! System prompt assembly: identity, clock, workspace, and the workspace's own context files.
//!
//! `AGENTS.md` describes overall behavior; `memory/` holds the notes the agent keeps itself.
//! Everything is re-read on every turn so edits apply immediately.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::memory::MemoryStore;
use super::summary::Summarizer;
use crate::llm::ChatMessage;

const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md"];

/// Read a workspace file, returning None when missing or blank.
pub async fn load_workspace_file(workspace: &Path, rel: &str) -> Option<String> {
    match tokio::fs::read_to_string(workspace.join(rel)).await {
        Ok(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    }
}

#[derive(Clone)]
pub struct ContextBuilder {
    workspace: PathBuf,
    memory: MemoryStore,
    summarizer: Option<Arc<Summarizer>>,
}

impl ContextBuilder {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        Self {
            memory: MemoryStore::new(&workspace),
            workspace,
            summarizer: None,
        }
    }

    /// Compress long histories before they reach the model.
    pub fn with_summarizer(mut self, summarizer: Arc<Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub async fn system_prompt(&self, channel: &str, chat_id: &str, now: DateTime<Local>) -> String {
        let today = now.date_naive();
        let mut parts = vec![format!(
            "# crier\n\nYou are crier, a personal assistant with tools for files, shell commands, \
             the web, messaging, scheduling and delegating work to subagents.\n\n\
             ## Current Time\n{}\n\n## Workspace\n{}\n\
             Relative paths in file tools resolve against the workspace.\n\
             - Long-term memory: {}\n\
             - Daily notes: {}\n\
             Write lasting facts to long-term memory and day-specific notes to today's file.",
            now.format("%Y-%m-%d %H:%M (%A)"),
            self.workspace.display(),
            self.memory.long_term_file().display(),
            self.memory.day_file(today).display(),
        )];
        for name in BOOTSTRAP_FILES {
            if let Some(body) = load_workspace_file(&self.workspace, name).await {
                parts.push(format!("## {}\n\n{}", name, body.trim()));
            }
        }
        let memory = self.memory.context(today).await;
        if !memory.is_empty() {
            parts.push(format!("# Memory\n\n{}", memory));
        }
        parts.push(format!(
            "## Current Session\nChannel: {}\nChat ID: {}",
            channel, chat_id
        ));
        parts.join("\n\n---\n\n")
    }

    /// Full prompt for one model call: system, prior history (summarized when long), then the
    /// new user turn.
    pub async fn build_messages(
        &self,
        history: Vec<ChatMessage>,
        user: ChatMessage,
        channel: &str,
        chat_id: &str,
    ) -> Vec<ChatMessage> {
        let history = match &self.summarizer {
            Some(summarizer) => summarizer.compress(history).await,
            None => history,
        };
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt(channel, chat_id, Local::now()).await));
        messages.extend(history);
        messages.push(user);
        messages
    }
}

/// User turn text, with attachment references listed after the body.
pub fn user_content(content: &str, media: &[String]) -> String {
    if media.is_empty() {
        return content.to_string();
    }
    format!("{}\n\n[attachments: {}]", content, media.join(", "))
}
