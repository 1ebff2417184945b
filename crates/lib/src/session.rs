//! Conversation sessions for the agent loop.
//!
//! A session is keyed by `channel:chat_id` and holds the ordered transcript (user, assistant,
//! and tool turns) plus the iteration counter of the turn in progress. The store is shared;
//! per-session exclusivity is the agent loop's job. With a persistence directory, each
//! session is appended to `<dir>/<key>.jsonl` and reloaded lazily.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::llm::ChatMessage;

/// Session key: `channel:chat_id`.
pub type SessionKey = String;

#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub messages: Vec<ChatMessage>,
    /// Tool rounds run for the inbound message being processed. Reset on each dispatch.
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn new(key: SessionKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            messages: Vec::new(),
            iteration: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Last `limit` messages, starting at a user turn so no tool result is orphaned.
    pub fn history(&self, limit: usize) -> Vec<ChatMessage> {
        let start = self.messages.len().saturating_sub(limit);
        let window = &self.messages[start..];
        match window.iter().position(ChatMessage::is_user) {
            Some(first_user) => window[first_user..].to_vec(),
            None => Vec::new(),
        }
    }
}

/// Shared session store (create, get, append).
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<SessionKey, Session>>>,
    dir: Option<PathBuf>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// In-memory only.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            dir: None,
        }
    }

    /// Persist transcripts as JSONL under `dir`.
    pub fn with_persistence(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            dir: Some(dir.into()),
        }
    }

    /// Return the session, loading it from disk or creating it if needed.
    pub async fn get_or_create(&self, key: &str) -> Session {
        if let Some(s) = self.inner.read().await.get(key) {
            return s.clone();
        }
        let mut session = Session::new(key.to_string());
        if let Some(path) = self.session_path(key) {
            session.messages = load_jsonl(&path).await;
        }
        let mut g = self.inner.write().await;
        g.entry(key.to_string()).or_insert(session).clone()
    }

    /// Return a clone of the session if it is loaded.
    pub async fn get(&self, key: &str) -> Option<Session> {
        self.inner.read().await.get(key).cloned()
    }

    /// Append messages in order; returns error if the session was never created.
    pub async fn append(&self, key: &str, messages: Vec<ChatMessage>) -> Result<(), String> {
        if messages.is_empty() {
            return Ok(());
        }
        {
            let mut g = self.inner.write().await;
            let session = g.get_mut(key).ok_or_else(|| "session not found".to_string())?;
            session.messages.extend(messages.iter().cloned());
            session.updated_at = Utc::now();
        }
        if let Some(path) = self.session_path(key) {
            if let Err(e) = append_jsonl(&path, &messages).await {
                log::warn!("session {}: persisting transcript failed: {}", key, e);
            }
        }
        Ok(())
    }

    pub async fn set_iteration(&self, key: &str, iteration: u32) -> Result<(), String> {
        let mut g = self.inner.write().await;
        let session = g.get_mut(key).ok_or_else(|| "session not found".to_string())?;
        session.iteration = iteration;
        Ok(())
    }

    pub async fn history(&self, key: &str, limit: usize) -> Vec<ChatMessage> {
        self.inner
            .read()
            .await
            .get(key)
            .map(|s| s.history(limit))
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Percent-encoded so that distinct keys never share a file.
    fn session_path(&self, key: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        Some(dir.join(format!("{}.jsonl", urlencoding::encode(key))))
    }
}

async fn load_jsonl(path: &Path) -> Vec<ChatMessage> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<ChatMessage>(line) {
            Ok(m) => Some(m),
            Err(e) => {
                log::warn!("skipping bad transcript line in {}: {}", path.display(), e);
                None
            }
        })
        .collect()
}

async fn append_jsonl(path: &Path, messages: &[ChatMessage]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut buf = String::new();
    for m in messages {
        let line = serde_json::to_string(m).map_err(std::io::Error::other)?;
        buf.push_str(&line);
        buf.push('\n');
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(buf.as_bytes()).await?;
    file.flush().await
}
