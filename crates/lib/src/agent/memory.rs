//! Workspace memory: long-term notes in `memory/MEMORY.md` plus one `memory/YYYY-MM-DD.md`
//! file of daily notes per day. The agent edits both with the file tools; this module reads
//! them back into the system prompt.

use chrono::{Duration, NaiveDate};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const LONG_TERM_FILE: &str = "MEMORY.md";
const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone)]
pub struct MemoryStore {
    memory_dir: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            memory_dir: workspace.join("memory"),
        }
    }

    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    pub fn long_term_file(&self) -> PathBuf {
        self.memory_dir.join(LONG_TERM_FILE)
    }

    pub fn day_file(&self, day: NaiveDate) -> PathBuf {
        self.memory_dir.join(format!("{}.md", day.format(DAY_FORMAT)))
    }

    pub async fn read_long_term(&self) -> String {
        read_or_empty(&self.long_term_file()).await
    }

    pub async fn write_long_term(&self, content: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.memory_dir).await?;
        tokio::fs::write(self.long_term_file(), content).await
    }

    pub async fn read_day(&self, day: NaiveDate) -> String {
        read_or_empty(&self.day_file(day)).await
    }

    /// Append a note to the day's file; a new file starts with a `# YYYY-MM-DD` header.
    pub async fn append_day(&self, day: NaiveDate, note: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.memory_dir).await?;
        let path = self.day_file(day);
        let entry = if tokio::fs::try_exists(&path).await? {
            format!("\n{}\n", note.trim_end())
        } else {
            format!("# {}\n\n{}\n", day.format(DAY_FORMAT), note.trim_end())
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await
    }

    /// Daily note files, newest first. Other files in the directory are ignored.
    pub async fn list_day_files(&self) -> Vec<PathBuf> {
        let mut days = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.memory_dir).await else {
            return Vec::new();
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if let Some(day) = day_of(&path) {
                days.push((day, path));
            }
        }
        days.sort_by(|a, b| b.0.cmp(&a.0));
        days.into_iter().map(|(_, p)| p).collect()
    }

    /// Notes from the `days` days ending at `today`, oldest first.
    pub async fn recent(&self, days: u32, today: NaiveDate) -> String {
        let mut parts = Vec::new();
        for back in (0..days).rev() {
            let day = today - Duration::days(i64::from(back));
            let body = self.read_day(day).await;
            if !body.trim().is_empty() {
                parts.push(body.trim().to_string());
            }
        }
        parts.join("\n\n---\n\n")
    }

    /// Prompt section: long-term memory, then today's notes. Empty when neither exists.
    pub async fn context(&self, today: NaiveDate) -> String {
        let mut parts = Vec::new();
        let long_term = self.read_long_term().await;
        if !long_term.trim().is_empty() {
            parts.push(format!("## Long-term Memory\n{}", long_term.trim()));
        }
        let notes = self.read_day(today).await;
        if !notes.trim().is_empty() {
            parts.push(format!("## Today's Notes\n{}", notes.trim()));
        }
        parts.join("\n\n")
    }
}

fn day_of(path: &Path) -> Option<NaiveDate> {
    if path.extension()? != "md" {
        return None;
    }
    NaiveDate::parse_from_str(path.file_stem()?.to_str()?, DAY_FORMAT).ok()
}

async fn read_or_empty(path: &Path) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (MemoryStore, PathBuf) {
        let ws = std::env::temp_dir().join(format!("crier-memory-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&ws).unwrap();
        (MemoryStore::new(&ws), ws)
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DAY_FORMAT).unwrap()
    }

    #[test]
    fn files_live_under_memory_dir() {
        let store = MemoryStore::new(Path::new("/ws"));
        assert_eq!(store.long_term_file(), PathBuf::from("/ws/memory/MEMORY.md"));
        assert_eq!(store.day_file(day("2025-01-15")), PathBuf::from("/ws/memory/2025-01-15.md"));
    }

    #[tokio::test]
    async fn first_append_of_the_day_writes_header() {
        let (store, ws) = store();
        let today = day("2025-01-15");
        assert_eq!(store.read_day(today).await, "");
        store.append_day(today, "First entry").await.unwrap();
        store.append_day(today, "Second entry").await.unwrap();
        let notes = store.read_day(today).await;
        assert!(notes.starts_with("# 2025-01-15\n"));
        assert!(notes.contains("First entry"));
        assert!(notes.contains("Second entry"));
        assert_eq!(notes.matches("# 2025-01-15").count(), 1);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[tokio::test]
    async fn long_term_round_trip() {
        let (store, ws) = store();
        assert_eq!(store.read_long_term().await, "");
        let content = "# Important Information\nThis should persist.";
        store.write_long_term(content).await.unwrap();
        assert_eq!(store.read_long_term().await, content);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[tokio::test]
    async fn recent_days_are_joined_with_separators() {
        let (store, ws) = store();
        assert_eq!(store.recent(3, day("2025-01-16")).await, "");
        std::fs::create_dir_all(store.memory_dir()).unwrap();
        std::fs::write(store.memory_dir().join("2025-01-13.md"), "too old").unwrap();
        std::fs::write(store.memory_dir().join("2025-01-14.md"), "# Day 1").unwrap();
        std::fs::write(store.memory_dir().join("2025-01-16.md"), "# Day 3").unwrap();
        let recent = store.recent(3, day("2025-01-16")).await;
        assert_eq!(recent, "# Day 1\n\n---\n\n# Day 3");
        let _ = std::fs::remove_dir_all(ws);
    }

    #[tokio::test]
    async fn day_files_list_newest_first() {
        let (store, ws) = store();
        assert!(store.list_day_files().await.is_empty());
        std::fs::create_dir_all(store.memory_dir()).unwrap();
        for name in ["2025-01-14.md", "2025-01-16.md", "2025-01-15.md", "MEMORY.md", "notes.txt"] {
            std::fs::write(store.memory_dir().join(name), "x").unwrap();
        }
        let names: Vec<String> = store
            .list_day_files()
            .await
            .iter()
            .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
            .collect();
        assert_eq!(names, ["2025-01-16.md", "2025-01-15.md", "2025-01-14.md"]);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[tokio::test]
    async fn context_combines_long_term_and_today() {
        let (store, ws) = store();
        let today = day("2025-01-16");
        assert_eq!(store.context(today).await, "");
        store.write_long_term("Important info").await.unwrap();
        store.append_day(today, "Today's task").await.unwrap();
        store.append_day(day("2025-01-15"), "Yesterday's task").await.unwrap();
        let ctx = store.context(today).await;
        assert!(ctx.starts_with("## Long-term Memory\nImportant info"));
        assert!(ctx.contains("## Today's Notes\n# 2025-01-16"));
        assert!(ctx.contains("Today's task"));
        assert!(!ctx.contains("Yesterday"));
        let _ = std::fs::remove_dir_all(ws);
    }
}
