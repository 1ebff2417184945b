//! Durable job store: a versioned JSON file, written atomically and reloaded when it changes
//! on disk (so `crier cron ...` edits reach a running gateway). Also has an in-memory mode.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::Mutex;

use super::{CronError, CronJob};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    jobs: Vec<CronJob>,
}

#[derive(Default)]
struct State {
    jobs: Vec<CronJob>,
    loaded: bool,
    mtime: Option<SystemTime>,
}

pub struct CronStore {
    path: Option<PathBuf>,
    state: Mutex<State>,
}

impl CronStore {
    /// File-backed store. The file is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            state: Mutex::new(State::default()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(State {
                loaded: true,
                ..State::default()
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn list(&self) -> Result<Vec<CronJob>, CronError> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        Ok(state.jobs.clone())
    }

    pub async fn get(&self, id: &str) -> Result<CronJob, CronError> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        state
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| CronError::NotFound(id.to_string()))
    }

    pub async fn insert(&self, job: CronJob) -> Result<(), CronError> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        if state.jobs.iter().any(|j| j.id == job.id) {
            return Err(CronError::Store(format!("job id {} already exists", job.id)));
        }
        let mut jobs = state.jobs.clone();
        jobs.push(job);
        self.commit(&mut state, jobs).await
    }

    pub async fn remove(&self, id: &str) -> Result<CronJob, CronError> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        let idx = state
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| CronError::NotFound(id.to_string()))?;
        let mut jobs = state.jobs.clone();
        let job = jobs.remove(idx);
        self.commit(&mut state, jobs).await?;
        Ok(job)
    }

    /// Mutate one job under the store lock and persist; returns the updated record.
    pub async fn update<F>(&self, id: &str, f: F) -> Result<CronJob, CronError>
    where
        F: FnOnce(&mut CronJob),
    {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        let mut jobs = state.jobs.clone();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| CronError::NotFound(id.to_string()))?;
        f(job);
        let updated = job.clone();
        self.commit(&mut state, jobs).await?;
        Ok(updated)
    }

    pub async fn len(&self) -> Result<usize, CronError> {
        Ok(self.list().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, CronError> {
        Ok(self.len().await? == 0)
    }

    async fn refresh(&self, state: &mut State) -> Result<(), CronError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mtime = tokio::fs::metadata(path).await.and_then(|m| m.modified()).ok();
        if state.loaded && mtime == state.mtime {
            return Ok(());
        }
        state.jobs = match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let file: StoreFile = serde_json::from_str(&raw)
                    .map_err(|e| CronError::Store(format!("parsing {}: {}", path.display(), e)))?;
                file.jobs
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(CronError::Store(format!("reading {}: {}", path.display(), e))),
        };
        if state.loaded {
            log::info!("cron: reloaded {} jobs from {}", state.jobs.len(), path.display());
        }
        state.loaded = true;
        state.mtime = mtime;
        Ok(())
    }

    /// Write `jobs` and only then make them the in-memory state. On error the store is unchanged.
    async fn commit(&self, state: &mut State, jobs: Vec<CronJob>) -> Result<(), CronError> {
        let Some(path) = &self.path else {
            state.jobs = jobs;
            return Ok(());
        };
        let file = StoreFile {
            version: STORE_VERSION,
            jobs,
        };
        let body = serde_json::to_string_pretty(&file)
            .map_err(|e| CronError::Store(format!("serializing jobs: {}", e)))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CronError::Store(format!("creating {}: {}", parent.display(), e)))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| CronError::Store(format!("writing {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| CronError::Store(format!("replacing {}: {}", path.display(), e)))?;
        state.jobs = file.jobs;
        state.mtime = tokio::fs::metadata(path).await.and_then(|m| m.modified()).ok();
        Ok(())
    }
}
