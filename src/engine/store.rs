//! Run State Store
//!
//! Persistence for `WorkflowRun` records, keyed by run id. Stores are dumb:
//! they hold whole run documents and know nothing about state transitions.
//! Two implementations ship with the crate:
//! - `InMemoryRunStore` - process-local map, used by tests and the default config
//! - `FileRunStore` - one JSON document per run in a directory

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::workflow::{RunStatus, WorkflowRun};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid run id: {0}")]
    InvalidKey(String),
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError>;

    /// Insert or overwrite the whole run record
    async fn put(&self, run: &WorkflowRun) -> Result<(), StoreError>;

    /// Every stored run, oldest first
    async fn list(&self) -> Result<Vec<WorkflowRun>, StoreError>;

    async fn list_by_project(&self, project_id: &str) -> Result<Vec<WorkflowRun>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.project_id == project_id)
            .collect())
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<WorkflowRun>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }
}

fn sort_runs(runs: &mut [WorkflowRun]) {
    runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
}

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<String, WorkflowRun>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn get(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn put(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let mut runs: Vec<WorkflowRun> = self.runs.read().await.values().cloned().collect();
        sort_runs(&mut runs);
        Ok(runs)
    }
}

/// Stores each run as `<dir>/<run_id>.json`
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a half-written run behind.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    /// Open (and create if needed) a store directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidKey(run_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", run_id)))
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn get(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        let path = match self.path_for(run_id) {
            Ok(path) => path,
            Err(StoreError::InvalidKey(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let path = self.path_for(&run.id)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(run)?;

        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(run_id = %run.id, path = %path.display(), "Saved run");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            runs.push(serde_json::from_slice(&bytes)?);
        }

        sort_runs(&mut runs);
        Ok(runs)
    }
}
