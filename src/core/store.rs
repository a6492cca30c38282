use std::path::{Path, PathBuf};
use std::sync::Mutex;
use async_trait::async_trait;
use super::errors::{QueueError, Result};
use super::traits::StateStore;
use super::types::UploadTask;

/// Keeps the task list as pretty JSON in a single file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save(&self, tasks: &[UploadTask]) -> Result<()> {
        let data = serde_json::to_string_pretty(tasks)?;

        // Write then rename so a crash never leaves half a file behind.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<UploadTask>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) if data.trim().is_empty() => Ok(Vec::new()),
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-process store, mostly for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: Mutex<Option<Vec<UploadTask>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last saved snapshot, if any.
    pub fn snapshot(&self) -> Option<Vec<UploadTask>> {
        self.tasks.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, tasks: &[UploadTask]) -> Result<()> {
        let mut guard = self
            .tasks
            .lock()
            .map_err(|err| QueueError::Persistence(err.to_string()))?;
        *guard = Some(tasks.to_vec());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<UploadTask>> {
        let guard = self
            .tasks
            .lock()
            .map_err(|err| QueueError::Persistence(err.to_string()))?;
        Ok(guard.clone().unwrap_or_default())
    }
}
