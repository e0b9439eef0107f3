use crate::collaborators::source::VideoSource;
use crate::error::SourceError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Write-once, read-many storage keyed by job id, shared by the chunk
/// workers of one job. An entry is only visible to `open` after `commit`.
#[async_trait]
pub trait StagingArea: Send + Sync {
    async fn put(&self, job_id: &str, source: Arc<dyn VideoSource>) -> Result<(), SourceError>;
    async fn commit(&self, job_id: &str) -> Result<(), SourceError>;
    async fn open(&self, job_id: &str) -> Result<Arc<dyn VideoSource>, SourceError>;
    async fn remove(&self, job_id: &str) -> Result<(), SourceError>;
}

struct StagedEntry {
    source: Arc<dyn VideoSource>,
    committed: bool,
}

#[derive(Default)]
pub struct MemoryStaging {
    entries: RwLock<HashMap<String, StagedEntry>>,
}

impl MemoryStaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, job_id: &str) -> bool {
        self.entries.read().await.contains_key(job_id)
    }
}

#[async_trait]
impl StagingArea for MemoryStaging {
    async fn put(&self, job_id: &str, source: Arc<dyn VideoSource>) -> Result<(), SourceError> {
        self.entries.write().await.insert(
            job_id.to_string(),
            StagedEntry {
                source,
                committed: false,
            },
        );
        Ok(())
    }

    async fn commit(&self, job_id: &str) -> Result<(), SourceError> {
        match self.entries.write().await.get_mut(job_id) {
            Some(entry) => {
                entry.committed = true;
                Ok(())
            }
            None => Err(SourceError::Unreachable(format!("nothing staged for job {job_id}"))),
        }
    }

    async fn open(&self, job_id: &str) -> Result<Arc<dyn VideoSource>, SourceError> {
        match self.entries.read().await.get(job_id) {
            Some(entry) if entry.committed => Ok(Arc::clone(&entry.source)),
            _ => Err(SourceError::NotCommitted(job_id.to_string())),
        }
    }

    async fn remove(&self, job_id: &str) -> Result<(), SourceError> {
        self.entries.write().await.remove(job_id);
        Ok(())
    }
}
