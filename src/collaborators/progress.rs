use crate::error::ProgressError;
use async_trait::async_trait;
use tracing::info;

/// Job progress tracking. Fire-and-forget: the pipeline logs and ignores errors.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, job_id: &str, percent: u8, message: &str, step: &str) -> Result<(), ProgressError>;
}

/// Emits progress as structured log events.
#[derive(Debug, Default, Clone)]
pub struct TracingProgressSink;

#[async_trait]
impl ProgressSink for TracingProgressSink {
    async fn report(&self, job_id: &str, percent: u8, message: &str, step: &str) -> Result<(), ProgressError> {
        info!(job_id, percent, step, "{message}");
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct NullProgressSink;

#[async_trait]
impl ProgressSink for NullProgressSink {
    async fn report(&self, _job_id: &str, _percent: u8, _message: &str, _step: &str) -> Result<(), ProgressError> {
        Ok(())
    }
}
