use async_trait::async_trait;
use super::errors::Result;
use super::progress::ProgressReporter;
use super::task::Payload;
use super::types::{TaskId, TransferReceipt, UploadOptions, UploadTask};

/// Everything a transport needs for one attempt.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub task_id: TaskId,
    pub payload: Payload,
    pub total_bytes: u64,
    /// Task options already merged over the run defaults
    pub options: UploadOptions,
}

/// Upload transport. One call is one attempt.
///
/// The scheduler aborts an attempt by dropping its future, so
/// implementations must not rely on running to completion. An `Err` return
/// marks the task `failed`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn transfer(
        &self,
        request: TransferRequest,
        progress: ProgressReporter,
    ) -> Result<TransferReceipt>;
}

/// Durable storage for task snapshots. Failures are logged by the caller.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, tasks: &[UploadTask]) -> Result<()>;

    /// An empty list when nothing was saved yet.
    async fn load(&self) -> Result<Vec<UploadTask>>;
}
