use std::path::PathBuf;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use super::errors::{QueueError, Result};
use super::progress::average_speed;
use super::types::{
    PayloadSource,
    TaskId,
    TaskStatus,
    TransferReceipt,
    UploadOptions,
    UploadTask,
};

pub const CANCELLED_MESSAGE: &str = "Upload cancelled";

/// Content handed to the transport.
#[derive(Debug, Clone)]
pub enum Payload {
    File(PathBuf),
    Bytes {
        name: String,
        data: Bytes,
    },
}

impl Payload {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::Bytes {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Payload::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Payload::Bytes { name, .. } => name.clone(),
        }
    }

    /// Byte length; rejects paths that are not regular files.
    pub async fn size(&self) -> Result<u64> {
        match self {
            Payload::File(path) => {
                let metadata = tokio::fs::metadata(path).await?;
                if !metadata.is_file() {
                    return Err(QueueError::InvalidPayload(format!(
                        "{} is not a file",
                        path.display()
                    )));
                }
                Ok(metadata.len())
            }
            Payload::Bytes { data, .. } => Ok(data.len() as u64),
        }
    }

    pub fn source(&self) -> PayloadSource {
        PayloadSource {
            name: self.name(),
            path: match self {
                Payload::File(path) => Some(path.clone()),
                Payload::Bytes { .. } => None,
            },
        }
    }

    /// Re-open a persisted source. In-memory payloads do not survive.
    pub fn from_source(source: &PayloadSource) -> Option<Self> {
        source.path.clone().map(Payload::File)
    }
}

/// Live side of an uploading task. Dropping it aborts the transfer and
/// frees the concurrency slot.
pub(crate) struct ActiveTransfer {
    pub attempt: u64,
    pub started: Instant,
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
    _permit: OwnedSemaphorePermit,
}

impl ActiveTransfer {
    pub fn new(
        attempt: u64,
        cancellation_token: CancellationToken,
        join_handle: JoinHandle<()>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            attempt,
            started: Instant::now(),
            cancellation_token,
            join_handle,
            _permit: permit,
        }
    }
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
        self.join_handle.abort();
    }
}

/// A task as the scheduler holds it: the snapshot plus what cannot be
/// serialized.
pub(crate) struct TaskEntry {
    pub task: UploadTask,
    pub payload: Option<Payload>,
    transfer: Option<ActiveTransfer>,
}

impl TaskEntry {
    pub fn new(payload: Payload, total_bytes: u64, options: UploadOptions) -> Self {
        let task = UploadTask {
            id: TaskId::new(),
            source: payload.source(),
            status: TaskStatus::Queued,
            total_bytes,
            uploaded_bytes: 0,
            speed: 0.0,
            options,
            error: None,
            attempts: 0,
            receipt: None,
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            completed_at: None,
        };

        Self {
            task,
            payload: Some(payload),
            transfer: None,
        }
    }

    /// Rebuild from a persisted snapshot. A task caught mid-transfer goes
    /// back to the queue with its progress dropped.
    pub fn restored(mut task: UploadTask) -> Self {
        if task.status == TaskStatus::Uploading {
            task.status = TaskStatus::Queued;
            task.uploaded_bytes = 0;
        }
        task.speed = 0.0;

        let payload = match task.status {
            TaskStatus::Completed => None,
            _ => Payload::from_source(&task.source),
        };

        Self {
            task,
            payload,
            transfer: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    pub fn is_current_attempt(&self, attempt: u64) -> bool {
        self.transfer.as_ref().is_some_and(|t| t.attempt == attempt)
    }

    /// Set the status; leaving `Uploading` drops the live transfer.
    fn set_status(&mut self, status: TaskStatus) -> TaskStatus {
        let old = self.task.status;
        self.task.status = status;
        if status != TaskStatus::Uploading {
            self.transfer = None;
            self.task.speed = 0.0;
        }
        old
    }

    /// `Queued` -> `Uploading`.
    pub fn begin(&mut self, transfer: ActiveTransfer) -> TaskStatus {
        self.transfer = Some(transfer);
        self.task.uploaded_bytes = 0;
        self.task.speed = 0.0;
        self.task.error = None;
        self.task.paused_at = None;
        self.task.started_at = Some(Utc::now());
        self.task.attempts += 1;
        self.set_status(TaskStatus::Uploading)
    }

    /// Apply a byte count from the current attempt.
    pub fn record_progress(&mut self, bytes: u64, now: Instant) {
        let Some(transfer) = &self.transfer else {
            return;
        };
        let uploaded = bytes.min(self.task.total_bytes);
        self.task.uploaded_bytes = uploaded;
        self.task.speed = average_speed(uploaded, now.saturating_duration_since(transfer.started));
    }

    pub fn complete(&mut self, receipt: TransferReceipt) -> TaskStatus {
        self.task.uploaded_bytes = self.task.total_bytes;
        self.task.receipt = Some(receipt);
        self.task.error = None;
        self.task.completed_at = Some(Utc::now());
        self.payload = None;
        self.set_status(TaskStatus::Completed)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> TaskStatus {
        self.task.error = Some(error.into());
        self.set_status(TaskStatus::Failed)
    }

    /// `Uploading` -> `Paused`, keeping the byte count.
    pub fn pause(&mut self) -> Option<TaskStatus> {
        if self.status() != TaskStatus::Uploading {
            return None;
        }
        self.task.paused_at = Some(Utc::now());
        Some(self.set_status(TaskStatus::Paused))
    }

    /// `Paused` -> `Queued`. The next attempt starts from byte 0.
    pub fn resume(&mut self) -> Option<TaskStatus> {
        if self.status() != TaskStatus::Paused {
            return None;
        }
        self.task.uploaded_bytes = 0;
        self.task.paused_at = None;
        Some(self.set_status(TaskStatus::Queued))
    }

    /// No-op on `Completed` and `Cancelled`.
    pub fn cancel(&mut self) -> Option<TaskStatus> {
        if self.status().is_terminal() {
            return None;
        }
        self.task.error = Some(CANCELLED_MESSAGE.to_string());
        Some(self.set_status(TaskStatus::Cancelled))
    }

    /// `Failed` | `Cancelled` -> `Queued`.
    pub fn retry(&mut self) -> Result<TaskStatus> {
        match self.status() {
            TaskStatus::Failed | TaskStatus::Cancelled => {
                self.task.error = None;
                self.task.uploaded_bytes = 0;
                self.task.receipt = None;
                self.task.paused_at = None;
                Ok(self.set_status(TaskStatus::Queued))
            }
            status => Err(QueueError::InvalidTransition {
                id: self.id(),
                status,
                action: "retry",
            }),
        }
    }
}
