use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;
use super::errors::Result;
use super::task::Payload;

/// While a task is not `Completed` its reported progress stays below this.
pub const MAX_INFLIGHT_PROGRESS: f64 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a free slot
    Queued,
    /// Transfer in flight
    Uploading,
    /// Stopped by the user, keeps its byte count
    Paused,
    Completed,
    /// Transport error, recoverable through retry
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// `Completed` and `Cancelled` see no further automatic transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Statuses that keep a run going.
    pub fn is_pending(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Uploading)
    }
}

/// Where a task goes and what travels with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UploadOptions {
    /// Target folder or file-request identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Extra form fields and flags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl UploadOptions {
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.destination.is_none() && self.tags.is_empty() && self.fields.is_empty()
    }

    /// Fill what this set leaves open from `defaults`. Values on `self` win.
    pub fn merged_over(&self, defaults: &UploadOptions) -> UploadOptions {
        let mut tags = self.tags.clone();
        for tag in &defaults.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }

        let mut fields = defaults.fields.clone();
        fields.extend(self.fields.iter().map(|(k, v)| (k.clone(), v.clone())));

        UploadOptions {
            destination: self.destination.clone().or_else(|| defaults.destination.clone()),
            tags,
            fields,
        }
    }
}

/// Serializable description of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PayloadSource {
    pub name: String,
    /// Only file payloads can be re-opened after a restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// What the server handed back for a finished upload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TransferReceipt {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: TaskId,
    pub source: PayloadSource,
    pub status: TaskStatus,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    /// Bytes per second since admission. Not persisted.
    #[serde(skip)]
    pub speed: f64,
    #[serde(default)]
    pub options: UploadOptions,
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<TransferReceipt>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadTask {
    /// Fraction in `[0, 1]`; only a completed task reports exactly 1.
    pub fn progress(&self) -> f64 {
        if self.status == TaskStatus::Completed {
            return 1.0;
        }
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.uploaded_bytes as f64 / self.total_bytes as f64).min(MAX_INFLIGHT_PROGRESS)
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.uploaded_bytes)
    }

    pub fn eta(&self) -> Option<Duration> {
        if self.status != TaskStatus::Uploading || self.speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(self.remaining_bytes() as f64 / self.speed))
    }
}

/// Aggregate view over a task list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub uploading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    /// Mean speed of the tasks currently uploading
    pub average_speed: f64,
}

impl QueueStats {
    pub fn from_tasks<'a, I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = &'a UploadTask>,
    {
        let mut stats = QueueStats::default();
        let mut speed_sum = 0.0;

        for task in tasks {
            stats.total += 1;
            stats.total_bytes += task.total_bytes;
            match task.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Uploading => {
                    stats.uploading += 1;
                    speed_sum += task.speed;
                }
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            stats.uploaded_bytes += if task.status == TaskStatus::Completed {
                task.total_bytes
            } else {
                task.uploaded_bytes.min(task.total_bytes)
            };
        }

        if stats.uploading > 0 {
            stats.average_speed = speed_sum / stats.uploading as f64;
        }
        stats
    }

    /// No task is waiting for or holding a slot.
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.uploading == 0
    }

    pub fn overall_progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.uploaded_bytes as f64 / self.total_bytes as f64
    }
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Full task list after a mutation
    TasksChanged(Arc<[UploadTask]>),

    StateChanged {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    Completed {
        id: TaskId,
        receipt: TransferReceipt,
    },

    Failed {
        id: TaskId,
        error: String,
    },

    /// Nothing queued and nothing uploading
    Idle(QueueStats),
}

/// Commands handled by the scheduler worker
pub(crate) enum SchedulerCommand {
    Enqueue {
        payloads: Vec<(Payload, u64)>,
        options: UploadOptions,
        reply: oneshot::Sender<Vec<TaskId>>,
    },

    /// Replies once the queue drains
    Start {
        options: UploadOptions,
        reply: oneshot::Sender<QueueStats>,
    },

    Pause {
        id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    PauseAll {
        reply: oneshot::Sender<usize>,
    },

    Resume {
        id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    ResumeAll {
        reply: oneshot::Sender<usize>,
    },

    Cancel {
        id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    Retry {
        id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    Remove {
        id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    ClearCompleted {
        reply: oneshot::Sender<usize>,
    },

    ClearAll {
        reply: oneshot::Sender<usize>,
    },

    GetTask {
        id: TaskId,
        reply: oneshot::Sender<Option<UploadTask>>,
    },

    GetAllTasks {
        reply: oneshot::Sender<Vec<UploadTask>>,
    },

    Stats {
        reply: oneshot::Sender<QueueStats>,
    },

    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: TaskStatus, total: u64, uploaded: u64) -> UploadTask {
        UploadTask {
            id: TaskId::new(),
            source: PayloadSource { name: "a.png".into(), path: None },
            status,
            total_bytes: total,
            uploaded_bytes: uploaded,
            speed: 0.0,
            options: UploadOptions::default(),
            error: None,
            attempts: 0,
            receipt: None,
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_task_id_generation() {
        let id1 = TaskId::new();
        let id2 = TaskId::new();

        assert_ne!(id1, id2);
        assert!(!id1.to_string().is_empty());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Uploading).unwrap();
        assert_eq!(json, "\"uploading\"");
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_progress_is_one_only_when_completed() {
        let uploading = task(TaskStatus::Uploading, 100, 100);
        assert!(uploading.progress() < 1.0);

        let completed = task(TaskStatus::Completed, 100, 100);
        assert_eq!(completed.progress(), 1.0);

        let empty = task(TaskStatus::Completed, 0, 0);
        assert_eq!(empty.progress(), 1.0);

        let half = task(TaskStatus::Paused, 200, 100);
        assert_eq!(half.progress(), 0.5);
    }

    #[test]
    fn test_eta_only_while_uploading() {
        let mut t = task(TaskStatus::Uploading, 1000, 400);
        t.speed = 100.0;
        assert_eq!(t.eta(), Some(Duration::from_secs(6)));

        t.status = TaskStatus::Paused;
        assert_eq!(t.eta(), None);
    }

    #[test]
    fn test_stats_from_tasks() {
        let mut a = task(TaskStatus::Uploading, 100, 50);
        a.speed = 10.0;
        let mut b = task(TaskStatus::Uploading, 100, 20);
        b.speed = 30.0;
        let c = task(TaskStatus::Completed, 100, 100);
        let d = task(TaskStatus::Failed, 100, 10);
        let e = task(TaskStatus::Queued, 100, 0);

        let stats = QueueStats::from_tasks(&[a, b, c, d, e]);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.uploading, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.total_bytes, 500);
        assert_eq!(stats.uploaded_bytes, 180);
        assert_eq!(stats.average_speed, 20.0);
        assert!(!stats.is_idle());
    }

    #[test]
    fn test_options_merge() {
        let defaults = UploadOptions::default()
            .with_destination("folder-1")
            .with_tag("campaign")
            .with_field("editor", "7");
        let own = UploadOptions::default()
            .with_tag("hero")
            .with_tag("campaign")
            .with_field("editor", "9");

        let merged = own.merged_over(&defaults);
        assert_eq!(merged.destination.as_deref(), Some("folder-1"));
        assert_eq!(merged.tags, vec!["hero".to_string(), "campaign".to_string()]);
        assert_eq!(merged.fields.get("editor").map(String::as_str), Some("9"));
    }

    #[test]
    fn test_speed_is_not_persisted() {
        let mut t = task(TaskStatus::Uploading, 100, 40);
        t.speed = 55.0;
        let json = serde_json::to_string(&t).unwrap();
        let back: UploadTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back.speed, 0.0);
        assert_eq!(back.uploaded_bytes, 40);
    }
}
