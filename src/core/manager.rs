use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use crate::config::QueueConfig;
use super::errors::{QueueError, Result};
use super::manager_worker::SchedulerWorker;
use super::store::JsonFileStore;
use super::task::Payload;
use super::traits::{StateStore, Transport};
use super::types::{
    QueueEvent,
    QueueStats,
    SchedulerCommand,
    TaskId,
    UploadOptions,
    UploadTask,
};

/// Cloneable front of the upload queue. Every call is forwarded to the
/// scheduler worker, which owns the task list.
#[derive(Clone)]
pub struct UploadScheduler {
    command_tx: mpsc::Sender<SchedulerCommand>,
    event_tx: broadcast::Sender<QueueEvent>,
}

/// Scheduler plus its worker task.
pub struct SchedulerHandle {
    pub scheduler: UploadScheduler,
    pub worker_handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Save state, abort in-flight transfers and wait for the worker.
    pub async fn shutdown(self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.scheduler
            .command_tx
            .send(SchedulerCommand::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }

        self.worker_handle
            .await
            .map_err(|err| QueueError::Internal(format!("Worker panic: {}", err)))
    }
}

pub struct SchedulerBuilder {
    transport: Arc<dyn Transport>,
    config: QueueConfig,
    store: Option<Arc<dyn StateStore>>,
}

impl SchedulerBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: QueueConfig::default(),
            store: None,
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = max_concurrent;
        self
    }

    /// Overrides `state_file` from the config.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn spawn(self) -> Result<SchedulerHandle> {
        self.config.validate()?;

        let store = self.store.or_else(|| {
            self.config
                .state_file
                .clone()
                .map(|path| Arc::new(JsonFileStore::new(path)) as Arc<dyn StateStore>)
        });

        let (command_tx, command_rx) = mpsc::channel(self.config.command_buffer);
        let (event_tx, _) = broadcast::channel(self.config.event_capacity);

        let worker_handle = tokio::spawn(SchedulerWorker::run(
            self.transport,
            store,
            self.config,
            command_rx,
            event_tx.clone(),
        ));

        Ok(SchedulerHandle {
            scheduler: UploadScheduler { command_tx, event_tx },
            worker_handle,
        })
    }
}

impl UploadScheduler {
    pub fn builder(transport: Arc<dyn Transport>) -> SchedulerBuilder {
        SchedulerBuilder::new(transport)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| QueueError::SchedulerShutdown)?;

        reply_rx.await.map_err(|_| QueueError::SchedulerShutdown)
    }

    /// Queue payloads and return their ids in order.
    ///
    /// Sizes are read up front; one unreadable payload rejects the whole
    /// batch before anything is queued.
    pub async fn enqueue<I>(&self, payloads: I, options: UploadOptions) -> Result<Vec<TaskId>>
    where
        I: IntoIterator<Item = Payload>,
    {
        let mut sized = Vec::new();
        for payload in payloads {
            let size = payload.size().await?;
            sized.push((payload, size));
        }

        self.request(|reply| SchedulerCommand::Enqueue { payloads: sized, options, reply })
            .await
    }

    pub async fn enqueue_files<I, P>(&self, paths: I, options: UploadOptions) -> Result<Vec<TaskId>>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.enqueue(paths.into_iter().map(Payload::file), options).await
    }

    /// Run the queue until nothing is queued or uploading.
    ///
    /// Failed tasks are put back in the queue first. Task failures do not
    /// make this return an error; inspect the returned stats. If a run is
    /// already in progress this returns the current stats right away.
    pub async fn start(&self, options: UploadOptions) -> Result<QueueStats> {
        self.request(|reply| SchedulerCommand::Start { options, reply })
            .await
    }

    /// Pause an uploading task
    pub async fn pause(&self, id: TaskId) -> Result<()> {
        self.request(|reply| SchedulerCommand::Pause { id, reply })
            .await?
    }

    pub async fn pause_all(&self) -> Result<usize> {
        self.request(|reply| SchedulerCommand::PauseAll { reply })
            .await
    }

    /// Re-queue a paused task. The upload restarts from the first byte.
    pub async fn resume(&self, id: TaskId) -> Result<()> {
        self.request(|reply| SchedulerCommand::Resume { id, reply })
            .await?
    }

    pub async fn resume_all(&self) -> Result<usize> {
        self.request(|reply| SchedulerCommand::ResumeAll { reply })
            .await
    }

    /// Cancel a task. Cancelling a finished or cancelled task does nothing.
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        self.request(|reply| SchedulerCommand::Cancel { id, reply })
            .await?
    }

    /// Re-queue a failed or cancelled task
    pub async fn retry(&self, id: TaskId) -> Result<()> {
        self.request(|reply| SchedulerCommand::Retry { id, reply })
            .await?
    }

    pub async fn remove(&self, id: TaskId) -> Result<()> {
        self.request(|reply| SchedulerCommand::Remove { id, reply })
            .await?
    }

    pub async fn clear_completed(&self) -> Result<usize> {
        self.request(|reply| SchedulerCommand::ClearCompleted { reply })
            .await
    }

    pub async fn clear_all(&self) -> Result<usize> {
        self.request(|reply| SchedulerCommand::ClearAll { reply })
            .await
    }

    pub async fn task(&self, id: TaskId) -> Result<Option<UploadTask>> {
        self.request(|reply| SchedulerCommand::GetTask { id, reply })
            .await
    }

    /// All tasks in insertion order
    pub async fn tasks(&self) -> Result<Vec<UploadTask>> {
        self.request(|reply| SchedulerCommand::GetAllTasks { reply })
            .await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.request(|reply| SchedulerCommand::Stats { reply })
            .await
    }

    /// Subscribe to queue events. Drop the receiver to unsubscribe.
    ///
    /// A receiver that falls more than `event_capacity` events behind gets
    /// `RecvError::Lagged`; the next `TasksChanged` carries the full list
    /// again.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }
}
