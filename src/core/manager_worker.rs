use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use crate::config::QueueConfig;
use super::errors::{QueueError, Result};
use super::progress::{ProgressReporter, TransferMessage};
use super::task::{ActiveTransfer, Payload, TaskEntry};
use super::traits::{StateStore, Transport, TransferRequest};
use super::types::{
    QueueEvent,
    QueueStats,
    SchedulerCommand,
    TaskId,
    TaskStatus,
    TransferReceipt,
    UploadOptions,
};

const PAYLOAD_LOST: &str = "Payload unavailable after restart";

/// A `start` call waiting for the queue to drain.
struct RunState {
    reply: oneshot::Sender<QueueStats>,
}

enum Flow {
    Continue,
    Stop(oneshot::Sender<()>),
}

pub(crate) struct SchedulerWorker {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn StateStore>>,
    config: QueueConfig,
    semaphore: Arc<Semaphore>,
    tasks: Vec<TaskEntry>,
    next_attempt: u64,
    run: Option<RunState>,
    /// Options from the latest `start`, merged under each task's own
    run_defaults: UploadOptions,
    /// A status or list change waiting to be saved
    dirty: bool,
    /// Byte counts changed since the last save
    progress_dirty: bool,
    last_flush: Instant,
    idle: bool,

    event_tx: broadcast::Sender<QueueEvent>,
    transfer_tx: mpsc::UnboundedSender<TransferMessage>,
    transfer_rx: mpsc::UnboundedReceiver<TransferMessage>,
}

impl SchedulerWorker {
    pub(crate) async fn run(
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn StateStore>>,
        config: QueueConfig,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        event_tx: broadcast::Sender<QueueEvent>,
    ) {
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let mut worker = Self {
            transport,
            store,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            tasks: Vec::new(),
            next_attempt: 1,
            run: None,
            run_defaults: UploadOptions::default(),
            dirty: false,
            progress_dirty: false,
            last_flush: Instant::now(),
            idle: true,
            event_tx,
            transfer_tx,
            transfer_rx,
        };

        worker.restore_state().await;
        worker.process_queue();
        worker.check_idle();
        worker.flush().await;

        let retention = worker.config.completed_retention();
        let mut retention_tick = tokio::time::interval(
            retention
                .map(|r| (r / 2).max(Duration::from_secs(1)))
                .unwrap_or(Duration::from_secs(3600)),
        );
        retention_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let progress_interval = worker.config.progress_interval();

        let stop_reply = loop {
            let progress_pending = worker.progress_dirty;
            let progress_deadline = worker.last_flush + progress_interval;

            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if let Flow::Stop(reply) = worker.handle_command(command) {
                                break Some(reply);
                            }
                        }
                        None => break None,
                    }
                }
                Some(message) = worker.transfer_rx.recv() => {
                    worker.handle_transfer_message(message);
                    // Take the whole backlog so a burst of chunks costs one flush.
                    while let Ok(message) = worker.transfer_rx.try_recv() {
                        worker.handle_transfer_message(message);
                    }
                }
                _ = retention_tick.tick(), if retention.is_some() => {
                    worker.prune_completed();
                }
                _ = tokio::time::sleep_until(progress_deadline), if progress_pending => {}
            }

            worker.process_queue();
            worker.check_idle();
            worker.flush().await;
        };

        if worker.progress_dirty {
            worker.dirty = true;
        }
        worker.flush().await;
        // Dropping the entries aborts whatever is still in flight.
        worker.tasks.clear();
        tracing::info!("Upload scheduler stopped");

        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
    }

    fn handle_command(&mut self, command: SchedulerCommand) -> Flow {
        match command {
            SchedulerCommand::Enqueue { payloads, options, reply } => {
                let ids = self.enqueue(payloads, options);
                let _ = reply.send(ids);
            }
            SchedulerCommand::Start { options, reply } => {
                self.start(options, reply);
            }
            SchedulerCommand::Pause { id, reply } => {
                let _ = reply.send(self.pause(id));
            }
            SchedulerCommand::PauseAll { reply } => {
                let _ = reply.send(self.pause_all());
            }
            SchedulerCommand::Resume { id, reply } => {
                let _ = reply.send(self.resume(id));
            }
            SchedulerCommand::ResumeAll { reply } => {
                let _ = reply.send(self.resume_all());
            }
            SchedulerCommand::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            SchedulerCommand::Retry { id, reply } => {
                let _ = reply.send(self.retry(id));
            }
            SchedulerCommand::Remove { id, reply } => {
                let _ = reply.send(self.remove(id));
            }
            SchedulerCommand::ClearCompleted { reply } => {
                let _ = reply.send(self.clear_completed());
            }
            SchedulerCommand::ClearAll { reply } => {
                let _ = reply.send(self.clear_all());
            }
            SchedulerCommand::GetTask { id, reply } => {
                let task = self.find(id).map(|index| self.tasks[index].task.clone());
                let _ = reply.send(task);
            }
            SchedulerCommand::GetAllTasks { reply } => {
                let _ = reply.send(self.tasks.iter().map(|e| e.task.clone()).collect());
            }
            SchedulerCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            SchedulerCommand::Shutdown { reply } => {
                return Flow::Stop(reply);
            }
        }

        Flow::Continue
    }

    fn enqueue(&mut self, payloads: Vec<(Payload, u64)>, options: UploadOptions) -> Vec<TaskId> {
        let mut ids = Vec::with_capacity(payloads.len());
        for (payload, total_bytes) in payloads {
            let entry = TaskEntry::new(payload, total_bytes, options.clone());
            tracing::debug!(task_id = %entry.id(), name = %entry.task.source.name, total_bytes, "Task queued");
            ids.push(entry.id());
            self.tasks.push(entry);
        }

        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Enqueued uploads");
            self.dirty = true;
        }
        ids
    }

    fn start(&mut self, options: UploadOptions, reply: oneshot::Sender<QueueStats>) {
        if self.run_active() {
            tracing::debug!("Upload run already in progress");
            let _ = reply.send(self.stats());
            return;
        }

        self.run_defaults = options;
        let mut reset = 0;
        for entry in self.tasks.iter_mut() {
            if entry.status() == TaskStatus::Failed && entry.retry().is_ok() {
                let _ = self.event_tx.send(QueueEvent::StateChanged {
                    id: entry.id(),
                    from: TaskStatus::Failed,
                    to: TaskStatus::Queued,
                });
                reset += 1;
            }
        }
        if reset > 0 {
            self.dirty = true;
        }

        tracing::info!(reset_failed = reset, "Upload run started");
        self.run = Some(RunState { reply });
    }

    /// A run counts only while its caller still waits for the reply.
    fn run_active(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.reply.is_closed())
    }

    fn pause(&mut self, id: TaskId) -> Result<()> {
        let index = self.find(id).ok_or(QueueError::TaskNotFound(id))?;
        if let Some(from) = self.tasks[index].pause() {
            tracing::info!(task_id = %id, uploaded_bytes = self.tasks[index].task.uploaded_bytes, "Upload paused");
            self.changed(id, from, TaskStatus::Paused);
        }
        Ok(())
    }

    fn pause_all(&mut self) -> usize {
        let ids: Vec<_> = self.ids_with_status(TaskStatus::Uploading);
        ids.iter().filter(|id| self.pause(**id).is_ok()).count()
    }

    fn resume(&mut self, id: TaskId) -> Result<()> {
        let index = self.find(id).ok_or(QueueError::TaskNotFound(id))?;
        if let Some(from) = self.tasks[index].resume() {
            tracing::info!(task_id = %id, "Upload resumed, restarting from byte 0");
            self.changed(id, from, TaskStatus::Queued);
        }
        Ok(())
    }

    fn resume_all(&mut self) -> usize {
        let ids: Vec<_> = self.ids_with_status(TaskStatus::Paused);
        ids.iter().filter(|id| self.resume(**id).is_ok()).count()
    }

    fn cancel(&mut self, id: TaskId) -> Result<()> {
        let index = self.find(id).ok_or(QueueError::TaskNotFound(id))?;
        if let Some(from) = self.tasks[index].cancel() {
            tracing::info!(task_id = %id, ?from, "Upload cancelled");
            self.changed(id, from, TaskStatus::Cancelled);
        }
        Ok(())
    }

    fn retry(&mut self, id: TaskId) -> Result<()> {
        let index = self.find(id).ok_or(QueueError::TaskNotFound(id))?;
        let from = self.tasks[index].retry()?;
        tracing::info!(task_id = %id, ?from, "Upload retry requested");
        self.changed(id, from, TaskStatus::Queued);
        Ok(())
    }

    fn remove(&mut self, id: TaskId) -> Result<()> {
        let index = self.find(id).ok_or(QueueError::TaskNotFound(id))?;
        let entry = self.tasks.remove(index);
        tracing::debug!(task_id = %id, status = ?entry.status(), "Task removed");
        self.dirty = true;
        Ok(())
    }

    fn clear_completed(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|entry| entry.status() != TaskStatus::Completed);
        let removed = before - self.tasks.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    fn clear_all(&mut self) -> usize {
        let removed = self.tasks.len();
        self.tasks.clear();
        self.dirty = true;
        tracing::info!(removed, "Upload queue cleared");
        removed
    }

    fn prune_completed(&mut self) {
        let Some(retention) = self.config.completed_retention() else {
            return;
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return;
        };

        let now = Utc::now();
        let before = self.tasks.len();
        self.tasks.retain(|entry| {
            entry.status() != TaskStatus::Completed
                || entry.task.completed_at.is_none_or(|at| now - at < retention)
        });

        let pruned = before - self.tasks.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned completed uploads past retention");
            self.dirty = true;
        }
    }

    /// Admit queued tasks in insertion order while slots are free.
    fn process_queue(&mut self) {
        if !self.config.auto_start && !self.run_active() {
            return;
        }

        while let Some(index) = self.tasks.iter().position(|e| e.status() == TaskStatus::Queued) {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            self.start_transfer(index, permit);
        }
    }

    fn start_transfer(&mut self, index: usize, permit: OwnedSemaphorePermit) {
        let attempt = self.next_attempt;
        self.next_attempt += 1;

        let entry = &mut self.tasks[index];
        let id = entry.id();

        let Some(payload) = entry.payload.clone() else {
            drop(permit);
            let from = entry.fail(PAYLOAD_LOST);
            tracing::warn!(task_id = %id, "Cannot admit task, payload was lost on restart");
            self.changed(id, from, TaskStatus::Failed);
            let _ = self.event_tx.send(QueueEvent::Failed { id, error: PAYLOAD_LOST.to_string() });
            return;
        };

        let request = TransferRequest {
            task_id: id,
            payload,
            total_bytes: entry.task.total_bytes,
            options: entry.task.options.merged_over(&self.run_defaults),
        };
        let reporter = ProgressReporter::new(id, attempt, request.total_bytes, self.transfer_tx.clone());

        let cancellation_token = CancellationToken::new();
        let transport = self.transport.clone();
        let transfer_tx = self.transfer_tx.clone();
        let join_handle = tokio::spawn({
            let cancellation_token = cancellation_token.clone();
            async move {
                let result = tokio::select! {
                    result = transport.transfer(request, reporter) => result,
                    _ = cancellation_token.cancelled() => Err(QueueError::Aborted),
                };
                let _ = transfer_tx.send(TransferMessage::Finished { id, attempt, result });
            }
        });

        let from = entry.begin(ActiveTransfer::new(attempt, cancellation_token, join_handle, permit));
        tracing::info!(task_id = %id, attempt, total_bytes = entry.task.total_bytes, "Upload started");
        self.changed(id, from, TaskStatus::Uploading);
    }

    fn handle_transfer_message(&mut self, message: TransferMessage) {
        match message {
            TransferMessage::Progress { id, attempt, bytes } => {
                if let Some(index) = self.find(id) {
                    let entry = &mut self.tasks[index];
                    if entry.is_current_attempt(attempt) {
                        entry.record_progress(bytes, Instant::now());
                        self.progress_dirty = true;
                    }
                }
            }
            TransferMessage::Finished { id, attempt, result } => {
                let Some(index) = self.find(id) else {
                    return;
                };
                if !self.tasks[index].is_current_attempt(attempt) {
                    tracing::trace!(task_id = %id, attempt, "Ignoring outcome of a stale attempt");
                    return;
                }
                match result {
                    Ok(receipt) => self.finish_success(index, receipt),
                    Err(err) => self.finish_failure(index, err),
                }
            }
        }
    }

    fn finish_success(&mut self, index: usize, receipt: TransferReceipt) {
        let entry = &mut self.tasks[index];
        let id = entry.id();
        let from = entry.complete(receipt.clone());
        tracing::info!(task_id = %id, status_code = receipt.status_code, "Upload completed");
        self.changed(id, from, TaskStatus::Completed);
        let _ = self.event_tx.send(QueueEvent::Completed { id, receipt });
    }

    fn finish_failure(&mut self, index: usize, err: QueueError) {
        let entry = &mut self.tasks[index];
        let id = entry.id();
        let error = err.to_string();
        let from = entry.fail(error.clone());
        if err.is_transport() {
            tracing::warn!(task_id = %id, error = %error, "Upload failed");
        } else {
            tracing::error!(task_id = %id, error = %error, "Upload failed");
        }
        self.changed(id, from, TaskStatus::Failed);
        let _ = self.event_tx.send(QueueEvent::Failed { id, error });
    }

    /// Resolve a pending `start` and announce idleness once nothing is
    /// queued or uploading.
    fn check_idle(&mut self) {
        let stats = self.stats();
        if !stats.is_idle() {
            self.idle = false;
            return;
        }

        if let Some(run) = self.run.take() {
            tracing::info!(
                completed = stats.completed,
                failed = stats.failed,
                cancelled = stats.cancelled,
                "Upload run finished"
            );
            let _ = run.reply.send(stats.clone());
        }

        if !self.idle {
            self.idle = true;
            let _ = self.event_tx.send(QueueEvent::Idle(stats));
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats::from_tasks(self.tasks.iter().map(|e| &e.task))
    }

    fn find(&self, id: TaskId) -> Option<usize> {
        self.tasks.iter().position(|entry| entry.id() == id)
    }

    fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|entry| entry.status() == status)
            .map(|entry| entry.id())
            .collect()
    }

    fn changed(&mut self, id: TaskId, from: TaskStatus, to: TaskStatus) {
        self.dirty = true;
        let _ = self.event_tx.send(QueueEvent::StateChanged { id, from, to });
    }

    /// Publish the task list and save it. Progress alone is flushed at
    /// most once per `progress_interval`.
    async fn flush(&mut self) {
        let progress_due = self.progress_dirty
            && self.last_flush.elapsed() >= self.config.progress_interval();
        if !self.dirty && !progress_due {
            return;
        }
        self.dirty = false;
        self.progress_dirty = false;
        self.last_flush = Instant::now();

        let snapshot: Arc<[_]> = self.tasks.iter().map(|e| e.task.clone()).collect();
        let _ = self.event_tx.send(QueueEvent::TasksChanged(snapshot.clone()));

        if let Some(store) = &self.store {
            if let Err(err) = store.save(&snapshot).await {
                tracing::warn!(error = %err, "Failed to save upload state");
            }
        }
    }

    async fn restore_state(&mut self) {
        let Some(store) = &self.store else {
            return;
        };

        match store.load().await {
            Ok(tasks) => {
                let mut requeued = 0;
                for task in tasks {
                    if task.status == TaskStatus::Uploading {
                        requeued += 1;
                    }
                    self.tasks.push(TaskEntry::restored(task));
                }
                if !self.tasks.is_empty() {
                    tracing::info!(tasks = self.tasks.len(), requeued, "Restored upload state");
                    self.dirty = true;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to restore upload state");
            }
        }
    }
}
