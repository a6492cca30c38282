#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use upload_queue::{
    ProgressReporter,
    QueueConfig,
    QueueError,
    Result,
    SchedulerHandle,
    TaskId,
    TransferReceipt,
    TransferRequest,
    Transport,
    UploadOptions,
    UploadScheduler,
    UploadTask,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn receipt() -> TransferReceipt {
    TransferReceipt {
        status_code: 201,
        location: None,
        resource: None,
    }
}

/// One attempt held open by `GatedTransport` until the test settles it.
pub struct Attempt {
    pub id: TaskId,
    pub name: String,
    pub total_bytes: u64,
    pub options: UploadOptions,
    pub reporter: ProgressReporter,
    outcome: oneshot::Sender<Result<TransferReceipt>>,
}

impl Attempt {
    pub fn succeed(self) {
        let _ = self.outcome.send(Ok(receipt()));
    }

    pub fn fail(self, status_code: u16) {
        let _ = self.outcome.send(Err(QueueError::server_error(status_code, "Internal Server Error")));
    }

    /// The scheduler dropped this attempt.
    pub fn is_aborted(&self) -> bool {
        self.outcome.is_closed()
    }
}

/// Transport whose attempts are driven by the test.
pub struct GatedTransport {
    started_tx: mpsc::UnboundedSender<Attempt>,
}

impl GatedTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Attempt>) {
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { started_tx }), started_rx)
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn transfer(&self, request: TransferRequest, progress: ProgressReporter) -> Result<TransferReceipt> {
        let (outcome, rx) = oneshot::channel();
        let _ = self.started_tx.send(Attempt {
            id: request.task_id,
            name: request.payload.name(),
            total_bytes: request.total_bytes,
            options: request.options,
            reporter: progress,
            outcome,
        });
        rx.await.unwrap_or(Err(QueueError::Aborted))
    }
}

/// Transport that finishes on its own: reports halfway, then the full size,
/// and fails payloads named in `failing` with a 500.
pub struct ScriptedTransport {
    failing: Mutex<HashSet<String>>,
    fail_once: bool,
    delay: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            failing: Mutex::new(HashSet::new()),
            fail_once: false,
            delay: Duration::from_millis(5),
        })
    }

    pub fn failing(names: &[&str], fail_once: bool) -> Arc<Self> {
        Arc::new(Self {
            failing: Mutex::new(names.iter().map(|n| n.to_string()).collect()),
            fail_once,
            delay: Duration::from_millis(5),
        })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn transfer(&self, request: TransferRequest, progress: ProgressReporter) -> Result<TransferReceipt> {
        progress.report(request.total_bytes / 2);
        sleep(self.delay).await;

        let name = request.payload.name();
        let fail = {
            let mut failing = self.failing.lock().unwrap();
            let hit = failing.contains(&name);
            if hit && self.fail_once {
                failing.remove(&name);
            }
            hit
        };
        if fail {
            return Err(QueueError::server_error(500, "Internal Server Error"));
        }

        progress.report(request.total_bytes);
        Ok(receipt())
    }
}

pub fn config(max_concurrent: usize, auto_start: bool) -> QueueConfig {
    QueueConfig {
        max_concurrent,
        auto_start,
        ..QueueConfig::default()
    }
}

pub fn spawn(transport: Arc<dyn Transport>, config: QueueConfig) -> SchedulerHandle {
    UploadScheduler::builder(transport).config(config).spawn().unwrap()
}

pub async fn next_attempt(rx: &mut mpsc::UnboundedReceiver<Attempt>) -> Attempt {
    timeout(WAIT, rx.recv())
        .await
        .expect("no transfer started in time")
        .expect("transport dropped")
}

/// Poll the task list until `pred` holds.
pub async fn wait_for<F>(scheduler: &UploadScheduler, mut pred: F) -> Vec<UploadTask>
where
    F: FnMut(&[UploadTask]) -> bool,
{
    timeout(WAIT, async {
        loop {
            let tasks = scheduler.tasks().await.unwrap();
            if pred(&tasks) {
                return tasks;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

pub async fn task(scheduler: &UploadScheduler, id: TaskId) -> UploadTask {
    scheduler.task(id).await.unwrap().expect("task exists")
}
