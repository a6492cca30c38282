mod errors;
mod manager;
mod manager_worker;
pub(crate) mod progress;
mod store;
mod task;
mod traits;
mod types;

pub use errors::{QueueError, Result};
pub use manager::{SchedulerBuilder, SchedulerHandle, UploadScheduler};
pub use progress::{average_speed, ProgressReporter, ProgressStream};
pub use store::{JsonFileStore, MemoryStore};
pub use task::{Payload, CANCELLED_MESSAGE};
pub use traits::{StateStore, TransferRequest, Transport};
pub use types::{
    PayloadSource,
    QueueEvent,
    QueueStats,
    TaskId,
    TaskStatus,
    TransferReceipt,
    UploadOptions,
    UploadTask,
    MAX_INFLIGHT_PROGRESS,
};
