pub mod config;
pub mod core;
pub mod uploaders;
pub mod utils;

pub use config::{Config, HttpConfig, QueueConfig};
pub use crate::core::{
    JsonFileStore,
    MemoryStore,
    Payload,
    ProgressReporter,
    QueueError,
    QueueEvent,
    QueueStats,
    Result,
    SchedulerBuilder,
    SchedulerHandle,
    StateStore,
    TaskId,
    TaskStatus,
    TransferReceipt,
    TransferRequest,
    Transport,
    UploadOptions,
    UploadScheduler,
    UploadTask,
};
pub use uploaders::HttpTransport;

/// Install a `tracing` subscriber honouring `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
