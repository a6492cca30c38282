use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::{QueueError, Result};

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Scheduler settings
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    /// Admit tasks as soon as they are queued. When off, only `start` does.
    pub auto_start: bool,
    pub state_file: Option<PathBuf>,
    pub completed_retention_secs: Option<u64>,
    /// Minimum gap between saves and broadcasts caused only by progress.
    /// Status changes are always saved right away.
    pub progress_interval_ms: u64,
    pub event_capacity: usize,
    pub command_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            auto_start: true,
            state_file: None,
            completed_retention_secs: None,
            progress_interval_ms: 500,
            event_capacity: 256,
            command_buffer: 64,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(QueueError::config("max_concurrent must be at least 1"));
        }
        if self.event_capacity == 0 || self.command_buffer == 0 {
            return Err(QueueError::config("event_capacity and command_buffer must be at least 1"));
        }
        Ok(())
    }

    pub fn completed_retention(&self) -> Option<Duration> {
        self.completed_retention_secs.map(Duration::from_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: Option<u64>,
    /// Append the destination to the endpoint path instead of sending it
    /// as a form field
    pub destination_in_path: bool,
    /// Multipart field name of the file part
    pub file_field: String,
    pub headers: BTreeMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Some(300),
            destination_in_path: false,
            file_field: "file".to_string(),
            headers: BTreeMap::new(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|err| QueueError::config(format!("Can't read {}: {}", path.display(), err)))?;
        config_str.parse()
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.endpoint)
            .map_err(|err| QueueError::config(format!("Invalid endpoint {}: {}", self.endpoint, err)))?;
        self.queue.validate()
    }
}

impl FromStr for Config {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
