use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use upload_queue::utils::{format_bytes, format_duration, format_speed};
use upload_queue::{init_tracing, Config, HttpTransport, QueueEvent, UploadOptions, UploadScheduler};

#[derive(Parser)]
#[command(name = "upload-queue", about = "Upload assets through a bounded, persistent queue")]
struct Cli {
    /// Path to the TOML config
    #[arg(long, short, default_value = "config.toml")]
    config: PathBuf,
    /// Target folder or file-request id
    #[arg(long)]
    destination: Option<String>,
    /// Tag attached to every upload, repeatable
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Extra form field as key=value, repeatable
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, String)>,
    /// Files to upload. Without files, only tasks restored from the state file run.
    files: Vec<PathBuf>,
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {raw}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let transport = Arc::new(HttpTransport::from_config(&config)?);
    let handle = UploadScheduler::builder(transport)
        .config(config.queue.clone())
        .spawn()?;
    let scheduler = handle.scheduler.clone();

    let mut events = scheduler.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Completed { id, receipt }) => {
                    tracing::info!(task_id = %id, location = ?receipt.location, "Uploaded");
                }
                Ok(QueueEvent::Failed { id, error }) => {
                    tracing::warn!(task_id = %id, error = %error, "Upload failed");
                }
                Ok(QueueEvent::TasksChanged(tasks)) => {
                    for task in tasks.iter().filter(|t| t.speed > 0.0) {
                        tracing::debug!(
                            name = %task.source.name,
                            progress = %format!("{:.0}%", task.progress() * 100.0),
                            speed = %format_speed(task.speed),
                            eta = %task.eta().map(format_duration).unwrap_or_default(),
                            "Upload progress"
                        );
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut options = UploadOptions {
        destination: cli.destination,
        tags: cli.tags,
        ..UploadOptions::default()
    };
    options.fields.extend(cli.fields);

    if !cli.files.is_empty() {
        let ids = scheduler.enqueue_files(cli.files, options.clone()).await?;
        tracing::info!(count = ids.len(), "Files queued");
    }

    let stats = tokio::select! {
        stats = scheduler.start(options) => stats?,
        _ = tokio::signal::ctrl_c() => {
            let paused = scheduler.pause_all().await?;
            tracing::info!(paused, "Interrupted, uploads paused");
            scheduler.stats().await?
        }
    };

    handle.shutdown().await?;
    reporter.abort();

    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        paused = stats.paused,
        uploaded = %format_bytes(stats.uploaded_bytes),
        total = %format_bytes(stats.total_bytes),
        "Upload run finished"
    );

    if stats.failed > 0 {
        anyhow::bail!("{} upload(s) failed", stats.failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field() {
        assert_eq!(parse_field("editor=7").unwrap(), ("editor".to_string(), "7".to_string()));
        assert_eq!(parse_field("note=a=b").unwrap(), ("note".to_string(), "a=b".to_string()));
        assert!(parse_field("=x").is_err());
        assert!(parse_field("plain").is_err());
    }
}
