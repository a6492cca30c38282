use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use super::errors::Result;
use super::types::{TaskId, TransferReceipt};

/// Messages from running transfers back to the scheduler worker.
#[derive(Debug)]
pub(crate) enum TransferMessage {
    Progress {
        id: TaskId,
        attempt: u64,
        bytes: u64,
    },
    Finished {
        id: TaskId,
        attempt: u64,
        result: Result<TransferReceipt>,
    },
}

/// Handed to a transport so it can report bytes sent for one attempt.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    id: TaskId,
    attempt: u64,
    total_bytes: u64,
    tx: Option<mpsc::UnboundedSender<TransferMessage>>,
}

impl ProgressReporter {
    pub(crate) fn new(
        id: TaskId,
        attempt: u64,
        total_bytes: u64,
        tx: mpsc::UnboundedSender<TransferMessage>,
    ) -> Self {
        Self {
            id,
            attempt,
            total_bytes,
            tx: Some(tx),
        }
    }

    /// A reporter that drops everything.
    pub fn detached(total_bytes: u64) -> Self {
        Self {
            id: TaskId::new(),
            attempt: 0,
            total_bytes,
            tx: None,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Report the cumulative number of bytes transferred so far.
    pub fn report(&self, bytes_transferred: u64) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(TransferMessage::Progress {
                id: self.id,
                attempt: self.attempt,
                bytes: bytes_transferred,
            });
        }
    }
}

/// Average since start: `bytes / elapsed`.
pub fn average_speed(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

pin_project! {
    /// Counts bytes flowing through a body stream and reports the running
    /// total.
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        reporter: ProgressReporter,
        bytes_sent: u64,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, reporter: ProgressReporter) -> Self {
        Self {
            inner,
            reporter,
            bytes_sent: 0,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    *this.bytes_sent += chunk.len() as u64;
                    this.reporter.report(*this.bytes_sent);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use super::*;

    #[test]
    fn test_average_speed() {
        assert_eq!(average_speed(1000, Duration::from_secs(4)), 250.0);
        assert_eq!(average_speed(1000, Duration::ZERO), 0.0);
    }

    #[tokio::test]
    async fn test_progress_stream_reports_running_total() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = TaskId::new();
        let reporter = ProgressReporter::new(id, 3, 10, tx);

        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abcd")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"efghij")),
        ];
        let mut stream = ProgressStream::new(futures::stream::iter(chunks), reporter);
        while let Some(chunk) = stream.next().await {
            chunk.unwrap();
        }
        assert_eq!(stream.bytes_sent(), 10);

        let mut seen = Vec::new();
        while let Ok(message) = rx.try_recv() {
            match message {
                TransferMessage::Progress { id: got, attempt, bytes } => {
                    assert_eq!(got, id);
                    assert_eq!(attempt, 3);
                    seen.push(bytes);
                }
                TransferMessage::Finished { .. } => panic!("unexpected finish"),
            }
        }
        assert_eq!(seen, vec![4, 10]);
    }

    #[test]
    fn test_detached_reporter_is_silent() {
        let reporter = ProgressReporter::detached(5);
        reporter.report(5);
        assert_eq!(reporter.total_bytes(), 5);
    }
}
