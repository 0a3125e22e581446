//! Job state sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use super::status::{RunStatus, Stage};

/// Receives run state changes, normally for persistence.
///
/// Calls may arrive concurrently from several tasks and must not block.
pub trait JobStateSink: Send + Sync {
    fn update_status(&self, run_id: &str, status: RunStatus);

    fn update_progress(&self, run_id: &str, stage: Stage, percent: f64, details: &serde_json::Value);

    fn append_error(&self, run_id: &str, message: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl JobStateSink for NoopSink {
    fn update_status(&self, _run_id: &str, _status: RunStatus) {}

    fn update_progress(
        &self,
        _run_id: &str,
        _stage: Stage,
        _percent: f64,
        _details: &serde_json::Value,
    ) {
    }

    fn append_error(&self, _run_id: &str, _message: &str) {}
}

/// A sink call, as forwarded by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Status {
        run_id: String,
        status: RunStatus,
        at: DateTime<Utc>,
    },
    Progress {
        run_id: String,
        stage: Stage,
        percent: f64,
        details: serde_json::Value,
        at: DateTime<Utc>,
    },
    Error {
        run_id: String,
        message: String,
        at: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Status { run_id, .. }
            | Self::Progress { run_id, .. }
            | Self::Error { run_id, .. } => run_id,
        }
    }
}

/// Forwards sink calls through a bounded channel.
///
/// Progress events are dropped when the channel is full. Status and error
/// events are never dropped while the receiver is alive.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<RunEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self { tx }
    }

    /// A sink plus its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RunEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    fn send_reliable(&self, event: RunEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let tx = self.tx.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            let _ = tx.send(event).await;
                        });
                    }
                    Err(_) => trace!("Dropping run event outside a runtime"),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

impl JobStateSink for ChannelSink {
    fn update_status(&self, run_id: &str, status: RunStatus) {
        self.send_reliable(RunEvent::Status {
            run_id: run_id.to_string(),
            status,
            at: Utc::now(),
        });
    }

    fn update_progress(&self, run_id: &str, stage: Stage, percent: f64, details: &serde_json::Value) {
        let _ = self.tx.try_send(RunEvent::Progress {
            run_id: run_id.to_string(),
            stage,
            percent,
            details: details.clone(),
            at: Utc::now(),
        });
    }

    fn append_error(&self, run_id: &str, message: &str) {
        self.send_reliable(RunEvent::Error {
            run_id: run_id.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::channel(8);
        sink.update_status("run-1", RunStatus::Downloading);
        sink.update_progress("run-1", Stage::Download, 12.5, &serde_json::json!({"files": 2}));
        sink.append_error("run-1", "boom");

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, RunEvent::Status { status: RunStatus::Downloading, .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, RunEvent::Progress { percent, .. } if percent == 12.5));
        let third = rx.recv().await.unwrap();
        assert_eq!(third.run_id(), "run-1");
        assert!(matches!(third, RunEvent::Error { ref message, .. } if message == "boom"));
    }

    #[tokio::test]
    async fn test_progress_dropped_when_full_but_status_kept() {
        let (sink, mut rx) = ChannelSink::channel(1);
        sink.update_progress("r", Stage::Process, 1.0, &serde_json::Value::Null);
        sink.update_progress("r", Stage::Process, 2.0, &serde_json::Value::Null);
        sink.update_status("r", RunStatus::Completed);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, RunEvent::Progress { percent, .. } if percent == 1.0));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, RunEvent::Status { status: RunStatus::Completed, .. }));
    }
}
