//! Transfer types.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::media::MediaDescriptor;

/// A remote or local asset plus its position in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    /// URL or local path.
    pub location: String,
    /// 1-based episode number.
    pub ordinal: u32,
}

impl SourceRef {
    pub fn new(location: impl Into<String>, ordinal: u32) -> Self {
        Self {
            location: location.into(),
            ordinal,
        }
    }

    /// Parsed URL, when the location is a URL with a scheme.
    pub fn url(&self) -> Option<Url> {
        Url::parse(&self.location).ok()
    }

    pub fn is_remote(&self) -> bool {
        self.url()
            .is_some_and(|u| matches!(u.scheme(), "http" | "https"))
    }

    /// Lowercased host without a leading `www.`.
    pub fn host(&self) -> Option<String> {
        let url = self.url()?;
        let host = url.host_str()?.to_ascii_lowercase();
        Some(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}", self.ordinal, self.location)
    }
}

/// Build a transfer id: the first 12 hex chars of `md5("{source}_{ordinal}_{timestamp}")`.
pub fn transfer_id(source: &SourceRef, at: DateTime<Utc>) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!(
        "{}_{}_{}",
        source.location,
        source.ordinal,
        at.timestamp_micros()
    ));
    let digest = hex::encode(hasher.finalize());
    digest[..12].to_string()
}

/// Lifecycle of a single transfer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransferState {
    #[default]
    Pending,
    Active,
    Paused,
    Done,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of one transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    /// Bytes per second.
    pub rate_bps: f64,
    pub eta_secs: Option<f64>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferProgress {
    /// Percentage, only when the total size is known.
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.bytes_transferred as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }
}

/// Receives transfer progress, keyed by transfer id.
///
/// May be called concurrently from several transfer tasks.
pub trait TransferSink: Send + Sync {
    fn on_progress(&self, transfer_id: &str, progress: &TransferProgress);
}

impl<F> TransferSink for F
where
    F: Fn(&str, &TransferProgress) + Send + Sync,
{
    fn on_progress(&self, transfer_id: &str, progress: &TransferProgress) {
        self(transfer_id, progress)
    }
}

/// Discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransferSink;

impl TransferSink for NoopTransferSink {
    fn on_progress(&self, _transfer_id: &str, _progress: &TransferProgress) {}
}

/// Handle strategies use to publish progress for one transfer.
///
/// Every update lands in the shared snapshot; the outer sink only sees one
/// update per interval plus every state change.
#[derive(Clone)]
pub struct TransferReporter {
    transfer_id: String,
    state: Arc<Mutex<TransferProgress>>,
    sink: Arc<dyn TransferSink>,
    interval: Duration,
    last_emit: Arc<Mutex<Option<Instant>>>,
}

impl TransferReporter {
    pub fn new(
        transfer_id: impl Into<String>,
        sink: Arc<dyn TransferSink>,
        interval: Duration,
    ) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            state: Arc::new(Mutex::new(TransferProgress::default())),
            sink,
            interval,
            last_emit: Arc::new(Mutex::new(None)),
        }
    }

    /// A reporter nobody listens to.
    pub fn detached(transfer_id: impl Into<String>) -> Self {
        Self::new(transfer_id, Arc::new(NoopTransferSink), Duration::from_secs(1))
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn snapshot(&self) -> TransferProgress {
        self.state.lock().clone()
    }

    pub(crate) fn shared_state(&self) -> Arc<Mutex<TransferProgress>> {
        self.state.clone()
    }

    /// Record bytes moved so far.
    pub fn update(&self, bytes: u64, total: Option<u64>, rate_bps: f64, eta_secs: Option<f64>) {
        let snapshot = {
            let mut p = self.state.lock();
            if p.state.is_terminal() {
                return;
            }
            if p.state != TransferState::Active {
                p.state = TransferState::Active;
                p.started_at.get_or_insert_with(Utc::now);
            }
            p.bytes_transferred = bytes;
            if total.is_some() {
                p.total_bytes = total;
            }
            p.rate_bps = rate_bps;
            p.eta_secs = eta_secs;
            p.clone()
        };

        let due = {
            let mut last = self.last_emit.lock();
            let due = last.is_none_or(|t| t.elapsed() >= self.interval);
            if due {
                *last = Some(Instant::now());
            }
            due
        };
        if due {
            self.sink.on_progress(&self.transfer_id, &snapshot);
        }
    }

    /// Move to a new state and always notify.
    pub fn set_state(&self, state: TransferState, error: Option<String>) {
        let snapshot = {
            let mut p = self.state.lock();
            if p.state.is_terminal() {
                return;
            }
            p.state = state;
            match state {
                TransferState::Active => {
                    p.started_at.get_or_insert_with(Utc::now);
                }
                s if s.is_terminal() => {
                    p.finished_at = Some(Utc::now());
                    p.rate_bps = 0.0;
                    p.eta_secs = None;
                    if s == TransferState::Done
                        && let Some(total) = p.total_bytes
                    {
                        p.bytes_transferred = p.bytes_transferred.max(total);
                    }
                }
                _ => {}
            }
            if error.is_some() {
                p.error = error;
            }
            p.clone()
        };
        self.sink.on_progress(&self.transfer_id, &snapshot);
    }
}

/// Per-fetch knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Resume a partial file when the server supports it.
    #[serde(default = "default_true")]
    pub resume: bool,
    /// Preferred container extension when metadata does not name one.
    #[serde(default)]
    pub preferred_extension: Option<String>,
    /// Extra HTTP headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

fn default_true() -> bool {
    true
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            resume: true,
            preferred_extension: None,
            headers: Vec::new(),
        }
    }
}

/// A source that could not be fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchFailure {
    /// Position in the input list.
    pub index: usize,
    pub source: SourceRef,
    pub error: String,
}

/// Outcome of one source in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchOutcome {
    Fetched { descriptor: MediaDescriptor },
    Failed { error: String },
}

/// Result of [`fetch_many`](super::DownloadOrchestrator::fetch_many).
///
/// `outcomes` has one entry per input, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub outcomes: Vec<FetchOutcome>,
}

impl BatchReport {
    pub fn successes(&self) -> Vec<(usize, &MediaDescriptor)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| match o {
                FetchOutcome::Fetched { descriptor } => Some((i, descriptor)),
                FetchOutcome::Failed { .. } => None,
            })
            .collect()
    }

    pub fn failures(&self, sources: &[SourceRef]) -> Vec<FetchFailure> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(index, o)| match o {
                FetchOutcome::Failed { error } => Some(FetchFailure {
                    index,
                    source: sources.get(index).cloned().unwrap_or_else(|| SourceRef::new("", 0)),
                    error: error.clone(),
                }),
                FetchOutcome::Fetched { .. } => None,
            })
            .collect()
    }

    /// Local paths of every fetched file, in input order.
    pub fn fetched_paths(&self) -> Vec<PathBuf> {
        self.successes()
            .into_iter()
            .filter_map(|(_, d)| d.path.clone())
            .collect()
    }

    pub fn success_count(&self) -> usize {
        self.successes().len()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_transfer_id_shape() {
        let src = SourceRef::new("https://example.com/a.mp4", 1);
        let at = Utc::now();
        let id = transfer_id(&src, at);
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, transfer_id(&src, at));
        assert_ne!(id, transfer_id(&SourceRef::new("https://example.com/a.mp4", 2), at));
    }

    #[test]
    fn test_source_host() {
        let src = SourceRef::new("https://www.YouTube.com/watch?v=x", 1);
        assert_eq!(src.host().as_deref(), Some("youtube.com"));
        assert!(src.is_remote());
        assert!(!SourceRef::new("/videos/a.mp4", 1).is_remote());
    }

    #[test]
    fn test_percent_needs_total() {
        let mut p = TransferProgress {
            bytes_transferred: 50,
            ..Default::default()
        };
        assert_eq!(p.percent(), None);
        p.total_bytes = Some(200);
        assert_eq!(p.percent(), Some(25.0));
        p.total_bytes = Some(0);
        assert_eq!(p.percent(), None);
    }

    #[test]
    fn test_reporter_throttles_updates_not_state_changes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sink = move |_: &str, _: &TransferProgress| {
            c.fetch_add(1, Ordering::SeqCst);
        };
        let reporter = TransferReporter::new("abc", Arc::new(sink), Duration::from_secs(60));

        for i in 0..10 {
            reporter.update(i * 10, Some(100), 10.0, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        reporter.set_state(TransferState::Done, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let snap = reporter.snapshot();
        assert_eq!(snap.bytes_transferred, 100);
        assert!(snap.finished_at.is_some());

        // Terminal states are sticky.
        reporter.set_state(TransferState::Failed, Some("late".into()));
        assert_eq!(reporter.snapshot().state, TransferState::Done);
    }

    #[test]
    fn test_batch_report_partition() {
        let sources = vec![
            SourceRef::new("a", 1),
            SourceRef::new("b", 2),
            SourceRef::new("c", 3),
        ];
        let report = BatchReport {
            outcomes: vec![
                FetchOutcome::Fetched {
                    descriptor: MediaDescriptor {
                        path: Some("/x/a.mp4".into()),
                        ..Default::default()
                    },
                },
                FetchOutcome::Failed {
                    error: "boom".into(),
                },
                FetchOutcome::Fetched {
                    descriptor: MediaDescriptor::default(),
                },
            ],
        };
        assert_eq!(report.success_count(), 2);
        let failures = report.failures(&sources);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 1);
        assert_eq!(failures[0].source.location, "b");
        assert_eq!(report.fetched_paths(), vec![PathBuf::from("/x/a.mp4")]);
    }
}
