//! Download orchestration: strategy selection, bounded concurrency and
//! per-transfer cancellation.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::extractor::ExtractorStrategy;
use super::http::HttpStrategy;
use super::resilience::{RetryConfig, retry_with_backoff};
use super::strategy::FetchStrategy;
use super::types::{
    BatchReport, FetchOptions, FetchOutcome, NoopTransferSink, SourceRef, TransferProgress,
    TransferReporter, TransferSink, TransferState, transfer_id,
};
use crate::config::PipelineConfig;
use crate::media::{MediaDescriptor, ToolRunner};
use crate::utils::filename::{extension_from_url, sanitize_title};
use crate::utils::http_client::build_http_client;
use crate::{Error, Result};

/// Finished transfer snapshots kept by default.
pub const DEFAULT_FINISHED_HISTORY: usize = 256;

/// Internal state for an in-flight transfer.
struct ActiveTransfer {
    source: SourceRef,
    cancel: CancellationToken,
    progress: Arc<Mutex<TransferProgress>>,
}

/// Snapshot of an in-flight transfer.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub transfer_id: String,
    pub source: SourceRef,
    pub progress: TransferProgress,
}

/// Fetches sources to local disk.
///
/// Strategies are consulted in registration order; the HTTP strategy handles
/// anything no other strategy claims. At most `max_concurrent` transfers run
/// at once.
pub struct DownloadOrchestrator {
    strategies: Vec<Arc<dyn FetchStrategy>>,
    fallback: Arc<dyn FetchStrategy>,
    semaphore: Arc<Semaphore>,
    retry: RetryConfig,
    progress_interval: Duration,
    active: Arc<DashMap<String, ActiveTransfer>>,
    /// Oldest first, at most `finished_history` entries.
    finished: Arc<Mutex<VecDeque<(String, TransferProgress)>>>,
    finished_history: usize,
    shutdown: CancellationToken,
}

impl DownloadOrchestrator {
    pub fn new(fallback: Arc<dyn FetchStrategy>, max_concurrent: usize) -> Self {
        Self {
            strategies: Vec::new(),
            fallback,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retry: RetryConfig::default(),
            progress_interval: Duration::from_secs(1),
            active: Arc::new(DashMap::new()),
            finished: Arc::new(Mutex::new(VecDeque::new())),
            finished_history: DEFAULT_FINISHED_HISTORY,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build the standard strategy list: `yt-dlp` for known platforms, then HTTP.
    pub fn from_config(config: &PipelineConfig, runner: Arc<dyn ToolRunner>) -> Result<Self> {
        let client = build_http_client(Duration::from_secs(config.http_timeout_secs))?;
        let extractor =
            ExtractorStrategy::new(runner, &config.tools.ytdlp).with_timeout(config.tool_timeout());

        Ok(
            Self::new(Arc::new(HttpStrategy::new(client)), config.max_concurrent_downloads)
                .with_strategy(Arc::new(extractor))
                .with_retry(config.retry.clone())
                .with_progress_interval(config.progress_interval()),
        )
    }

    /// Append a strategy. Earlier strategies win.
    pub fn with_strategy(mut self, strategy: Arc<dyn FetchStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// How many finished transfers [`progress`](Self::progress) remembers.
    pub fn with_finished_history(mut self, entries: usize) -> Self {
        self.finished_history = entries.max(1);
        self
    }

    /// First strategy that claims `source`, else the fallback.
    pub fn strategy_for(&self, source: &SourceRef) -> Arc<dyn FetchStrategy> {
        self.strategies
            .iter()
            .find(|s| s.supports_source(source))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Best-effort metadata; failures yield an `Episode N` placeholder.
    pub async fn resolve_metadata(
        &self,
        source: &SourceRef,
        cancel: &CancellationToken,
    ) -> MediaDescriptor {
        let strategy = self.strategy_for(source);
        match strategy.probe_metadata(source, cancel).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(
                    source = %source.location,
                    ordinal = source.ordinal,
                    strategy = strategy.name(),
                    error = %e,
                    "Metadata lookup failed, using placeholder"
                );
                MediaDescriptor::placeholder(source.ordinal, Some(&source.location))
            }
        }
    }

    /// Fetch a single source into `destination`.
    pub async fn fetch_one(
        &self,
        source: &SourceRef,
        destination: &Path,
        options: &FetchOptions,
        sink: Arc<dyn TransferSink>,
    ) -> Result<MediaDescriptor> {
        let metadata = self.resolve_metadata(source, &self.shutdown).await;
        let dest = output_path(destination, source, &metadata, options);
        self.run_transfer(source, &dest, metadata, options, sink, &self.semaphore, &self.shutdown)
            .await
    }

    /// Fetch every source concurrently, bounded by `max_concurrent` (or the
    /// configured gate when `None`).
    ///
    /// The report has one outcome per source, in input order. The batch fails
    /// only when nothing could be fetched.
    pub async fn fetch_many(
        &self,
        sources: &[SourceRef],
        destination: &Path,
        max_concurrent: Option<usize>,
        options: &FetchOptions,
        sink: Arc<dyn TransferSink>,
    ) -> Result<BatchReport> {
        self.fetch_many_scoped(sources, destination, max_concurrent, options, sink, &self.shutdown)
            .await
    }

    /// [`fetch_many`](Self::fetch_many) whose transfers also stop when
    /// `scope` is cancelled.
    pub async fn fetch_many_scoped(
        &self,
        sources: &[SourceRef],
        destination: &Path,
        max_concurrent: Option<usize>,
        options: &FetchOptions,
        sink: Arc<dyn TransferSink>,
        scope: &CancellationToken,
    ) -> Result<BatchReport> {
        if sources.is_empty() {
            return Err(Error::validation("no sources to fetch"));
        }

        let gate = match max_concurrent {
            Some(n) => Arc::new(Semaphore::new(n.max(1))),
            None => self.semaphore.clone(),
        };

        info!(count = sources.len(), "Resolving metadata for batch");
        let metadata = join_all(sources.iter().map(|s| self.resolve_metadata(s, scope))).await;

        let transfers = sources.iter().zip(metadata).map(|(source, meta)| {
            let dest = output_path(destination, source, &meta, options);
            let sink = sink.clone();
            let gate = gate.clone();
            async move {
                self.run_transfer(source, &dest, meta, options, sink, &gate, scope)
                    .await
            }
        });
        let results = join_all(transfers).await;
        if scope.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let outcomes: Vec<FetchOutcome> = results
            .into_iter()
            .map(|r| match r {
                Ok(descriptor) => FetchOutcome::Fetched { descriptor },
                Err(e) => FetchOutcome::Failed {
                    error: e.to_string(),
                },
            })
            .collect();
        let report = BatchReport { outcomes };

        let succeeded = report.success_count();
        if succeeded == 0 {
            let first = report
                .failures(sources)
                .into_iter()
                .next()
                .map(|f| f.error)
                .unwrap_or_default();
            error!(count = sources.len(), "Every source in the batch failed");
            return Err(Error::fetch(
                "batch",
                format!("all {} sources failed; first error: {}", sources.len(), first),
            ));
        }

        info!(
            succeeded,
            failed = report.failure_count(),
            "Batch fetch finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_transfer(
        &self,
        source: &SourceRef,
        dest: &Path,
        metadata: MediaDescriptor,
        options: &FetchOptions,
        sink: Arc<dyn TransferSink>,
        gate: &Semaphore,
        scope: &CancellationToken,
    ) -> Result<MediaDescriptor> {
        let id = transfer_id(source, Utc::now());
        let cancel = scope.child_token();
        let reporter = TransferReporter::new(id.clone(), sink, self.progress_interval);
        self.active.insert(
            id.clone(),
            ActiveTransfer {
                source: source.clone(),
                cancel: cancel.clone(),
                progress: reporter.shared_state(),
            },
        );
        reporter.set_state(TransferState::Pending, None);

        let strategy = self.strategy_for(source);
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = async {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|_| Error::Other("download gate closed".to_string()))?;
                reporter.set_state(TransferState::Active, None);
                info!(
                    transfer_id = %id,
                    source = %source.location,
                    strategy = strategy.name(),
                    dest = %dest.display(),
                    "Starting transfer"
                );
                let reporter_ref = &reporter;
                let cancel_ref = &cancel;
                let fetcher = strategy.clone();
                retry_with_backoff(&self.retry, &cancel, &id, move |attempt| {
                    let strategy = fetcher.clone();
                    async move {
                        if attempt > 0 {
                            debug!(transfer_id = reporter_ref.transfer_id(), attempt, "Retrying transfer");
                        }
                        strategy
                            .fetch(source, dest, options, reporter_ref, cancel_ref)
                            .await
                    }
                })
                .await
            } => r,
        };

        let result = match result {
            Ok(fetched) => {
                reporter.set_state(TransferState::Done, None);
                info!(transfer_id = %id, "Transfer finished");
                Ok(merge_descriptors(fetched, metadata, dest))
            }
            Err(e) if e.is_cancelled() => {
                reporter.set_state(TransferState::Cancelled, None);
                info!(transfer_id = %id, "Transfer cancelled");
                Err(e)
            }
            Err(e) => {
                reporter.set_state(TransferState::Failed, Some(e.to_string()));
                error!(transfer_id = %id, source = %source.location, error = %e, "Transfer failed");
                Err(match e {
                    Error::Fetch { .. } => e,
                    other => Error::fetch(&source.location, other.to_string()),
                })
            }
        };

        self.active.remove(&id);
        self.record_finished(id, reporter.snapshot());
        result
    }

    fn record_finished(&self, id: String, snapshot: TransferProgress) {
        let mut finished = self.finished.lock();
        while finished.len() >= self.finished_history {
            finished.pop_front();
        }
        finished.push_back((id, snapshot));
    }

    /// Cancel one transfer. Returns false when the id is unknown or finished.
    pub fn cancel(&self, transfer_id: &str) -> bool {
        match self.active.get(transfer_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight and queued transfer.
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.cancel.cancel();
        }
    }

    pub fn active_transfers(&self) -> Vec<TransferInfo> {
        self.active
            .iter()
            .map(|entry| TransferInfo {
                transfer_id: entry.key().clone(),
                source: entry.source.clone(),
                progress: entry.progress.lock().clone(),
            })
            .collect()
    }

    /// Latest snapshot of an active or recently finished transfer.
    ///
    /// Only the last [`with_finished_history`](Self::with_finished_history)
    /// finished transfers are remembered.
    pub fn progress(&self, transfer_id: &str) -> Option<TransferProgress> {
        if let Some(entry) = self.active.get(transfer_id) {
            return Some(entry.progress.lock().clone());
        }
        self.finished
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == transfer_id)
            .map(|(_, p)| p.clone())
    }

    /// Forget the snapshots of finished transfers.
    pub fn clear_finished(&self) {
        self.finished.lock().clear();
    }

    /// Permits currently free on the shared gate.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Fill in what the fetch did not report from the pre-fetch metadata.
fn merge_descriptors(
    fetched: MediaDescriptor,
    metadata: MediaDescriptor,
    dest: &Path,
) -> MediaDescriptor {
    MediaDescriptor {
        path: fetched.path.or_else(|| Some(dest.to_path_buf())),
        title: fetched.title.or(metadata.title),
        source_url: fetched.source_url.or(metadata.source_url),
        duration_secs: if fetched.duration_secs > 0.0 {
            fetched.duration_secs
        } else {
            metadata.duration_secs
        },
        width: fetched.width.or(metadata.width),
        height: fetched.height.or(metadata.height),
        frame_rate: fetched.frame_rate.or(metadata.frame_rate),
        container: fetched.container.or(metadata.container),
        video_codec: fetched.video_codec.or(metadata.video_codec),
        audio_codec: fetched.audio_codec.or(metadata.audio_codec),
        audio_bitrate: fetched.audio_bitrate.or(metadata.audio_bitrate),
        bitrate: fetched.bitrate.or(metadata.bitrate),
        size_bytes: fetched.size_bytes.or(metadata.size_bytes),
    }
}

/// `<destination>/episode_NNN/NNN_<title>.<ext>`, or `episode_NNN.<ext>`
/// when no usable title is known.
pub fn output_path(
    destination: &Path,
    source: &SourceRef,
    metadata: &MediaDescriptor,
    options: &FetchOptions,
) -> PathBuf {
    let episode_dir = destination.join(format!("episode_{:03}", source.ordinal));

    let stem = metadata
        .title
        .as_deref()
        .map(sanitize_title)
        .filter(|t| !t.is_empty())
        .map(|t| format!("{:03}_{}", source.ordinal, t))
        .unwrap_or_else(|| format!("episode_{:03}", source.ordinal));

    let extension = metadata
        .container
        .as_deref()
        .filter(|c| is_simple_extension(c))
        .map(str::to_string)
        .or_else(|| source.url().and_then(|u| extension_from_url(&u)))
        .or_else(|| options.preferred_extension.clone())
        .unwrap_or_else(|| "mp4".to_string());

    episode_dir.join(format!("{}.{}", stem, extension))
}

fn is_simple_extension(value: &str) -> bool {
    !value.is_empty() && value.len() <= 5 && value.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_output_path_layout() {
        let dest = Path::new("/tmp/run");
        let src = SourceRef::new("https://cdn.example.com/show/ep.webm", 2);
        let titled = MediaDescriptor {
            title: Some("Pilot: Part 1?".into()),
            container: Some("mkv".into()),
            ..Default::default()
        };
        assert_eq!(
            output_path(dest, &src, &titled, &FetchOptions::default()),
            PathBuf::from("/tmp/run/episode_002/002_Pilot Part 1.mkv")
        );

        let untitled = MediaDescriptor::default();
        assert_eq!(
            output_path(dest, &src, &untitled, &FetchOptions::default()),
            PathBuf::from("/tmp/run/episode_002/episode_002.webm")
        );

        let bare = SourceRef::new("https://cdn.example.com/stream", 12);
        assert_eq!(
            output_path(dest, &bare, &untitled, &FetchOptions::default()),
            PathBuf::from("/tmp/run/episode_012/episode_012.mp4")
        );

        let ffprobe_style = MediaDescriptor {
            container: Some("mov,mp4,m4a,3gp,3g2,mj2".into()),
            ..Default::default()
        };
        assert_eq!(
            output_path(dest, &bare, &ffprobe_style, &FetchOptions::default()),
            PathBuf::from("/tmp/run/episode_012/episode_012.mp4")
        );
    }

    struct SlowStrategy {
        started: AtomicUsize,
    }

    #[async_trait]
    impl FetchStrategy for SlowStrategy {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn supports_source(&self, _source: &SourceRef) -> bool {
            true
        }

        async fn probe_metadata(
            &self,
            _source: &SourceRef,
            _cancel: &CancellationToken,
        ) -> Result<MediaDescriptor> {
            Err(Error::fetch("x", "no metadata"))
        }

        async fn fetch(
            &self,
            _source: &SourceRef,
            _dest: &Path,
            _options: &FetchOptions,
            reporter: &TransferReporter,
            cancel: &CancellationToken,
        ) -> Result<MediaDescriptor> {
            self.started.fetch_add(1, Ordering::SeqCst);
            reporter.update(10, None, 1.0, None);
            cancel.cancelled().await;
            Err(Error::Cancelled)
        }
    }

    struct QuickStrategy;

    #[async_trait]
    impl FetchStrategy for QuickStrategy {
        fn name(&self) -> &'static str {
            "quick"
        }

        fn supports_source(&self, _source: &SourceRef) -> bool {
            true
        }

        async fn probe_metadata(
            &self,
            _source: &SourceRef,
            _cancel: &CancellationToken,
        ) -> Result<MediaDescriptor> {
            Ok(MediaDescriptor::default())
        }

        async fn fetch(
            &self,
            _source: &SourceRef,
            dest: &Path,
            _options: &FetchOptions,
            reporter: &TransferReporter,
            _cancel: &CancellationToken,
        ) -> Result<MediaDescriptor> {
            tokio::fs::create_dir_all(dest.parent().unwrap()).await?;
            tokio::fs::write(dest, b"clip").await?;
            reporter.update(4, Some(4), 0.0, None);
            Ok(MediaDescriptor::default())
        }
    }

    #[tokio::test]
    async fn test_finished_history_is_bounded() {
        let orchestrator =
            DownloadOrchestrator::new(Arc::new(QuickStrategy), 2).with_finished_history(2);
        let dir = tempfile::TempDir::new().unwrap();
        let ids = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = ids.clone();
        let sink = move |id: &str, p: &TransferProgress| {
            if p.state == TransferState::Done {
                seen.lock().push(id.to_string());
            }
        };
        let sink: Arc<dyn TransferSink> = Arc::new(sink);

        for ordinal in 1..=3 {
            orchestrator
                .fetch_one(
                    &SourceRef::new(format!("https://cdn.example.com/{}.mp4", ordinal), ordinal),
                    dir.path(),
                    &FetchOptions::default(),
                    sink.clone(),
                )
                .await
                .unwrap();
        }

        let ids = ids.lock().clone();
        assert_eq!(ids.len(), 3);
        assert!(orchestrator.progress(&ids[0]).is_none());
        assert_eq!(orchestrator.progress(&ids[1]).unwrap().state, TransferState::Done);
        assert_eq!(orchestrator.progress(&ids[2]).unwrap().state, TransferState::Done);

        orchestrator.clear_finished();
        assert!(orchestrator.progress(&ids[2]).is_none());
    }

    #[tokio::test]
    async fn test_cancel_releases_slot() {
        let strategy = Arc::new(SlowStrategy {
            started: AtomicUsize::new(0),
        });
        let orchestrator = Arc::new(DownloadOrchestrator::new(strategy.clone(), 1));
        let dir = tempfile::TempDir::new().unwrap();

        let o = orchestrator.clone();
        let dest = dir.path().to_path_buf();
        let handle = tokio::spawn(async move {
            o.fetch_one(
                &SourceRef::new("https://cdn.example.com/a.mp4", 1),
                &dest,
                &FetchOptions::default(),
                Arc::new(NoopTransferSink),
            )
            .await
        });

        let id = loop {
            if let Some(t) = orchestrator.active_transfers().into_iter().next()
                && t.progress.state == TransferState::Active
            {
                break t.transfer_id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(orchestrator.available_slots(), 0);
        assert!(orchestrator.cancel(&id));

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(orchestrator.available_slots(), 1);
        assert_eq!(
            orchestrator.progress(&id).unwrap().state,
            TransferState::Cancelled
        );
        assert!(!orchestrator.cancel(&id));
        assert_eq!(strategy.started.load(Ordering::SeqCst), 1);
    }
}
