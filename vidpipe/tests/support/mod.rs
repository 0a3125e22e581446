//! Fakes shared by the integration tests. None of them spawn real tools.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use vidpipe::downloader::{FetchOptions, FetchStrategy, SourceRef, TransferReporter};
use vidpipe::hardware::EncodeParameterSet;
use vidpipe::media::{MediaDescriptor, MediaProbe, RecordSink, ToolInvocation, ToolOutput, ToolRunner};
use vidpipe::processing::{EncodeProgressSink, EncodeSettings, Segment, SegmentEncoder};
use vidpipe::{Error, Result};

/// Tracks how many callers are inside a section at once.
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Fetches by writing a small file; any location containing `fail` errors.
#[derive(Default)]
pub struct ScriptedStrategy {
    pub gauge: Gauge,
    pub fetches: AtomicUsize,
}

#[async_trait]
impl FetchStrategy for ScriptedStrategy {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports_source(&self, _source: &SourceRef) -> bool {
        true
    }

    async fn probe_metadata(
        &self,
        source: &SourceRef,
        _cancel: &CancellationToken,
    ) -> Result<MediaDescriptor> {
        Ok(MediaDescriptor {
            title: Some(format!("clip {}", source.ordinal)),
            container: Some("mp4".to_string()),
            duration_secs: 10.0,
            ..Default::default()
        })
    }

    async fn fetch(
        &self,
        source: &SourceRef,
        dest: &Path,
        _options: &FetchOptions,
        reporter: &TransferReporter,
        cancel: &CancellationToken,
    ) -> Result<MediaDescriptor> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.gauge.enter();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(40)) => Ok(()),
        };
        self.gauge.leave();
        outcome?;

        if source.location.contains("fail") {
            return Err(Error::fetch(&source.location, "connection reset"));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, b"video bytes").await?;
        reporter.update(11, Some(11), 0.0, None);
        Ok(MediaDescriptor {
            path: Some(dest.to_path_buf()),
            size_bytes: Some(11),
            ..Default::default()
        })
    }
}

/// Answers probes from a table keyed by file name; unknown names use `fallback`.
pub struct TableProbe {
    pub table: HashMap<String, MediaDescriptor>,
    pub fallback: Option<MediaDescriptor>,
}

impl TableProbe {
    pub fn new(entries: &[(&str, MediaDescriptor)]) -> Self {
        Self {
            table: entries
                .iter()
                .map(|(name, d)| (name.to_string(), d.clone()))
                .collect(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, descriptor: MediaDescriptor) -> Self {
        self.fallback = Some(descriptor);
        self
    }
}

#[async_trait]
impl MediaProbe for TableProbe {
    async fn probe(&self, path: &Path, _cancel: &CancellationToken) -> Result<MediaDescriptor> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.table
            .get(&name)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| Error::probe(path, "not in table"))
    }
}

/// Pretends to be ffmpeg: writes the last argument as the output file.
#[derive(Default)]
pub struct FakeFfmpeg {
    pub calls: Mutex<Vec<ToolInvocation>>,
    /// Invocations whose `-ss` argument equals one of these exit non-zero.
    pub failing_starts: Vec<String>,
}

#[async_trait]
impl ToolRunner for FakeFfmpeg {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        _cancel: &CancellationToken,
        _on_record: Option<RecordSink<'_>>,
    ) -> Result<ToolOutput> {
        self.calls.lock().push(invocation.clone());
        if let Some(start) = invocation.arg_after("-ss")
            && self.failing_starts.iter().any(|s| s == start)
        {
            return Ok(ToolOutput {
                exit_code: Some(1),
                stderr_tail: vec!["Invalid data found when processing input".to_string()],
                ..Default::default()
            });
        }
        let out = PathBuf::from(invocation.last_arg().unwrap_or_default());
        tokio::fs::write(&out, b"media").await?;
        Ok(ToolOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }
}

/// Encoder that sleeps, counts concurrency and fails chosen segment indices.
#[derive(Default)]
pub struct CountingEncoder {
    pub gauge: Gauge,
    pub failing: Vec<usize>,
    pub encoded: Mutex<Vec<usize>>,
}

#[async_trait]
impl SegmentEncoder for CountingEncoder {
    async fn encode(
        &self,
        segment: &Segment,
        output: &Path,
        _params: &EncodeParameterSet,
        _settings: &EncodeSettings,
        _sink: &dyn EncodeProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.gauge.enter();
        let slept = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(30)) => Ok(()),
        };
        self.gauge.leave();
        slept?;

        if self.failing.contains(&segment.index) {
            return Err(Error::encode(format!("segment {} failed", segment.index)));
        }
        tokio::fs::write(output, b"encoded").await?;
        self.encoded.lock().push(segment.index);
        Ok(output.to_path_buf())
    }
}

pub fn clip(width: u32, height: u32, duration: f64) -> MediaDescriptor {
    MediaDescriptor {
        duration_secs: duration,
        width: Some(width),
        height: Some(height),
        frame_rate: Some(30.0),
        video_codec: Some("h264".to_string()),
        audio_codec: Some("aac".to_string()),
        bitrate: Some(2_000_000),
        ..Default::default()
    }
}

pub fn arc_probe(probe: TableProbe) -> Arc<dyn MediaProbe> {
    Arc::new(probe)
}
