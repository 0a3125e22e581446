//! Single-segment encoding.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::segmenter::Segment;
use crate::hardware::{
    Codec, EncodeParameterSet, EncodeRequest, Preset, QualityTarget, RateControl,
};
use crate::media::{
    EncodeProgress, MediaDescriptor, ProgressParser, ToolInvocation, ToolRunner, require_input,
};
use crate::utils::fs::{ensure_parent_dir, is_non_empty_file, remove_file_quiet};
use crate::{Error, Result};

/// Output height preset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum TargetResolution {
    #[serde(rename = "480p")]
    #[strum(serialize = "480p")]
    P480,
    #[serde(rename = "720p")]
    #[strum(serialize = "720p")]
    P720,
    #[serde(rename = "1080p")]
    #[strum(serialize = "1080p")]
    P1080,
    #[serde(rename = "2160p")]
    #[strum(serialize = "2160p", serialize = "4k")]
    P2160,
}

impl TargetResolution {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::P480 => (854, 480),
            Self::P720 => (1280, 720),
            Self::P1080 => (1920, 1080),
            Self::P2160 => (3840, 2160),
        }
    }

    pub fn scale_filter(&self) -> String {
        let (w, h) = self.dimensions();
        format!("scale={}:{}", w, h)
    }

    /// Bitrate scale relative to 1080p.
    pub fn bitrate_multiplier(&self) -> f64 {
        match self {
            Self::P480 => 0.3,
            Self::P720 => 0.6,
            Self::P1080 => 1.0,
            Self::P2160 => 2.5,
        }
    }
}

/// How segments are encoded, independent of the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeSettings {
    pub codec: Codec,
    pub preset: Preset,
    pub target: QualityTarget,
    pub resolution: Option<TargetResolution>,
    pub deinterlace: bool,
    pub denoise: bool,
    /// Extra `-vf` filters appended after the built-in ones.
    pub custom_filters: Vec<String>,
    pub audio_codec: String,
    pub audio_bitrate: String,
    /// Container format passed to `-f`, also the output extension.
    pub container: String,
    pub threads: Option<u32>,
    /// Two-pass encoding for bitrate targets on the software encoder.
    pub two_pass: bool,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            preset: Preset::Medium,
            target: QualityTarget::default(),
            resolution: None,
            deinterlace: false,
            denoise: false,
            custom_filters: Vec::new(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
            container: "mp4".to_string(),
            threads: None,
            two_pass: false,
        }
    }
}

impl EncodeSettings {
    /// Comma-joined `-vf` chain, `None` when no filter applies.
    pub fn filter_chain(&self) -> Option<String> {
        let mut filters = Vec::new();
        if let Some(res) = self.resolution {
            filters.push(res.scale_filter());
        }
        if self.deinterlace {
            filters.push("yadif".to_string());
        }
        if self.denoise {
            filters.push("hqdn3d".to_string());
        }
        filters.extend(self.custom_filters.iter().cloned());

        if filters.is_empty() {
            None
        } else {
            Some(filters.join(","))
        }
    }

    /// The backend-neutral request handed to the negotiator.
    pub fn request(&self) -> EncodeRequest {
        self.request_for(None)
    }

    /// Request for encoding `source`.
    ///
    /// The output size is the target resolution, else the source's own; the
    /// frame rate is the source's when it was probed.
    pub fn request_for(&self, source: Option<&MediaDescriptor>) -> EncodeRequest {
        let mut request = EncodeRequest::new(self.codec)
            .with_preset(self.preset)
            .with_two_pass(self.two_pass);
        request.target = self.target;
        let size = self
            .resolution
            .map(|res| res.dimensions())
            .or_else(|| source.and_then(MediaDescriptor::resolution));
        if let Some((w, h)) = size {
            request = request.with_resolution(w, h);
        }
        if let Some(fps) = source.and_then(|s| s.frame_rate).filter(|f| *f > 0.0) {
            request = request.with_fps(fps);
        }
        if let Some(threads) = self.threads {
            request = request.with_threads(threads);
        }
        request
    }

    pub fn output_name(&self, index: usize) -> String {
        format!("processed_segment_{:04}.{}", index, self.container)
    }
}

/// Receives encode progress.
///
/// Calls may arrive concurrently from several encode tasks.
pub trait EncodeProgressSink: Send + Sync {
    /// A progress block from the encoder working on `segment`.
    fn on_segment_progress(&self, _segment: usize, _progress: &EncodeProgress) {}

    /// `completed` of `total` outputs now exist.
    fn on_segments_done(&self, _completed: usize, _total: usize) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEncodeSink;

impl EncodeProgressSink for NoopEncodeSink {}

/// Encodes one segment with a resolved parameter set.
#[async_trait]
pub trait SegmentEncoder: Send + Sync {
    async fn encode(
        &self,
        segment: &Segment,
        output: &Path,
        params: &EncodeParameterSet,
        settings: &EncodeSettings,
        sink: &dyn EncodeProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

/// ffmpeg-backed [`SegmentEncoder`].
pub struct FfmpegEncoder {
    runner: Arc<dyn ToolRunner>,
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl FfmpegEncoder {
    pub fn new(runner: Arc<dyn ToolRunner>, ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            ffmpeg: ffmpeg.into(),
            timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn video_args(
        &self,
        input: &Path,
        params: &EncodeParameterSet,
        settings: &EncodeSettings,
    ) -> Vec<String> {
        let mut args = params.input_args.clone();
        args.push("-i".to_string());
        args.push(input.to_string_lossy().into_owned());

        if let Some(chain) = settings.filter_chain() {
            args.push("-vf".to_string());
            args.push(chain);
        }

        args.extend(params.output_args.iter().cloned());
        args
    }

    pub fn build_invocation(
        &self,
        input: &Path,
        output: &Path,
        params: &EncodeParameterSet,
        settings: &EncodeSettings,
    ) -> ToolInvocation {
        self.output_invocation(input, output, params, settings, None)
    }

    /// Analysis pass of a two-pass encode. Writes only the pass log.
    pub fn first_pass_invocation(
        &self,
        input: &Path,
        params: &EncodeParameterSet,
        settings: &EncodeSettings,
        pass_log: &Path,
    ) -> ToolInvocation {
        let mut args = self.video_args(input, params, settings);
        args.extend(pass_args(1, pass_log));
        args.extend([
            "-an".to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-y".to_string(),
            NULL_SINK.to_string(),
        ]);
        ToolInvocation::new(&self.ffmpeg, args).with_timeout(self.timeout)
    }

    /// Final encode, as the second pass when `pass_log` is set.
    pub fn output_invocation(
        &self,
        input: &Path,
        output: &Path,
        params: &EncodeParameterSet,
        settings: &EncodeSettings,
        pass_log: Option<&Path>,
    ) -> ToolInvocation {
        let mut args = self.video_args(input, params, settings);
        if let Some(log) = pass_log {
            args.extend(pass_args(2, log));
        }
        args.extend([
            "-c:a".to_string(),
            settings.audio_codec.clone(),
            "-b:a".to_string(),
            settings.audio_bitrate.clone(),
            "-f".to_string(),
            settings.container.clone(),
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-y".to_string(),
            output.to_string_lossy().into_owned(),
        ]);

        ToolInvocation::new(&self.ffmpeg, args).with_timeout(self.timeout)
    }
}

#[async_trait]
impl SegmentEncoder for FfmpegEncoder {
    async fn encode(
        &self,
        segment: &Segment,
        output: &Path,
        params: &EncodeParameterSet,
        settings: &EncodeSettings,
        sink: &dyn EncodeProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        require_input(&segment.path)?;
        ensure_parent_dir(output).await?;

        let pass_log = match params.rate_control {
            RateControl::TwoPass { .. } => Some(pass_log_prefix(output)),
            _ => None,
        };
        if let Some(log) = &pass_log {
            let first = self.first_pass_invocation(&segment.path, params, settings, log);
            debug!(segment = segment.index, command = %first, "Running first pass");
            let outcome = self.runner.run(&first, cancel, None).await;
            let failure = match outcome {
                Ok(out) if out.success() => None,
                Ok(out) => Some(Error::encode(format!(
                    "segment {} first pass failed with {}: {}",
                    segment.index,
                    params.encoder,
                    out.failure_summary()
                ))),
                Err(e) => Some(e),
            };
            if let Some(e) = failure {
                remove_pass_logs(log).await;
                return Err(e);
            }
        }

        let invocation =
            self.output_invocation(&segment.path, output, params, settings, pass_log.as_deref());
        debug!(segment = segment.index, backend = %params.backend, command = %invocation, "Encoding segment");

        let mut parser = ProgressParser::new();
        let index = segment.index;
        let mut on_record = |line: &str| {
            if let Some(progress) = parser.push(line) {
                sink.on_segment_progress(index, &progress);
            }
        };

        let result = self.runner.run(&invocation, cancel, Some(&mut on_record)).await;
        if let Some(log) = &pass_log {
            remove_pass_logs(log).await;
        }
        let output_info = match result {
            Ok(out) => out,
            Err(e) => {
                remove_file_quiet(output).await;
                return Err(e);
            }
        };

        if !output_info.success() {
            remove_file_quiet(output).await;
            return Err(Error::encode(format!(
                "segment {} failed with {}: {}",
                segment.index,
                params.encoder,
                output_info.failure_summary()
            )));
        }
        if !is_non_empty_file(output).await {
            return Err(Error::encode(format!(
                "segment {} produced no output at {}",
                segment.index,
                output.display()
            )));
        }
        Ok(output.to_path_buf())
    }
}

#[cfg(windows)]
const NULL_SINK: &str = "NUL";
#[cfg(not(windows))]
const NULL_SINK: &str = "/dev/null";

fn pass_args(pass: u8, log: &Path) -> [String; 4] {
    [
        "-pass".to_string(),
        pass.to_string(),
        "-passlogfile".to_string(),
        log.to_string_lossy().into_owned(),
    ]
}

/// Pass log prefix next to `output`, unique per output file.
fn pass_log_prefix(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "encode".to_string());
    output.with_file_name(format!("{}.passlog", name))
}

/// Delete every file ffmpeg wrote under the `prefix` pass log name.
async fn remove_pass_logs(prefix: &Path) {
    let (Some(dir), Some(stem)) = (prefix.parent(), prefix.file_name()) else {
        return;
    };
    let stem = stem.to_string_lossy().into_owned();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(&stem) {
            remove_file_quiet(&entry.path()).await;
        }
    }
}
