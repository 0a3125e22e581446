//! Platform downloads through `yt-dlp`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::strategy::FetchStrategy;
use super::types::{FetchOptions, SourceRef, TransferReporter};
use crate::media::{MediaDescriptor, ToolInvocation, ToolRunner};
use crate::utils::fs::{ensure_parent_dir, file_size};
use crate::{Error, Result};

/// Hosts the extractor claims.
pub const SUPPORTED_DOMAINS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "vimeo.com",
    "dailymotion.com",
    "twitch.tv",
    "facebook.com",
    "instagram.com",
    "twitter.com",
    "tiktok.com",
    "reddit.com",
    "soundcloud.com",
];

/// Format selector passed to `--format`.
pub const DEFAULT_FORMAT: &str = "best[ext=mp4]/best";

static DOWNLOAD_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[download\]\s+([\d.]+)%\s+of\s+~?\s*([\d.]+)\s*([KMGT]?i?B)(?:\s+at\s+([\d.]+)\s*([KMGT]?i?B)/s)?(?:\s+ETA\s+([\d:]+))?",
    )
    .expect("download line regex is valid")
});

/// Progress parsed from one `[download]` line.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorProgress {
    pub percent: f64,
    pub total_bytes: u64,
    pub rate_bps: f64,
    pub eta_secs: Option<f64>,
}

impl ExtractorProgress {
    pub fn downloaded_bytes(&self) -> u64 {
        (self.total_bytes as f64 * self.percent / 100.0) as u64
    }
}

/// Parse `[download]  42.0% of 10.00MiB at 1.00MiB/s ETA 00:05`.
pub fn parse_download_line(line: &str) -> Option<ExtractorProgress> {
    let caps = DOWNLOAD_LINE_RE.captures(line.trim())?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    let total = scaled_bytes(caps.get(2)?.as_str(), caps.get(3)?.as_str())?;
    let rate = match (caps.get(4), caps.get(5)) {
        (Some(v), Some(u)) => scaled_bytes(v.as_str(), u.as_str()).unwrap_or(0) as f64,
        _ => 0.0,
    };
    let eta = caps.get(6).and_then(|m| parse_clock(m.as_str()));
    Some(ExtractorProgress {
        percent: percent.clamp(0.0, 100.0),
        total_bytes: total,
        rate_bps: rate,
        eta_secs: eta,
    })
}

fn scaled_bytes(value: &str, unit: &str) -> Option<u64> {
    let value: f64 = value.parse().ok()?;
    let multiplier = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

/// `05`, `01:05` or `1:01:05` to seconds.
fn parse_clock(value: &str) -> Option<f64> {
    value
        .split(':')
        .try_fold(0.0, |acc, part| Some(acc * 60.0 + part.parse::<f64>().ok()?))
}

#[derive(Debug, Default, Deserialize)]
struct ExtractorInfo {
    title: Option<String>,
    duration: Option<f64>,
    filesize: Option<u64>,
    filesize_approx: Option<f64>,
    ext: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
}

fn codec_or_none(codec: Option<String>) -> Option<String> {
    codec.filter(|c| !c.is_empty() && c != "none")
}

/// Drives the external `yt-dlp` binary.
pub struct ExtractorStrategy {
    runner: Arc<dyn ToolRunner>,
    program: PathBuf,
    format: String,
    timeout: Duration,
}

impl ExtractorStrategy {
    pub fn new(runner: Arc<dyn ToolRunner>, program: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            program: program.into(),
            format: DEFAULT_FORMAT.to_string(),
            timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn metadata_invocation(&self, url: &str) -> ToolInvocation {
        ToolInvocation::new(
            &self.program,
            vec![
                "--dump-single-json".to_string(),
                "--no-warnings".to_string(),
                "--skip-download".to_string(),
                url.to_string(),
            ],
        )
        .with_timeout(self.timeout.min(Duration::from_secs(120)))
        .capturing_stdout()
    }

    pub fn download_invocation(&self, url: &str, dest: &Path) -> ToolInvocation {
        ToolInvocation::new(
            &self.program,
            vec![
                "--newline".to_string(),
                "--no-warnings".to_string(),
                "--format".to_string(),
                self.format.clone(),
                "-o".to_string(),
                dest.to_string_lossy().into_owned(),
                url.to_string(),
            ],
        )
        .with_timeout(self.timeout)
    }

    /// yt-dlp may pick a different extension than requested.
    async fn locate_output(dest: &Path) -> Option<PathBuf> {
        if file_size(dest).await.is_some() {
            return Some(dest.to_path_buf());
        }
        let parent = dest.parent()?;
        let stem = dest.file_stem()?.to_string_lossy().into_owned();
        let mut entries = tokio::fs::read_dir(parent).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let matches_stem = path
                .file_stem()
                .is_some_and(|s| s.to_string_lossy() == stem);
            let is_partial = path
                .extension()
                .is_some_and(|e| e == "part" || e == "ytdl" || e == "json");
            if matches_stem && !is_partial {
                return Some(path);
            }
        }
        None
    }
}

#[async_trait]
impl FetchStrategy for ExtractorStrategy {
    fn name(&self) -> &'static str {
        "extractor"
    }

    fn supports_source(&self, source: &SourceRef) -> bool {
        let Some(host) = source.host() else {
            return false;
        };
        SUPPORTED_DOMAINS
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
    }

    async fn probe_metadata(
        &self,
        source: &SourceRef,
        cancel: &CancellationToken,
    ) -> Result<MediaDescriptor> {
        let invocation = self.metadata_invocation(&source.location);
        let output = self.runner.run(&invocation, cancel, None).await?;
        if !output.success() {
            return Err(Error::fetch(&source.location, output.failure_summary()));
        }

        let info: ExtractorInfo = serde_json::from_str(&output.stdout_text())?;
        Ok(MediaDescriptor {
            title: info.title,
            source_url: Some(source.location.clone()),
            duration_secs: info.duration.unwrap_or(0.0),
            width: info.width,
            height: info.height,
            frame_rate: info.fps,
            container: info.ext,
            video_codec: codec_or_none(info.vcodec),
            audio_codec: codec_or_none(info.acodec),
            size_bytes: info
                .filesize
                .or(info.filesize_approx.map(|s| s as u64)),
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
        ensure_parent_dir(dest).await?;
        let invocation = self.download_invocation(&source.location, dest);

        let mut on_line = |line: &str| {
            if let Some(p) = parse_download_line(line) {
                reporter.update(p.downloaded_bytes(), Some(p.total_bytes), p.rate_bps, p.eta_secs);
            }
        };
        let output = self
            .runner
            .run(&invocation, cancel, Some(&mut on_line))
            .await?;

        if !output.success() {
            return Err(Error::fetch(&source.location, output.failure_summary()));
        }

        let Some(path) = Self::locate_output(dest).await else {
            return Err(Error::fetch(
                &source.location,
                format!("downloaded file not found at {}", dest.display()),
            ));
        };
        if path != dest {
            warn!(
                transfer_id = reporter.transfer_id(),
                expected = %dest.display(),
                actual = %path.display(),
                "Extractor wrote a different file name"
            );
        }

        let size = file_size(&path).await;
        debug!(transfer_id = reporter.transfer_id(), path = %path.display(), bytes = ?size, "Extractor download finished");
        Ok(MediaDescriptor {
            container: path
                .extension()
                .map(|e| e.to_string_lossy().into_owned()),
            path: Some(path),
            source_url: Some(source.location.clone()),
            size_bytes: size,
            ..Default::default()
        })
    }
}
