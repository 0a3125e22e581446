//! Media probing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::command::{ToolInvocation, ToolRunner};
use super::descriptor::MediaDescriptor;
use crate::{Error, Result};

/// Produces a [`MediaDescriptor`] for a local file.
///
/// Probing never retries: a missing tool or unreadable file is reported as
/// [`Error::Probe`] immediately.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Probe `path`; the tool is killed if `cancel` fires.
    async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<MediaDescriptor>;
}

/// `ffprobe` backed prober.
pub struct FfprobeProbe {
    runner: Arc<dyn ToolRunner>,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FfprobeProbe {
    pub fn new(runner: Arc<dyn ToolRunner>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            ffprobe: ffprobe.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build_invocation(&self, path: &Path) -> ToolInvocation {
        ToolInvocation::new(
            &self.ffprobe,
            vec![
                "-v".to_string(),
                "quiet".to_string(),
                "-print_format".to_string(),
                "json".to_string(),
                "-show_format".to_string(),
                "-show_streams".to_string(),
                path.to_string_lossy().into_owned(),
            ],
        )
        .with_timeout(self.timeout)
        .capturing_stdout()
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<MediaDescriptor> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::probe(path, format!("file is not readable: {}", e)))?;
        if !meta.is_file() {
            return Err(Error::probe(path, "not a regular file"));
        }

        let invocation = self.build_invocation(path);
        let output = self
            .runner
            .run(&invocation, cancel, None)
            .await
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                other => Error::probe(path, other.to_string()),
            })?;

        if !output.success() {
            return Err(Error::probe(path, output.failure_summary()));
        }

        let mut descriptor = MediaDescriptor::from_ffprobe_json(path, &output.stdout_text())?;
        if descriptor.size_bytes.is_none() {
            descriptor.size_bytes = Some(meta.len());
        }

        debug!(
            path = %path.display(),
            duration = descriptor.duration_secs,
            codec = ?descriptor.video_codec,
            "Probed media"
        );
        Ok(descriptor)
    }
}
