//! Splitting a source into time-bounded segments.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::media::{MediaDescriptor, MediaProbe, ToolInvocation, ToolRunner, require_input};
use crate::utils::fs::{ensure_dir_all, is_non_empty_file, remove_file_quiet};
use crate::{Error, Result};

/// A time-bounded slice of a source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// 0-based position in the source.
    pub index: usize,
    pub path: PathBuf,
    pub start_secs: f64,
    pub duration_secs: f64,
}

impl Segment {
    pub fn file_name(index: usize) -> String {
        format!("segment_{:04}.mp4", index)
    }
}

/// Segments that were cut, plus one warning per dropped slice.
#[derive(Debug, Clone, Default)]
pub struct SegmentReport {
    pub segments: Vec<Segment>,
    pub warnings: Vec<String>,
}

/// Plan `ceil(total / segment)` slices as `(start, duration)` pairs.
///
/// The last slice is shortened to end at `total_secs`.
pub fn plan_segments(total_secs: f64, segment_secs: f64) -> Vec<(f64, f64)> {
    if total_secs <= 0.0 || segment_secs <= 0.0 {
        return Vec::new();
    }
    let count = (total_secs / segment_secs).ceil() as usize;
    (0..count)
        .map(|i| {
            let start = i as f64 * segment_secs;
            (start, segment_secs.min(total_secs - start))
        })
        .collect()
}

/// Cuts sources into stream-copied segments with ffmpeg.
pub struct Segmenter {
    runner: Arc<dyn ToolRunner>,
    probe: Arc<dyn MediaProbe>,
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl Segmenter {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        probe: Arc<dyn MediaProbe>,
        ffmpeg: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            probe,
            ffmpeg: ffmpeg.into(),
            timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<MediaDescriptor> {
        self.probe.probe(path, cancel).await
    }

    pub fn cut_invocation(
        &self,
        input: &Path,
        start_secs: f64,
        duration_secs: f64,
        output: &Path,
    ) -> ToolInvocation {
        ToolInvocation::new(
            &self.ffmpeg,
            vec![
                "-i".to_string(),
                input.to_string_lossy().into_owned(),
                "-ss".to_string(),
                format_secs(start_secs),
                "-t".to_string(),
                format_secs(duration_secs),
                "-c".to_string(),
                "copy".to_string(),
                "-avoid_negative_ts".to_string(),
                "make_zero".to_string(),
                "-y".to_string(),
                output.to_string_lossy().into_owned(),
            ],
        )
        .with_timeout(self.timeout)
    }

    /// Probe `input` and cut it into `segment_secs` slices under `out_dir`.
    pub async fn segment(
        &self,
        input: &Path,
        segment_secs: u64,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<SegmentReport> {
        if segment_secs == 0 {
            return Err(Error::validation("segment duration must be positive"));
        }
        require_input(input)?;

        let descriptor = self.probe.probe(input, cancel).await?;
        self.segment_probed(input, &descriptor, segment_secs, out_dir, cancel)
            .await
    }

    /// Cut an already probed `input` into `segment_secs` slices.
    ///
    /// Slices that fail or come out empty are dropped and named in
    /// [`SegmentReport::warnings`]; the call fails only when none survive.
    pub async fn segment_probed(
        &self,
        input: &Path,
        descriptor: &MediaDescriptor,
        segment_secs: u64,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<SegmentReport> {
        if segment_secs == 0 {
            return Err(Error::validation("segment duration must be positive"));
        }
        if descriptor.duration_secs <= 0.0 {
            return Err(Error::probe(input, "source has no usable duration"));
        }

        let plan = plan_segments(descriptor.duration_secs, segment_secs as f64);
        ensure_dir_all(out_dir).await?;
        info!(
            input = %input.display(),
            duration_secs = descriptor.duration_secs,
            segment_secs,
            planned = plan.len(),
            "Segmenting source"
        );

        let mut segments = Vec::with_capacity(plan.len());
        let mut warnings = Vec::new();
        for (index, (start, duration)) in plan.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let path = out_dir.join(Segment::file_name(index));
            let invocation = self.cut_invocation(input, start, duration, &path);

            match self.runner.run(&invocation, cancel, None).await {
                Ok(output) if output.success() && is_non_empty_file(&path).await => {
                    debug!(segment = index, path = %path.display(), "Created segment");
                    segments.push(Segment {
                        index,
                        path,
                        start_secs: start,
                        duration_secs: duration,
                    });
                }
                Ok(output) => {
                    let reason = if output.success() {
                        "no output written".to_string()
                    } else {
                        output.failure_summary()
                    };
                    warn!(
                        segment = index,
                        reason = %reason,
                        "Segment cut produced no usable file, dropping it"
                    );
                    warnings.push(dropped_range(index, start, duration, &reason));
                    remove_file_quiet(&path).await;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(segment = index, error = %e, "Segment cut failed, dropping it");
                    warnings.push(dropped_range(index, start, duration, &e.to_string()));
                    remove_file_quiet(&path).await;
                }
            }
        }

        if segments.is_empty() {
            return Err(Error::encode(format!(
                "no segments could be cut from {}",
                input.display()
            )));
        }
        info!(
            created = segments.len(),
            planned = plan.len(),
            "Segmentation finished"
        );
        Ok(SegmentReport { segments, warnings })
    }
}

fn dropped_range(index: usize, start: f64, duration: f64, reason: &str) -> String {
    format!(
        "segment {} ({}s-{}s) was not cut: {}",
        index,
        format_secs(start),
        format_secs(start + duration),
        reason
    )
}

/// Delete segment files. Missing files are ignored.
pub async fn cleanup(segments: &[Segment]) {
    for segment in segments {
        remove_file_quiet(&segment.path).await;
    }
    debug!(count = segments.len(), "Removed segment files");
}

fn format_secs(secs: f64) -> String {
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{:.3}", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ToolOutput, RecordSink};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct FixedProbe(f64);

    #[async_trait]
    impl MediaProbe for FixedProbe {
        async fn probe(&self, path: &Path, _cancel: &CancellationToken) -> Result<MediaDescriptor> {
            Ok(MediaDescriptor {
                path: Some(path.to_path_buf()),
                duration_secs: self.0,
                ..Default::default()
            })
        }
    }

    /// Writes the output file unless its index is listed as failing.
    struct FakeCutter {
        fail_indices: Vec<usize>,
        calls: Mutex<Vec<ToolInvocation>>,
    }

    #[async_trait]
    impl ToolRunner for FakeCutter {
        async fn run(
            &self,
            invocation: &ToolInvocation,
            _cancel: &CancellationToken,
            _on_record: Option<RecordSink<'_>>,
        ) -> Result<ToolOutput> {
            self.calls.lock().push(invocation.clone());
            let out = PathBuf::from(invocation.last_arg().unwrap_or_default());
            let index = self.calls.lock().len() - 1;
            if self.fail_indices.contains(&index) {
                return Ok(ToolOutput {
                    exit_code: Some(1),
                    stderr_tail: vec!["Invalid data found".into()],
                    ..Default::default()
                });
            }
            tokio::fs::write(&out, b"segment").await?;
            Ok(ToolOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    fn segmenter(duration: f64, fail_indices: Vec<usize>) -> (Segmenter, Arc<FakeCutter>) {
        let runner = Arc::new(FakeCutter {
            fail_indices,
            calls: Mutex::new(Vec::new()),
        });
        let seg = Segmenter::new(runner.clone(), Arc::new(FixedProbe(duration)), "ffmpeg");
        (seg, runner)
    }

    #[test]
    fn test_plan_segments() {
        assert_eq!(
            plan_segments(125.0, 60.0),
            vec![(0.0, 60.0), (60.0, 60.0), (120.0, 5.0)]
        );
        assert_eq!(plan_segments(120.0, 60.0).len(), 2);
        assert_eq!(plan_segments(0.5, 60.0), vec![(0.0, 0.5)]);
        assert!(plan_segments(0.0, 60.0).is_empty());
    }

    #[tokio::test]
    async fn test_segment_drops_failed_slices() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.mp4");
        tokio::fs::write(&input, b"source").await.unwrap();
        let (seg, runner) = segmenter(125.0, vec![2]);

        let report = seg
            .segment(&input, 60, &dir.path().join("segs"), &CancellationToken::new())
            .await
            .unwrap();
        let segments = &report.segments;

        assert_eq!(runner.calls.lock().len(), 3);
        assert_eq!(segments.len(), 2);
        assert_eq!(report.warnings.len(), 1);
        assert!(
            report.warnings[0].starts_with("segment 2 (120s-125s) was not cut"),
            "{}",
            report.warnings[0]
        );
        assert_eq!(segments[1].index, 1);
        assert_eq!(segments[1].start_secs, 60.0);
        assert!(segments[0].path.ends_with("segment_0000.mp4"));

        let first = runner.calls.lock()[0].clone();
        assert_eq!(first.arg_after("-ss"), Some("0"));
        assert_eq!(first.arg_after("-t"), Some("60"));
        assert_eq!(first.arg_after("-c"), Some("copy"));
        assert_eq!(first.arg_after("-avoid_negative_ts"), Some("make_zero"));
        let last = runner.calls.lock()[2].clone();
        assert_eq!(last.arg_after("-t"), Some("5"));
    }

    #[tokio::test]
    async fn test_segment_with_no_survivors_fails() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.mp4");
        tokio::fs::write(&input, b"source").await.unwrap();
        let (seg, _) = segmenter(30.0, vec![0]);

        let err = seg
            .segment(&input, 60, &dir.path().join("segs"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Encode(_)));
    }

    #[tokio::test]
    async fn test_zero_segment_duration_is_rejected() {
        let (seg, runner) = segmenter(30.0, vec![]);
        let err = seg
            .segment(
                Path::new("/nonexistent.mp4"),
                0,
                Path::new("/tmp"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(runner.calls.lock().is_empty());
    }
}
