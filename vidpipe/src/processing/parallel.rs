//! Bounded-concurrency encoding of a segment list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::encoder::{EncodeProgressSink, EncodeSettings, SegmentEncoder};
use super::segmenter::Segment;
use crate::hardware::{EncodeBackend, EncodeParameterSet, HardwareNegotiator, SoftwareBackend};
use crate::media::MediaDescriptor;
use crate::utils::fs::{ensure_dir_all, is_non_empty_file};
use crate::{Error, Result};

/// Encoded outputs in segment order, plus one warning per failed segment.
#[derive(Debug, Clone, Default)]
pub struct EncodeReport {
    pub outputs: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Runs a [`SegmentEncoder`] over many segments, at most `max_parallel` at a
/// time.
///
/// The gate is owned by this engine and is independent of the download gate.
pub struct ParallelEncoder {
    encoder: Arc<dyn SegmentEncoder>,
    negotiator: Option<HardwareNegotiator>,
    gate: Arc<Semaphore>,
    max_parallel: usize,
}

impl ParallelEncoder {
    pub fn new(encoder: Arc<dyn SegmentEncoder>, max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            encoder,
            negotiator: None,
            gate: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
        }
    }

    /// Ask `negotiator` for parameters when none are supplied.
    pub fn with_negotiator(mut self, negotiator: HardwareNegotiator) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Parameters for `settings`, from the negotiator when one is attached.
    pub async fn resolve_params(&self, settings: &EncodeSettings) -> EncodeParameterSet {
        self.resolve_params_for(settings, None).await
    }

    /// Like [`resolve_params`](Self::resolve_params), with the source's frame
    /// rate and size filled in from its descriptor.
    pub async fn resolve_params_for(
        &self,
        settings: &EncodeSettings,
        source: Option<&MediaDescriptor>,
    ) -> EncodeParameterSet {
        let request = settings.request_for(source);
        match &self.negotiator {
            Some(negotiator) => negotiator.select_params(&request).await,
            None => SoftwareBackend.build(&request),
        }
    }

    /// Encode a single segment, negotiating parameters if `params` is `None`.
    pub async fn encode_one(
        &self,
        segment: &Segment,
        output: &Path,
        params: Option<&EncodeParameterSet>,
        settings: &EncodeSettings,
        sink: &dyn EncodeProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let resolved;
        let params = match params {
            Some(p) => p,
            None => {
                resolved = self.resolve_params(settings).await;
                &resolved
            }
        };
        self.encoder
            .encode(segment, output, params, settings, sink, cancel)
            .await
    }

    /// Encode every segment into `out_dir`.
    ///
    /// Parameters are resolved once for the whole list so every segment
    /// shares a backend. Failed segments are skipped and named in
    /// [`EncodeReport::warnings`]; the call fails only when all of them fail.
    /// Outputs are ordered by segment index.
    pub async fn encode_parallel(
        &self,
        segments: &[Segment],
        out_dir: &Path,
        params: Option<EncodeParameterSet>,
        settings: &EncodeSettings,
        sink: Arc<dyn EncodeProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<EncodeReport> {
        if segments.is_empty() {
            return Err(Error::encode("no segments to encode"));
        }
        ensure_dir_all(out_dir).await?;

        let params = match params {
            Some(p) => p,
            None => self.resolve_params(settings).await,
        };
        info!(
            segments = segments.len(),
            max_parallel = self.max_parallel,
            backend = %params.backend,
            encoder = %params.encoder,
            "Encoding segments"
        );

        let params = Arc::new(params);
        let settings = Arc::new(settings.clone());
        let outputs: Vec<PathBuf> = segments
            .iter()
            .map(|s| out_dir.join(settings.output_name(s.index)))
            .collect();

        let mut tasks = JoinSet::new();
        for (position, segment) in segments.iter().enumerate() {
            let encoder = self.encoder.clone();
            let gate = self.gate.clone();
            let params = params.clone();
            let settings = settings.clone();
            let sink = sink.clone();
            let cancel = cancel.clone();
            let segment = segment.clone();
            let output = outputs[position].clone();

            tasks.spawn(async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    permit = gate.acquire_owned() => match permit {
                        Ok(_permit) => {
                            encoder
                                .encode(&segment, &output, &params, &settings, sink.as_ref(), &cancel)
                                .await
                        }
                        Err(_) => Err(Error::Other("encode gate closed".to_string())),
                    },
                };
                (position, segment.index, result)
            });
        }

        let mut results: Vec<Option<PathBuf>> = vec![None; segments.len()];
        let mut failures: Vec<(usize, String)> = Vec::new();
        let mut last_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (position, index, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "Encode task panicked");
                    failures.push((usize::MAX, format!("an encode task panicked: {}", e)));
                    continue;
                }
            };
            match result {
                Ok(path) => {
                    debug!(segment = index, path = %path.display(), "Segment encoded");
                    results[position] = Some(path);
                }
                Err(e) if e.is_cancelled() => {
                    tasks.abort_all();
                    return Err(Error::Cancelled);
                }
                Err(e) => {
                    warn!(segment = index, error = %e, "Segment encode failed");
                    let segment = &segments[position];
                    failures.push((
                        segment.index,
                        format!(
                            "segment {} ({:.0}s-{:.0}s) was not encoded: {}",
                            segment.index,
                            segment.start_secs,
                            segment.start_secs + segment.duration_secs,
                            e
                        ),
                    ));
                    last_error = Some(e);
                }
            }

            let mut done = 0;
            for output in &outputs {
                if is_non_empty_file(output).await {
                    done += 1;
                }
            }
            sink.on_segments_done(done, segments.len());
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let encoded: Vec<PathBuf> = results.into_iter().flatten().collect();
        if encoded.is_empty() {
            let cause = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no output produced".to_string());
            return Err(Error::encode(format!(
                "all {} segments failed: {}",
                segments.len(),
                cause
            )));
        }
        if encoded.len() < segments.len() {
            warn!(
                encoded = encoded.len(),
                total = segments.len(),
                "Some segments failed to encode"
            );
        } else {
            info!(encoded = encoded.len(), "All segments encoded");
        }
        failures.sort_by_key(|(index, _)| *index);
        Ok(EncodeReport {
            outputs: encoded,
            warnings: failures.into_iter().map(|(_, w)| w).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::NoopEncodeSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingEncoder {
        current: AtomicUsize,
        peak: AtomicUsize,
        fail_indices: Vec<usize>,
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
            _cancel: &CancellationToken,
        ) -> Result<PathBuf> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if self.fail_indices.contains(&segment.index) {
                return Err(Error::encode("boom"));
            }
            tokio::fs::write(output, b"x").await?;
            Ok(output.to_path_buf())
        }
    }

    fn segments(n: usize) -> Vec<Segment> {
        (0..n)
            .map(|index| Segment {
                index,
                path: PathBuf::from(format!("segment_{:04}.mp4", index)),
                start_secs: index as f64 * 60.0,
                duration_secs: 60.0,
            })
            .collect()
    }

    fn counting(fail_indices: Vec<usize>) -> Arc<CountingEncoder> {
        Arc::new(CountingEncoder {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            fail_indices,
        })
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let encoder = counting(vec![1]);
        let engine = ParallelEncoder::new(encoder.clone(), 2);

        let report = engine
            .encode_parallel(
                &segments(4),
                dir.path(),
                None,
                &EncodeSettings::default(),
                Arc::new(NoopEncodeSink),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.warnings.len(), 1);
        assert!(
            report.warnings[0].starts_with("segment 1 (60s-120s) was not encoded"),
            "{}",
            report.warnings[0]
        );
        let names: Vec<_> = report
            .outputs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "processed_segment_0000.mp4",
                "processed_segment_0002.mp4",
                "processed_segment_0003.mp4"
            ]
        );
        assert!(encoder.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_all_failures_are_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = ParallelEncoder::new(counting(vec![0, 1]), 2);

        let err = engine
            .encode_parallel(
                &segments(2),
                dir.path(),
                None,
                &EncodeSettings::default(),
                Arc::new(NoopEncodeSink),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Encode(ref m) if m.contains("all 2 segments failed")));
    }

    #[tokio::test]
    async fn test_software_params_without_negotiator() {
        let engine = ParallelEncoder::new(counting(vec![]), 1);
        let params = engine.resolve_params(&EncodeSettings::default()).await;
        assert_eq!(params.encoder, "libx264");
    }

    #[tokio::test]
    async fn test_params_follow_source_descriptor() {
        let engine = ParallelEncoder::new(counting(vec![]), 1);
        let source = MediaDescriptor {
            duration_secs: 120.0,
            width: Some(1920),
            height: Some(1080),
            frame_rate: Some(50.0),
            ..Default::default()
        };
        let params = engine
            .resolve_params_for(&EncodeSettings::default(), Some(&source))
            .await;
        assert_eq!(params.resolution, Some((1920, 1080)));
        assert_eq!(params.fps, Some(50.0));

        let blind = engine.resolve_params(&EncodeSettings::default()).await;
        assert_eq!(blind.fps, None);
    }
}
