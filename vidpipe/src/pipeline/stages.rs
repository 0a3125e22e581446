//! Stage seams and their production adapters.
//!
//! The orchestrator only sees the three traits below. Each adapter wraps one
//! engine and translates its progress into a stage-local percentage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::request::PipelineRequest;
use crate::downloader::{DownloadOrchestrator, FetchOptions, SourceRef, TransferProgress};
use super::status::ProcessingMode;
use crate::media::{EncodeProgress, MediaDescriptor};
use crate::merge::{MergeEngine, MergeResult};
use crate::processing::{
    ContentAnalyzer, EncodeProgressSink, EncodeSettings, ParallelEncoder, Segment,
    SegmentEncoder, Segmenter, cleanup,
};
use crate::utils::fs::{ensure_dir_all, remove_file_quiet};
use crate::{Error, Result};

/// Stage-local progress: a percentage plus free-form details.
pub type StageProgress = Arc<dyn Fn(f64, serde_json::Value) + Send + Sync>;

/// What a stage gets from the orchestrator.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: String,
    pub cancel: CancellationToken,
    /// Scratch directory owned by the run.
    pub work_dir: PathBuf,
    progress: StageProgress,
}

impl StageContext {
    pub fn new(
        run_id: impl Into<String>,
        cancel: CancellationToken,
        work_dir: impl Into<PathBuf>,
        progress: StageProgress,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            cancel,
            work_dir: work_dir.into(),
            progress,
        }
    }

    /// A context that discards progress.
    pub fn detached(run_id: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            run_id,
            CancellationToken::new(),
            work_dir,
            Arc::new(|_, _| {}),
        )
    }

    pub fn report(&self, percent: f64, details: serde_json::Value) {
        (self.progress)(percent.clamp(0.0, 100.0), details);
    }

    pub fn progress(&self) -> StageProgress {
        self.progress.clone()
    }
}

/// Files produced by a stage plus anything worth surfacing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub files: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// One file to process and where its result goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessJob {
    pub input: PathBuf,
    pub output: PathBuf,
}

#[async_trait]
pub trait DownloadStage: Send + Sync {
    /// Fetch every URL into `dest`. Fails only when nothing was fetched.
    async fn download(
        &self,
        ctx: &StageContext,
        urls: &[String],
        dest: &Path,
        request: &PipelineRequest,
    ) -> Result<StageOutput>;
}

#[async_trait]
pub trait ProcessStage: Send + Sync {
    /// Encode every job. Fails only when no job succeeds.
    async fn process(
        &self,
        ctx: &StageContext,
        jobs: &[ProcessJob],
        request: &PipelineRequest,
    ) -> Result<StageOutput>;
}

#[async_trait]
pub trait MergeStage: Send + Sync {
    async fn merge(
        &self,
        ctx: &StageContext,
        inputs: &[PathBuf],
        output: &Path,
        request: &PipelineRequest,
    ) -> Result<MergeResult>;
}

#[async_trait]
impl DownloadStage for DownloadOrchestrator {
    async fn download(
        &self,
        ctx: &StageContext,
        urls: &[String],
        dest: &Path,
        request: &PipelineRequest,
    ) -> Result<StageOutput> {
        let sources: Vec<SourceRef> = urls
            .iter()
            .enumerate()
            .map(|(i, url)| SourceRef::new(url, i as u32 + 1))
            .collect();

        let total = sources.len();
        let per_transfer: Arc<DashMap<String, f64>> = Arc::new(DashMap::new());
        let progress = ctx.progress();
        let sink = move |transfer_id: &str, p: &TransferProgress| {
            let pct = if p.state.is_terminal() {
                100.0
            } else {
                p.percent().unwrap_or(0.0)
            };
            per_transfer.insert(transfer_id.to_string(), pct);
            let sum: f64 = per_transfer.iter().map(|e| *e.value()).sum();
            progress(
                (sum / total as f64).min(100.0),
                json!({
                    "transfer_id": transfer_id,
                    "state": p.state.to_string(),
                    "bytes": p.bytes_transferred,
                    "total_bytes": p.total_bytes,
                }),
            );
        };

        let report = self
            .fetch_many_scoped(
                &sources,
                dest,
                request.max_concurrent_downloads,
                &FetchOptions::default(),
                Arc::new(sink),
                &ctx.cancel,
            )
            .await?;

        let warnings = report
            .failures(&sources)
            .into_iter()
            .map(|f| format!("download of {} failed: {}", f.source.location, f.error))
            .collect();
        Ok(StageOutput {
            files: report.fetched_paths(),
            warnings,
        })
    }
}

#[async_trait]
impl MergeStage for MergeEngine {
    async fn merge(
        &self,
        ctx: &StageContext,
        inputs: &[PathBuf],
        output: &Path,
        request: &PipelineRequest,
    ) -> Result<MergeResult> {
        let progress = ctx.progress();
        let report = move |pct: f64| progress(pct, serde_json::Value::Null);
        self.merge_episodes(
            inputs,
            output,
            request.season_title.as_deref(),
            self.config(),
            &ctx.cancel,
            Some(&report),
        )
        .await
    }
}

/// Maps encoder callbacks into one job's slice of the stage percentage.
#[derive(Clone)]
struct JobProgress {
    progress: StageProgress,
    base: f64,
    span: f64,
    duration_secs: f64,
}

impl JobProgress {
    fn emit(&self, fraction: f64, details: serde_json::Value) {
        (self.progress)(self.base + self.span * fraction.clamp(0.0, 1.0), details);
    }
}

impl EncodeProgressSink for JobProgress {
    fn on_segment_progress(&self, segment: usize, progress: &EncodeProgress) {
        // Duration is only set when the whole file is a single encode.
        if let Some(pct) = progress.percent_of(self.duration_secs) {
            self.emit(
                pct / 100.0 * SEGMENT_SHARE + CUT_SHARE,
                json!({"segment": segment, "speed": progress.speed}),
            );
        }
    }

    fn on_segments_done(&self, completed: usize, total: usize) {
        if total > 0 {
            self.emit(
                CUT_SHARE + SEGMENT_SHARE * completed as f64 / total as f64,
                json!({"segments_done": completed, "segments_total": total}),
            );
        }
    }
}

/// Share of a job spent cutting, encoding and joining.
const CUT_SHARE: f64 = 0.1;
const SEGMENT_SHARE: f64 = 0.8;

/// A processed file and the time ranges or steps it lost on the way.
struct FileOutcome {
    output: PathBuf,
    warnings: Vec<String>,
}

/// Segment, encode in parallel, and join each file.
///
/// Without parallel processing a file is encoded as a single segment.
pub struct SegmentedProcessor {
    segmenter: Segmenter,
    encoder: Arc<dyn SegmentEncoder>,
    parallel: ParallelEncoder,
    merger: MergeEngine,
    analyzer: Option<ContentAnalyzer>,
}

impl SegmentedProcessor {
    pub fn new(
        segmenter: Segmenter,
        encoder: Arc<dyn SegmentEncoder>,
        parallel: ParallelEncoder,
        merger: MergeEngine,
    ) -> Self {
        Self {
            segmenter,
            encoder,
            parallel,
            merger,
            analyzer: None,
        }
    }

    /// Tune compress-only runs to content measured by `analyzer`.
    pub fn with_analyzer(mut self, analyzer: ContentAnalyzer) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Encode settings for one file.
    ///
    /// Compress-only runs with an analyzer are tuned to the file's content;
    /// a failed analysis falls back to the plain profile.
    async fn settings_for(
        &self,
        ctx: &StageContext,
        job: &ProcessJob,
        descriptor: &MediaDescriptor,
        request: &PipelineRequest,
        warnings: &mut Vec<String>,
    ) -> Result<EncodeSettings> {
        let fallback = request.effective_encode();
        let Some(analyzer) = self
            .analyzer
            .as_ref()
            .filter(|_| request.mode == ProcessingMode::CompressOnly)
        else {
            return Ok(fallback);
        };

        match analyzer.analyze(&job.input, descriptor, &ctx.cancel).await {
            Ok(analysis) => {
                let tuned = request.compression_profile.tune(&request.encode, &analysis);
                debug!(
                    input = %job.input.display(),
                    complexity = %analysis.complexity,
                    target = ?tuned.target,
                    two_pass = tuned.two_pass,
                    "Tuned encode settings"
                );
                Ok(tuned)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(input = %job.input.display(), error = %e, "Content analysis failed");
                warnings.push(format!(
                    "content analysis failed, using {} profile defaults: {}",
                    request.compression_profile, e
                ));
                Ok(fallback)
            }
        }
    }

    async fn process_file(
        &self,
        ctx: &StageContext,
        parallel: &ParallelEncoder,
        job: &ProcessJob,
        position: usize,
        request: &PipelineRequest,
        mut sink: JobProgress,
    ) -> Result<FileOutcome> {
        let stem = job
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("input_{}", position));
        let scratch = ctx.work_dir.join(format!("{:03}_{}", position, stem));
        ensure_dir_all(&scratch).await?;
        if let Some(parent) = job.output.parent() {
            ensure_dir_all(parent).await?;
        }

        let descriptor = self.segmenter.probe(&job.input, &ctx.cancel).await?;
        let mut warnings = Vec::new();
        let settings = self
            .settings_for(ctx, job, &descriptor, request, &mut warnings)
            .await?;
        // Negotiated through the configured engine even when parallelism is narrowed.
        let params = self
            .parallel
            .resolve_params_for(&settings, Some(&descriptor))
            .await;
        info!(
            run_id = %ctx.run_id,
            input = %job.input.display(),
            backend = %params.backend,
            encoder = %params.encoder,
            resolution = ?params.resolution,
            fps = ?params.fps,
            "Processing file"
        );

        if !request.parallel_processing {
            sink.duration_secs = descriptor.duration_secs;
            let whole = Segment {
                index: 0,
                path: job.input.clone(),
                start_secs: 0.0,
                duration_secs: descriptor.duration_secs,
            };
            let output = self
                .encoder
                .encode(&whole, &job.output, &params, &settings, &sink, &ctx.cancel)
                .await?;
            sink.emit(1.0, json!({"file": position}));
            return Ok(FileOutcome { output, warnings });
        }

        let cut = self
            .segmenter
            .segment_probed(
                &job.input,
                &descriptor,
                request.segment_duration_secs,
                &scratch.join("segments"),
                &ctx.cancel,
            )
            .await?;
        warnings.extend(cut.warnings);
        let segments = cut.segments;
        sink.emit(CUT_SHARE, json!({"segments": segments.len()}));

        let sink_arc: Arc<dyn EncodeProgressSink> = Arc::new(sink.clone());
        let encoded = parallel
            .encode_parallel(
                &segments,
                &scratch.join("encoded"),
                Some(params),
                &settings,
                sink_arc,
                &ctx.cancel,
            )
            .await;
        if !request.keep_intermediate_files {
            cleanup(&segments).await;
        }
        let encoded = encoded?;
        warnings.extend(encoded.warnings);

        let join_sink = |pct: f64| {
            sink.emit(
                CUT_SHARE + SEGMENT_SHARE + (1.0 - CUT_SHARE - SEGMENT_SHARE) * pct / 100.0,
                serde_json::Value::Null,
            )
        };
        let joined = self
            .merger
            .merge_segments(
                &encoded.outputs,
                &job.output,
                self.merger.config(),
                &ctx.cancel,
                Some(&join_sink),
            )
            .await;
        if !request.keep_intermediate_files {
            for path in &encoded.outputs {
                remove_file_quiet(path).await;
            }
        }
        let joined = joined?;
        debug!(
            output = %joined.output_path.display(),
            method = %joined.method,
            merged = joined.merged_count,
            "Joined encoded segments"
        );
        warnings.extend(joined.warnings);
        sink.emit(1.0, json!({"file": position}));
        Ok(FileOutcome {
            output: joined.output_path,
            warnings,
        })
    }
}

#[async_trait]
impl ProcessStage for SegmentedProcessor {
    async fn process(
        &self,
        ctx: &StageContext,
        jobs: &[ProcessJob],
        request: &PipelineRequest,
    ) -> Result<StageOutput> {
        if jobs.is_empty() {
            return Err(Error::validation("nothing to process"));
        }
        info!(
            run_id = %ctx.run_id,
            files = jobs.len(),
            mode = %request.mode,
            "Processing files"
        );

        // A request may only narrow the configured encode parallelism.
        let narrowed;
        let parallel = if request.max_parallel_segments < self.parallel.max_parallel() {
            narrowed = ParallelEncoder::new(self.encoder.clone(), request.max_parallel_segments);
            &narrowed
        } else {
            &self.parallel
        };

        let span = 100.0 / jobs.len() as f64;
        let mut output = StageOutput::default();
        for (position, job) in jobs.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let sink = JobProgress {
                progress: ctx.progress(),
                base: span * position as f64,
                span,
                duration_secs: 0.0,
            };

            match self
                .process_file(ctx, parallel, job, position, request, sink)
                .await
            {
                Ok(outcome) => {
                    let name = display_name(&job.input);
                    output.files.push(outcome.output);
                    output
                        .warnings
                        .extend(outcome.warnings.into_iter().map(|w| format!("{}: {}", name, w)));
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        run_id = %ctx.run_id,
                        input = %job.input.display(),
                        error = %e,
                        "Processing failed for file"
                    );
                    output
                        .warnings
                        .push(format!("processing of {} failed: {}", job.input.display(), e));
                }
            }
        }

        if output.files.is_empty() {
            return Err(Error::encode(format!(
                "all {} files failed to process",
                jobs.len()
            )));
        }
        if !output.warnings.is_empty() {
            warn!(
                run_id = %ctx.run_id,
                warnings = output.warnings.len(),
                "Processing finished with gaps"
            );
        }
        Ok(output)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
