//! Run sequencing, progress aggregation and cancellation.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::progress::{ProgressTracker, StageWeights};
use super::request::PipelineRequest;
use super::run::{PipelineRun, RunReport};
use super::sink::{JobStateSink, NoopSink};
use super::stages::{
    DownloadStage, MergeStage, ProcessJob, ProcessStage, SegmentedProcessor, StageContext,
    StageProgress,
};
use super::status::{ProcessingMode, RunStatus, Stage};
use crate::config::PipelineConfig;
use crate::downloader::DownloadOrchestrator;
use crate::hardware::{CapabilityCache, HardwareNegotiator};
use crate::media::{FfprobeProbe, MediaProbe, ProcessRunner, ToolRunner};
use crate::merge::{MergeEngine, MergeResult};
use crate::processing::{
    ContentAnalyzer, FfmpegEncoder, ParallelEncoder, SegmentEncoder, Segmenter,
};
use crate::utils::fs::{ensure_dir_all, file_size, remove_file_quiet};
use crate::{Error, Result};

/// Finished runs kept in the registry by default.
pub const DEFAULT_RUN_HISTORY: usize = 256;

struct RunEntry {
    seq: u64,
    state: Arc<Mutex<PipelineRun>>,
    cancel: CancellationToken,
    report: watch::Sender<Option<RunReport>>,
}

struct Inner {
    downloader: Arc<dyn DownloadStage>,
    processor: Arc<dyn ProcessStage>,
    merger: Arc<dyn MergeStage>,
    sink: Arc<dyn JobStateSink>,
    weights: StageWeights,
    temp_dir: PathBuf,
    output_dir: PathBuf,
    runs: DashMap<String, RunEntry>,
    next_seq: AtomicU64,
    run_history: AtomicUsize,
    shutdown: CancellationToken,
}

/// Drives runs through their stages and keeps a registry of them.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

impl PipelineOrchestrator {
    pub fn new(
        downloader: Arc<dyn DownloadStage>,
        processor: Arc<dyn ProcessStage>,
        merger: Arc<dyn MergeStage>,
        config: &PipelineConfig,
    ) -> Self {
        Self::build(
            downloader,
            processor,
            merger,
            Arc::new(NoopSink),
            config.stage_weights,
            config.temp_dir.clone(),
            config.output_dir.clone(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        downloader: Arc<dyn DownloadStage>,
        processor: Arc<dyn ProcessStage>,
        merger: Arc<dyn MergeStage>,
        sink: Arc<dyn JobStateSink>,
        weights: StageWeights,
        temp_dir: PathBuf,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                downloader,
                processor,
                merger,
                sink,
                weights,
                temp_dir,
                output_dir,
                runs: DashMap::new(),
                next_seq: AtomicU64::new(0),
                run_history: AtomicUsize::new(DEFAULT_RUN_HISTORY),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Wire the production engines from configuration.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let runner: Arc<dyn ToolRunner> = Arc::new(ProcessRunner::new());
        let probe: Arc<dyn MediaProbe> = Arc::new(
            FfprobeProbe::new(runner.clone(), &config.tools.ffprobe)
                .with_timeout(config.probe_timeout()),
        );

        let downloader = DownloadOrchestrator::from_config(config, runner.clone())?;
        let segmenter = Segmenter::new(runner.clone(), probe.clone(), &config.tools.ffmpeg)
            .with_timeout(config.tool_timeout());
        let encoder: Arc<dyn SegmentEncoder> = Arc::new(
            FfmpegEncoder::new(runner.clone(), &config.tools.ffmpeg)
                .with_timeout(config.tool_timeout()),
        );
        let negotiator = HardwareNegotiator::new(CapabilityCache::global(&config.tools))
            .with_hardware(config.use_hardware_accel);
        let parallel = ParallelEncoder::new(encoder.clone(), config.max_parallel_segments)
            .with_negotiator(negotiator);
        let merger = MergeEngine::new(runner.clone(), probe.clone(), &config.tools.ffmpeg)
            .with_config(config.merge_config());
        let analyzer = ContentAnalyzer::new(runner.clone(), &config.tools.ffmpeg)
            .with_timeout(config.probe_timeout());
        let processor = SegmentedProcessor::new(
            segmenter,
            encoder,
            parallel,
            MergeEngine::new(runner, probe, &config.tools.ffmpeg)
                .with_config(config.merge_config()),
        )
        .with_analyzer(analyzer);

        Ok(Self::new(
            Arc::new(downloader),
            Arc::new(processor),
            Arc::new(merger),
            config,
        ))
    }

    /// Replace the job state sink. The result starts with an empty registry.
    pub fn with_sink(self, sink: Arc<dyn JobStateSink>) -> Self {
        let inner = &self.inner;
        let rebuilt = Self::build(
            inner.downloader.clone(),
            inner.processor.clone(),
            inner.merger.clone(),
            sink,
            inner.weights,
            inner.temp_dir.clone(),
            inner.output_dir.clone(),
        );
        rebuilt.with_run_history(inner.run_history.load(Ordering::Relaxed))
    }

    /// Number of finished runs kept for `status` and `wait`. Older finished
    /// runs are dropped as new ones finish; live runs are never dropped.
    pub fn with_run_history(self, runs: usize) -> Self {
        self.inner.run_history.store(runs.max(1), Ordering::Relaxed);
        self
    }

    /// Validate and start a run in the background. Returns its id.
    pub fn submit(&self, request: PipelineRequest) -> Result<String> {
        let (run_id, state, cancel, report) = self.register(&request)?;
        let inner = self.inner.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            let outcome = inner.execute(&id, request, state, cancel).await;
            report.send_replace(Some(outcome));
            inner.prune_finished();
        });
        Ok(run_id)
    }

    /// Validate and drive a run to completion on the current task.
    pub async fn run(&self, request: PipelineRequest) -> Result<RunReport> {
        let (run_id, state, cancel, report) = self.register(&request)?;
        let outcome = self.inner.execute(&run_id, request, state, cancel).await;
        report.send_replace(Some(outcome.clone()));
        self.inner.prune_finished();
        Ok(outcome)
    }

    #[allow(clippy::type_complexity)]
    fn register(
        &self,
        request: &PipelineRequest,
    ) -> Result<(
        String,
        Arc<Mutex<PipelineRun>>,
        CancellationToken,
        watch::Sender<Option<RunReport>>,
    )> {
        request.validate()?;
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let state = Arc::new(Mutex::new(PipelineRun::new(
            &run_id,
            request.mode,
            request.stages(),
        )));
        let cancel = self.inner.shutdown.child_token();
        let (report, _) = watch::channel(None);
        self.inner.runs.insert(
            run_id.clone(),
            RunEntry {
                seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
                state: state.clone(),
                cancel: cancel.clone(),
                report: report.clone(),
            },
        );
        self.inner.sink.update_status(&run_id, RunStatus::Pending);
        info!(run_id = %run_id, mode = %request.mode, "Run registered");
        Ok((run_id, state, cancel, report))
    }

    pub fn status(&self, run_id: &str) -> Option<PipelineRun> {
        self.inner
            .runs
            .get(run_id)
            .map(|entry| entry.state.lock().clone())
    }

    /// Cancel a run. Returns false when it is unknown or already terminal.
    pub fn cancel(&self, run_id: &str) -> bool {
        let Some(entry) = self.inner.runs.get(run_id) else {
            return false;
        };
        let moved = self
            .inner
            .transition(run_id, &entry.state, RunStatus::Cancelled);
        if moved {
            entry.cancel.cancel();
            info!(run_id, "Run cancelled");
        }
        moved
    }

    /// Cancel every registered run.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.inner.runs.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id);
        }
        self.inner.shutdown.cancel();
    }

    /// Snapshots of every run that has not reached a terminal state.
    pub fn active_runs(&self) -> Vec<PipelineRun> {
        self.inner
            .runs
            .iter()
            .map(|entry| entry.state.lock().clone())
            .filter(|run| !run.status.is_terminal())
            .collect()
    }

    /// Wait for a run's report. Safe to call repeatedly and concurrently.
    ///
    /// Fails for runs that have been dropped from the history.
    pub async fn wait(&self, run_id: &str) -> Result<RunReport> {
        let mut rx = self
            .inner
            .runs
            .get(run_id)
            .map(|entry| entry.report.subscribe())
            .ok_or_else(|| Error::validation(format!("unknown run '{}'", run_id)))?;
        let report = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Other(format!("run '{}' was dropped before finishing", run_id)))?
            .clone();
        report.ok_or_else(|| Error::Other(format!("run '{}' has no report", run_id)))
    }

    /// Drop runs that have produced their report.
    pub fn clear_finished(&self) {
        self.inner
            .runs
            .retain(|_, entry| entry.report.borrow().is_none());
    }
}

impl Inner {
    /// Drop the oldest finished runs beyond the history limit.
    fn prune_finished(&self) {
        let keep = self.run_history.load(Ordering::Relaxed);
        let mut finished: Vec<(u64, String)> = self
            .runs
            .iter()
            .filter(|entry| entry.report.borrow().is_some())
            .map(|entry| (entry.seq, entry.key().clone()))
            .collect();
        if finished.len() <= keep {
            return;
        }
        finished.sort_unstable();
        let excess = finished.len() - keep;
        for (_, run_id) in finished.into_iter().take(excess) {
            self.runs.remove(&run_id);
            debug!(run_id = %run_id, "Dropped finished run from history");
        }
    }

    /// Apply a legal status change and notify the sink.
    fn transition(&self, run_id: &str, state: &Mutex<PipelineRun>, next: RunStatus) -> bool {
        {
            let mut run = state.lock();
            if !run.status.can_transition_to(next) {
                debug!(run_id, from = %run.status, to = %next, "Ignoring status change");
                return false;
            }
            run.status = next;
            let now = Utc::now();
            match next {
                RunStatus::Initializing => run.started_at = Some(now),
                s if s.is_terminal() => run.completed_at = Some(now),
                _ => {}
            }
        }
        self.sink.update_status(run_id, next);
        true
    }

    fn record_error(&self, run_id: &str, state: &Mutex<PipelineRun>, message: String) {
        self.sink.append_error(run_id, &message);
        state.lock().errors.push(message);
    }

    fn record_warnings(&self, state: &Mutex<PipelineRun>, warnings: Vec<String>) {
        if !warnings.is_empty() {
            state.lock().warnings.extend(warnings);
        }
    }

    fn stage_progress(
        &self,
        run_id: &str,
        stage: Stage,
        tracker: &Arc<Mutex<ProgressTracker>>,
        state: &Arc<Mutex<PipelineRun>>,
    ) -> StageProgress {
        let sink = self.sink.clone();
        let tracker = tracker.clone();
        let state = state.clone();
        let run_id = run_id.to_string();
        Arc::new(move |percent: f64, details: serde_json::Value| {
            let overall = tracker.lock().update(stage, percent);
            {
                let mut run = state.lock();
                run.set_stage_percent(stage, percent);
                run.overall_percent = overall;
            }
            let details = json!({"overall": overall, "details": details});
            sink.update_progress(&run_id, stage, percent, &details);
        })
    }

    async fn execute(
        &self,
        run_id: &str,
        request: PipelineRequest,
        state: Arc<Mutex<PipelineRun>>,
        cancel: CancellationToken,
    ) -> RunReport {
        let work_dir = self.temp_dir.join(format!("run_{}", run_id));
        let output_dir = request
            .output_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.clone());
        let stages = request.stages();
        let tracker = Arc::new(Mutex::new(ProgressTracker::new(&stages, &self.weights)));

        self.transition(run_id, &state, RunStatus::Initializing);
        info!(
            run_id,
            mode = %request.mode,
            stages = ?stages,
            "Run started"
        );

        let mut artifacts = RunArtifacts::default();
        let result = self
            .run_stages(
                run_id,
                &request,
                &stages,
                &work_dir,
                &output_dir,
                &tracker,
                &state,
                &cancel,
                &mut artifacts,
            )
            .await;

        match result {
            Ok(()) => {
                if self.transition(run_id, &state, RunStatus::Completed) {
                    state.lock().overall_percent = 100.0;
                    info!(run_id, outputs = artifacts.outputs.len(), "Run completed");
                }
            }
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                self.transition(run_id, &state, RunStatus::Cancelled);
                info!(run_id, "Run stopped after cancellation");
            }
            Err(e) => {
                error!(run_id, error = %e, "Run failed");
                self.record_error(run_id, &state, e.to_string());
                self.transition(run_id, &state, RunStatus::Failed);
            }
        }

        if !request.keep_intermediate_files {
            remove_dir_quiet(&work_dir).await;
        }

        let mut total_output_bytes = 0;
        for path in &artifacts.outputs {
            total_output_bytes += file_size(path).await.unwrap_or(0);
        }

        let run = state.lock().clone();
        RunReport {
            run_id: run_id.to_string(),
            status: run.status,
            output_files: artifacts.outputs,
            merge_result: artifacts.merge_result,
            warnings: run.warnings,
            errors: run.errors,
            started_at: run.started_at,
            completed_at: run.completed_at,
            total_input_bytes: artifacts.input_bytes,
            total_output_bytes,
            compression_ratio: RunReport::compression_ratio(
                artifacts.input_bytes,
                total_output_bytes,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stages(
        &self,
        run_id: &str,
        request: &PipelineRequest,
        stages: &[Stage],
        work_dir: &Path,
        output_dir: &Path,
        tracker: &Arc<Mutex<ProgressTracker>>,
        state: &Arc<Mutex<PipelineRun>>,
        cancel: &CancellationToken,
        artifacts: &mut RunArtifacts,
    ) -> Result<()> {
        ensure_dir_all(work_dir).await?;
        ensure_dir_all(output_dir).await?;

        let merging = stages.contains(&Stage::Merge);
        let mut files: Vec<PathBuf> = request.input_files.clone();

        for &stage in stages {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if stage == Stage::Merge
                && request.mode == ProcessingMode::FullPipeline
                && files.len() <= 1
            {
                info!(run_id, files = files.len(), "Nothing to merge, skipping merge");
                self.finish_stage(stage, tracker, state);
                continue;
            }

            if !self.transition(run_id, state, stage.status()) {
                return Err(Error::Cancelled);
            }
            let overall = tracker.lock().start(stage);
            {
                let mut run = state.lock();
                run.current_stage = Some(stage);
                run.overall_percent = overall;
            }
            let ctx = StageContext::new(
                run_id,
                cancel.clone(),
                work_dir.join(stage.to_string()),
                self.stage_progress(run_id, stage, tracker, state),
            );

            match stage {
                Stage::Download => {
                    let dest = if stages.len() == 1 {
                        output_dir.to_path_buf()
                    } else {
                        work_dir.join("downloads")
                    };
                    let out = guarded(
                        cancel,
                        self.downloader.download(&ctx, &request.urls, &dest, request),
                    )
                    .await
                    .map_err(|e| stage_error(stage, e))?;
                    self.record_warnings(state, out.warnings);
                    files.extend(out.files);
                    if stages.len() == 1 {
                        artifacts.outputs = files.clone();
                    }
                }
                Stage::Process => {
                    artifacts.input_bytes = total_size(&files).await;
                    let jobs = process_jobs(&files, output_dir, merging);
                    let out = guarded(cancel, self.processor.process(&ctx, &jobs, request))
                        .await
                        .map_err(|e| stage_error(stage, e))?;
                    self.record_warnings(state, out.warnings);
                    files = out.files;
                    artifacts.outputs = files.clone();
                }
                Stage::Merge => {
                    if files.is_empty() {
                        return Err(stage_error(stage, Error::merge("no files to merge")));
                    }
                    if !stages.contains(&Stage::Process) {
                        artifacts.input_bytes = total_size(&files).await;
                    }
                    let output = output_dir.join(merged_name(run_id, request));
                    let result = guarded(
                        cancel,
                        self.merger.merge(&ctx, &files, &output, request),
                    )
                    .await
                    .map_err(|e| stage_error(stage, e))?;
                    self.record_warnings(state, result.warnings.clone());

                    // Episodes produced by this run are intermediates once merged.
                    if stages.contains(&Stage::Process) && !request.keep_intermediate_files {
                        for path in &files {
                            if *path != result.output_path {
                                remove_file_quiet(path).await;
                            }
                        }
                    }
                    files = vec![result.output_path.clone()];
                    artifacts.outputs = files.clone();
                    artifacts.merge_result = Some(result);
                }
            }

            self.finish_stage(stage, tracker, state);
            debug!(run_id, stage = %stage, "Stage finished");
        }
        Ok(())
    }

    fn finish_stage(
        &self,
        stage: Stage,
        tracker: &Mutex<ProgressTracker>,
        state: &Mutex<PipelineRun>,
    ) {
        let overall = tracker.lock().complete(stage);
        let mut run = state.lock();
        run.set_stage_percent(stage, 100.0);
        run.overall_percent = overall;
    }
}

#[derive(Default)]
struct RunArtifacts {
    outputs: Vec<PathBuf>,
    merge_result: Option<MergeResult>,
    input_bytes: u64,
}

/// Race a stage against the run's token so a stage that ignores it still stops.
async fn guarded<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        r = fut => r,
    }
}

fn stage_error(stage: Stage, e: Error) -> Error {
    match e {
        Error::Cancelled => e,
        other => Error::pipeline(stage.to_string(), other),
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string())
}

/// `processed_{stem}.mp4`, or `episode_{NNN}_{stem}.mp4` when a merge follows.
///
/// Inputs sharing a stem get `processed_{stem}_{n}.mp4` from the second one on.
pub fn process_jobs(inputs: &[PathBuf], output_dir: &Path, merging: bool) -> Vec<ProcessJob> {
    let mut taken = HashSet::new();
    inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            let stem = stem_of(input);
            let name = if merging {
                format!("episode_{:03}_{}.mp4", i + 1, stem)
            } else {
                let mut name = format!("processed_{}.mp4", stem);
                let mut n = 2;
                while taken.contains(&name) {
                    name = format!("processed_{}_{}.mp4", stem, n);
                    n += 1;
                }
                name
            };
            taken.insert(name.clone());
            ProcessJob {
                input: input.clone(),
                output: output_dir.join(name),
            }
        })
        .collect()
}

/// Configured name, else `merged_season_{run_id}.mp4`.
pub fn merged_name(run_id: &str, request: &PipelineRequest) -> String {
    match request.output_filename.as_deref() {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => format!("merged_season_{}.mp4", run_id),
    }
}

async fn total_size(paths: &[PathBuf]) -> u64 {
    let mut total = 0;
    for path in paths {
        total += file_size(path).await.unwrap_or(0);
    }
    total
}

async fn remove_dir_quiet(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed run directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove run directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_names() {
        let inputs = vec![PathBuf::from("/in/a.mkv"), PathBuf::from("/in/b.mp4")];
        let jobs = process_jobs(&inputs, Path::new("/out"), false);
        assert_eq!(jobs[0].output, PathBuf::from("/out/processed_a.mp4"));

        let jobs = process_jobs(&inputs, Path::new("/out"), true);
        assert_eq!(jobs[1].output, PathBuf::from("/out/episode_002_b.mp4"));

        let mut request = PipelineRequest::default();
        assert_eq!(merged_name("abc", &request), "merged_season_abc.mp4");
        request.output_filename = Some("season1.mp4".to_string());
        assert_eq!(merged_name("abc", &request), "season1.mp4");
    }

    #[test]
    fn test_shared_stems_get_distinct_outputs() {
        let inputs = vec![
            PathBuf::from("/day1/clip.mp4"),
            PathBuf::from("/day2/clip.mkv"),
            PathBuf::from("/in/clip_2.mp4"),
            PathBuf::from("/day3/clip.mov"),
        ];
        let outputs: Vec<PathBuf> = process_jobs(&inputs, Path::new("/out"), false)
            .into_iter()
            .map(|j| j.output)
            .collect();
        assert_eq!(
            outputs,
            vec![
                PathBuf::from("/out/processed_clip.mp4"),
                PathBuf::from("/out/processed_clip_2.mp4"),
                PathBuf::from("/out/processed_clip_2_2.mp4"),
                PathBuf::from("/out/processed_clip_3.mp4"),
            ]
        );
    }

    #[test]
    fn test_stage_error_keeps_cancellation() {
        assert!(stage_error(Stage::Download, Error::Cancelled).is_cancelled());
        assert!(matches!(
            stage_error(Stage::Merge, Error::merge("x")),
            Error::Pipeline { .. }
        ));
    }
}
