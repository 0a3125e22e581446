//! Sample-based content complexity analysis for compress-only runs.
//!
//! A handful of short windows spread over the source are run through
//! ffmpeg's scene detector. The hit counts drive a complexity class, which in
//! turn drives the recommended constant-quality value and bitrate.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::media::{MediaDescriptor, ToolInvocation, ToolRunner};
use crate::{Error, Result};

/// Scene score a frame must exceed to count as a cut.
const SCENE_THRESHOLD: f64 = 0.3;
/// Key printed by the metadata filter for every selected frame.
const SCENE_SCORE_KEY: &str = "lavfi.scene_score";
const SAMPLE_INTERVAL_SECS: f64 = 30.0;
const MIN_SAMPLES: usize = 3;
const MAX_SAMPLES: usize = 10;
const MAX_SAMPLE_SECS: f64 = 10.0;
/// Motion assumed for a window that could not be analysed.
const FALLBACK_MOTION: f64 = 30.0;
/// Contrast plus noise estimate; no per-frame spatial metric is measured.
const SPATIAL_ESTIMATE: f64 = 65.0;

const BITS_PER_PIXEL: f64 = 0.1;
const MIN_BITRATE: u64 = 500_000;
const MAX_BITRATE: u64 = 50_000_000;
const BASE_CRF: u32 = 23;
const MIN_CRF: u32 = 18;
const MAX_CRF: u32 = 28;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContentComplexity {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ContentComplexity {
    fn bitrate_multiplier(&self) -> f64 {
        match self {
            Self::Low => 0.7,
            Self::Medium => 1.0,
            Self::High => 1.4,
            Self::VeryHigh => 1.8,
        }
    }

    fn crf(&self) -> u32 {
        match self {
            Self::Low => BASE_CRF + 2,
            Self::Medium => BASE_CRF,
            Self::High => BASE_CRF - 1,
            Self::VeryHigh => BASE_CRF - 2,
        }
    }
}

/// Scene detection result for one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleScore {
    /// 0..=100.
    pub motion: f64,
    pub scene_change: bool,
}

impl SampleScore {
    pub fn from_scene_hits(hits: usize) -> Self {
        Self {
            motion: (hits as f64 * 10.0 + 20.0).min(100.0),
            scene_change: hits > 0,
        }
    }

    pub fn fallback() -> Self {
        Self {
            motion: FALLBACK_MOTION,
            scene_change: false,
        }
    }
}

/// What the analysis measured and what it recommends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub complexity: ContentComplexity,
    pub motion_score: f64,
    /// Windows that contained at least one scene change.
    pub scene_changes: usize,
    pub samples: usize,
    pub temporal_complexity: f64,
    pub spatial_complexity: f64,
    pub recommended_bitrate: u64,
    pub recommended_crf: u32,
}

impl ContentAnalysis {
    /// Aggregate per-window scores for `source`.
    pub fn from_scores(source: &MediaDescriptor, scores: &[SampleScore]) -> Self {
        let samples = scores.len();
        let motion_score = if samples == 0 {
            0.0
        } else {
            scores.iter().map(|s| s.motion).sum::<f64>() / samples as f64
        };
        let scene_changes = scores.iter().filter(|s| s.scene_change).count();
        let complexity = determine_complexity(motion_score, scene_changes, samples);

        let change_rate = if samples == 0 {
            0.0
        } else {
            scene_changes as f64 / samples as f64
        };
        let temporal_complexity = (motion_score + change_rate * 100.0).min(100.0);
        let spatial_complexity = SPATIAL_ESTIMATE;
        let (recommended_bitrate, recommended_crf) =
            recommend(source, complexity, temporal_complexity, spatial_complexity);

        Self {
            complexity,
            motion_score,
            scene_changes,
            samples,
            temporal_complexity,
            spatial_complexity,
            recommended_bitrate,
            recommended_crf,
        }
    }
}

/// `(start, duration)` windows spread evenly over the source.
pub fn sample_windows(total_secs: f64) -> Vec<(f64, f64)> {
    if total_secs <= 0.0 {
        return Vec::new();
    }
    let count = ((total_secs / SAMPLE_INTERVAL_SECS) as usize).clamp(MIN_SAMPLES, MAX_SAMPLES);
    let step = total_secs / count as f64;
    let duration = step.min(MAX_SAMPLE_SECS);
    (0..count).map(|i| (i as f64 * step, duration)).collect()
}

pub fn determine_complexity(
    motion_score: f64,
    scene_changes: usize,
    samples: usize,
) -> ContentComplexity {
    let rate = if samples > 0 {
        scene_changes as f64 / samples as f64
    } else {
        0.0
    };
    if motion_score > 70.0 || rate > 0.8 {
        ContentComplexity::VeryHigh
    } else if motion_score > 50.0 || rate > 0.5 {
        ContentComplexity::High
    } else if motion_score > 25.0 || rate > 0.2 {
        ContentComplexity::Medium
    } else {
        ContentComplexity::Low
    }
}

/// Recommended `(bitrate, crf)` for `source` at the given complexity.
///
/// Sources of unknown size are treated as 1080p.
pub fn recommend(
    source: &MediaDescriptor,
    complexity: ContentComplexity,
    temporal_complexity: f64,
    spatial_complexity: f64,
) -> (u64, u32) {
    let (w, h) = source.resolution().unwrap_or((1920, 1080));
    let bpp = BITS_PER_PIXEL
        * complexity.bitrate_multiplier()
        * (1.0 + temporal_complexity / 200.0)
        * (1.0 + spatial_complexity / 300.0);
    let bitrate = (w as f64 * h as f64 * source.fps() * bpp) as u64;
    (
        bitrate.clamp(MIN_BITRATE, MAX_BITRATE),
        complexity.crf().clamp(MIN_CRF, MAX_CRF),
    )
}

/// Runs the scene detector over sample windows of a source.
pub struct ContentAnalyzer {
    runner: Arc<dyn ToolRunner>,
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl ContentAnalyzer {
    pub fn new(runner: Arc<dyn ToolRunner>, ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            ffmpeg: ffmpeg.into(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn sample_invocation(&self, input: &Path, start_secs: f64, duration_secs: f64) -> ToolInvocation {
        ToolInvocation::new(
            &self.ffmpeg,
            vec![
                "-hide_banner".to_string(),
                "-nostats".to_string(),
                "-ss".to_string(),
                format!("{:.3}", start_secs),
                "-t".to_string(),
                format!("{:.3}", duration_secs),
                "-i".to_string(),
                input.to_string_lossy().into_owned(),
                "-an".to_string(),
                "-vf".to_string(),
                format!(
                    "select=gt(scene\\,{}),metadata=print:file=-",
                    SCENE_THRESHOLD
                ),
                "-f".to_string(),
                "null".to_string(),
                "-".to_string(),
            ],
        )
        .with_timeout(self.timeout)
    }

    /// Score sample windows of `input` and aggregate them.
    ///
    /// A window whose tool call fails is scored with a neutral fallback;
    /// only cancellation aborts the analysis.
    pub async fn analyze(
        &self,
        input: &Path,
        source: &MediaDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ContentAnalysis> {
        let windows = sample_windows(source.duration_secs);
        if windows.is_empty() {
            return Err(Error::probe(input, "source has no usable duration"));
        }
        let started = Instant::now();

        let mut scores = Vec::with_capacity(windows.len());
        for (i, (start, duration)) in windows.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let invocation = self.sample_invocation(input, start, duration);
            let mut hits = 0usize;
            let mut count_hits = |line: &str| {
                if line.starts_with(SCENE_SCORE_KEY) {
                    hits += 1;
                }
            };
            let outcome = self.runner.run(&invocation, cancel, Some(&mut count_hits)).await;
            match outcome {
                Ok(output) if output.success() => {
                    debug!(sample = i, start, scene_hits = hits, "Scored sample");
                    scores.push(SampleScore::from_scene_hits(hits));
                }
                Ok(output) => {
                    debug!(sample = i, reason = %output.failure_summary(), "Sample analysis failed");
                    scores.push(SampleScore::fallback());
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(sample = i, error = %e, "Sample analysis failed");
                    scores.push(SampleScore::fallback());
                }
            }
        }

        let analysis = ContentAnalysis::from_scores(source, &scores);
        info!(
            input = %input.display(),
            complexity = %analysis.complexity,
            motion = analysis.motion_score,
            scene_changes = analysis.scene_changes,
            bitrate = analysis.recommended_bitrate,
            crf = analysis.recommended_crf,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Content analysed"
        );
        Ok(analysis)
    }
}
