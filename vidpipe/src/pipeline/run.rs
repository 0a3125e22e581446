use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::{ProcessingMode, RunStatus, Stage};
use crate::merge::MergeResult;

/// Snapshot of a run, as kept in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub mode: ProcessingMode,
    pub stages: Vec<Stage>,
    /// Local percentage per planned stage.
    pub stage_progress: Vec<(Stage, f64)>,
    pub overall_percent: f64,
    pub current_stage: Option<Stage>,
    pub status: RunStatus,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(id: impl Into<String>, mode: ProcessingMode, stages: Vec<Stage>) -> Self {
        Self {
            id: id.into(),
            mode,
            stage_progress: stages.iter().map(|s| (*s, 0.0)).collect(),
            stages,
            overall_percent: 0.0,
            current_stage: None,
            status: RunStatus::Pending,
            warnings: Vec::new(),
            errors: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn stage_percent(&self, stage: Stage) -> Option<f64> {
        self.stage_progress
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, p)| *p)
    }

    pub(crate) fn set_stage_percent(&mut self, stage: Stage, percent: f64) {
        if let Some(entry) = self.stage_progress.iter_mut().find(|(s, _)| *s == stage) {
            entry.1 = percent;
        }
    }
}

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub output_files: Vec<PathBuf>,
    pub merge_result: Option<MergeResult>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_input_bytes: u64,
    pub total_output_bytes: u64,
    /// Input bytes over output bytes, when both are known.
    pub compression_ratio: Option<f64>,
}

impl RunReport {
    pub fn compression_ratio(input: u64, output: u64) -> Option<f64> {
        (input > 0 && output > 0).then(|| input as f64 / output as f64)
    }
}
