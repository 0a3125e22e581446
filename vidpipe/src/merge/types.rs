use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How inputs are recombined.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergeMethod {
    /// Single input, copied as is.
    FileCopy,
    /// Stream copy through the concat demuxer.
    ConcatDemuxer,
    /// Re-encode through a concat filter graph.
    ConcatFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Exclude inputs whose codec, resolution or frame rate differ from the
    /// first valid input.
    pub require_homogeneous: bool,
    /// Compare the output against the first input after merging.
    pub quality_check: bool,
    /// Delete the inputs after a successful merge.
    pub remove_inputs: bool,
    /// Upper bound for a single merge tool call.
    pub timeout_secs: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            require_homogeneous: true,
            quality_check: true,
            remove_inputs: false,
            timeout_secs: 3600,
        }
    }
}

impl MergeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn with_homogeneous(mut self, required: bool) -> Self {
        self.require_homogeneous = required;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub start_secs: f64,
    pub end_secs: f64,
}

/// Outcome of a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub output_path: PathBuf,
    /// Inputs that were actually merged, in merge order.
    pub inputs: Vec<PathBuf>,
    pub total_duration_secs: f64,
    pub output_size_bytes: u64,
    pub method: MergeMethod,
    pub processing_secs: f64,
    pub merged_count: usize,
    /// Excluded inputs and quality-check findings.
    pub warnings: Vec<String>,
    pub quality_consistent: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chapters: Vec<Chapter>,
    /// Probed properties of the output.
    pub metadata: BTreeMap<String, String>,
}
