use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::status::{ProcessingMode, Stage};
use crate::config::PipelineConfig;
use crate::hardware::QualityTarget;
use crate::processing::{CompressionProfile, EncodeSettings};
use crate::{Error, Result};

/// Everything a caller specifies for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineRequest {
    pub urls: Vec<String>,
    pub input_files: Vec<PathBuf>,
    pub mode: ProcessingMode,
    pub encode: EncodeSettings,
    /// Applied on top of `encode` in compress-only mode.
    pub compression_profile: CompressionProfile,
    /// Segment and encode in parallel; otherwise each file is one encode.
    pub parallel_processing: bool,
    pub segment_duration_secs: u64,
    pub max_parallel_segments: usize,
    pub max_concurrent_downloads: Option<usize>,
    pub merge_episodes: bool,
    pub season_title: Option<String>,
    /// Overrides the configured output directory.
    pub output_dir: Option<PathBuf>,
    pub output_filename: Option<String>,
    pub keep_intermediate_files: bool,
}

impl Default for PipelineRequest {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            input_files: Vec::new(),
            mode: ProcessingMode::FullPipeline,
            encode: EncodeSettings::default(),
            compression_profile: CompressionProfile::Balanced,
            parallel_processing: true,
            segment_duration_secs: 60,
            max_parallel_segments: 4,
            max_concurrent_downloads: None,
            merge_episodes: false,
            season_title: None,
            output_dir: None,
            output_filename: None,
            keep_intermediate_files: false,
        }
    }
}

impl PipelineRequest {
    /// Defaults taken from the service configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut request = Self {
            segment_duration_secs: config.segment_duration_secs,
            max_parallel_segments: config.max_parallel_segments,
            ..Default::default()
        };
        request.encode.target = QualityTarget::Quality(config.default_quality);
        request
    }

    /// Parse a JSON job, filling absent fields from `config`.
    pub fn from_json(raw: &str, config: &PipelineConfig) -> Result<Self> {
        let overrides: serde_json::Value = serde_json::from_str(raw)?;
        let serde_json::Value::Object(overrides) = overrides else {
            return Err(Error::validation("job must be a JSON object"));
        };
        let mut base = serde_json::to_value(Self::from_config(config))?;
        if let serde_json::Value::Object(fields) = &mut base {
            fields.extend(overrides);
        }
        Ok(serde_json::from_value(base)?)
    }

    pub fn download(urls: Vec<String>) -> Self {
        Self {
            urls,
            mode: ProcessingMode::DownloadOnly,
            ..Default::default()
        }
    }

    pub fn process(files: Vec<PathBuf>) -> Self {
        Self {
            input_files: files,
            mode: ProcessingMode::ProcessOnly,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_merge(mut self, season_title: Option<String>) -> Self {
        self.merge_episodes = true;
        self.season_title = season_title;
        self
    }

    /// Reject requests that cannot run, before anything is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() && self.input_files.is_empty() {
            return Err(Error::validation("no input URLs or files provided"));
        }
        if self.mode == ProcessingMode::DownloadOnly && self.urls.is_empty() {
            return Err(Error::validation("download mode requires URLs"));
        }
        if matches!(
            self.mode,
            ProcessingMode::ProcessOnly | ProcessingMode::CompressOnly
        ) && self.input_files.is_empty()
        {
            return Err(Error::validation("processing modes require input files"));
        }
        if self.segment_duration_secs == 0 {
            return Err(Error::validation("segment duration must be positive"));
        }
        if self.max_parallel_segments == 0 {
            return Err(Error::validation("max parallel segments must be positive"));
        }
        if self.max_concurrent_downloads == Some(0) {
            return Err(Error::validation("max concurrent downloads must be positive"));
        }
        Ok(())
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.mode.stages(!self.urls.is_empty(), self.merge_episodes)
    }

    /// Encode settings with the compression profile applied when relevant.
    pub fn effective_encode(&self) -> EncodeSettings {
        match self.mode {
            ProcessingMode::CompressOnly => self.compression_profile.apply(&self.encode),
            _ => self.encode.clone(),
        }
    }
}
