//! Pipeline configuration.
//!
//! Configuration is read from an optional JSON file and then overlaid with
//! environment variables (after `.env` has been loaded by the binary). Tool
//! locations honor the conventional `FFMPEG_PATH` / `FFPROBE_PATH` /
//! `YTDLP_PATH` variables; every other knob uses a `VIDPIPE_` prefix.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::downloader::RetryConfig;
use crate::merge::MergeConfig;
use crate::pipeline::StageWeights;
use crate::{Error, Result};

/// Locations of the external tools the pipeline drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPaths {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    #[serde(default = "default_ytdlp")]
    pub ytdlp: PathBuf,
    #[serde(default = "default_nvidia_smi")]
    pub nvidia_smi: PathBuf,
    #[serde(default = "default_lspci")]
    pub lspci: PathBuf,
    #[serde(default = "default_sysctl")]
    pub sysctl: PathBuf,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_ytdlp() -> PathBuf {
    PathBuf::from("yt-dlp")
}

fn default_nvidia_smi() -> PathBuf {
    PathBuf::from("nvidia-smi")
}

fn default_lspci() -> PathBuf {
    PathBuf::from("lspci")
}

fn default_sysctl() -> PathBuf {
    PathBuf::from("sysctl")
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            ytdlp: default_ytdlp(),
            nvidia_smi: default_nvidia_smi(),
            lspci: default_lspci(),
            sysctl: default_sysctl(),
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogSettings {
    /// Filter directive; `RUST_LOG` still wins when set.
    #[serde(default)]
    pub filter: Option<String>,
    /// Emit JSON lines instead of human readable output.
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files. Console only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub tools: ToolPaths,
    /// Scratch space for segments and intermediate files.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Where finished artifacts are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Size of the download concurrency gate.
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    /// Size of the encode concurrency gate.
    #[serde(default = "default_max_parallel_segments")]
    pub max_parallel_segments: usize,
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u64,
    /// In-process retry policy for fetches.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Upper bound for a single encode/segment/merge tool invocation.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Upper bound for probes and capability queries.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Minimum spacing between transfer progress callbacks.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Timeout for individual HTTP requests, 0 disables it.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub stage_weights: StageWeights,
    /// Constant-quality value used when a request names none.
    #[serde(default = "default_quality")]
    pub default_quality: u32,
    #[serde(default = "default_true")]
    pub use_hardware_accel: bool,
    #[serde(default)]
    pub logging: LogSettings,
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("vidpipe")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_max_concurrent_downloads() -> usize {
    3
}

fn default_max_parallel_segments() -> usize {
    4
}

fn default_segment_duration_secs() -> u64 {
    60
}

fn default_tool_timeout_secs() -> u64 {
    3600
}

fn default_probe_timeout_secs() -> u64 {
    60
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_http_timeout_secs() -> u64 {
    0
}

fn default_quality() -> u32 {
    23
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            temp_dir: default_temp_dir(),
            output_dir: default_output_dir(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_parallel_segments: default_max_parallel_segments(),
            segment_duration_secs: default_segment_duration_secs(),
            retry: RetryConfig::default(),
            tool_timeout_secs: default_tool_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            http_timeout_secs: default_http_timeout_secs(),
            stage_weights: StageWeights::default(),
            default_quality: default_quality(),
            use_hardware_accel: true,
            logging: LogSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from an optional JSON file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).map_err(|e| Error::io_path("reading config", path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Overlay values from a key lookup (normally the environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FFMPEG_PATH") {
            self.tools.ffmpeg = PathBuf::from(v);
        }
        if let Some(v) = lookup("FFPROBE_PATH") {
            self.tools.ffprobe = PathBuf::from(v);
        }
        if let Some(v) = lookup("YTDLP_PATH") {
            self.tools.ytdlp = PathBuf::from(v);
        }
        if let Some(v) = lookup("VIDPIPE_TEMP_DIR") {
            self.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("VIDPIPE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("VIDPIPE_MAX_CONCURRENT_DOWNLOADS") {
            self.max_concurrent_downloads = parse_env("VIDPIPE_MAX_CONCURRENT_DOWNLOADS", &v)?;
        }
        if let Some(v) = lookup("VIDPIPE_MAX_PARALLEL_SEGMENTS") {
            self.max_parallel_segments = parse_env("VIDPIPE_MAX_PARALLEL_SEGMENTS", &v)?;
        }
        if let Some(v) = lookup("VIDPIPE_SEGMENT_DURATION") {
            self.segment_duration_secs = parse_env("VIDPIPE_SEGMENT_DURATION", &v)?;
        }
        if let Some(v) = lookup("VIDPIPE_MAX_RETRIES") {
            self.retry.max_retries = parse_env("VIDPIPE_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("VIDPIPE_TOOL_TIMEOUT_SECS") {
            self.tool_timeout_secs = parse_env("VIDPIPE_TOOL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("VIDPIPE_STAGE_WEIGHTS") {
            self.stage_weights = v.parse()?;
        }
        if let Some(v) = lookup("VIDPIPE_DEFAULT_QUALITY") {
            self.default_quality = parse_env("VIDPIPE_DEFAULT_QUALITY", &v)?;
        }
        if let Some(v) = lookup("VIDPIPE_HARDWARE_ACCEL") {
            self.use_hardware_accel = parse_bool(&v);
        }
        if let Some(v) = lookup("VIDPIPE_LOG") {
            self.logging.filter = Some(v);
        }
        if let Some(v) = lookup("VIDPIPE_LOG_JSON") {
            self.logging.json = parse_bool(&v);
        }
        if let Some(v) = lookup("VIDPIPE_LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(Error::validation(
                "max_concurrent_downloads must be greater than zero",
            ));
        }
        if self.max_parallel_segments == 0 {
            return Err(Error::validation(
                "max_parallel_segments must be greater than zero",
            ));
        }
        if self.segment_duration_secs == 0 {
            return Err(Error::validation(
                "segment_duration_secs must be greater than zero",
            ));
        }
        if self.tool_timeout_secs == 0 {
            return Err(Error::validation("tool_timeout_secs must be greater than zero"));
        }
        self.stage_weights.validate()
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Merge settings for pipeline runs, bounded by the tool timeout.
    pub fn merge_config(&self) -> MergeConfig {
        MergeConfig::default().with_timeout(self.tool_timeout())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("invalid value for {key}: '{value}'")))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_parallel_segments, 4);
        assert_eq!(config.segment_duration_secs, 60);
        assert_eq!(config.tool_timeout(), Duration::from_secs(3600));
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_merge_config_follows_tool_timeout() {
        let config = PipelineConfig {
            tool_timeout_secs: 90,
            ..Default::default()
        };
        let merge = config.merge_config();
        assert_eq!(merge.timeout(), Duration::from_secs(90));
        assert!(merge.require_homogeneous);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PipelineConfig::default();
        config
            .apply_overrides(lookup_from(&[
                ("FFMPEG_PATH", "/opt/ffmpeg/bin/ffmpeg"),
                ("VIDPIPE_MAX_PARALLEL_SEGMENTS", "8"),
                ("VIDPIPE_STAGE_WEIGHTS", "20,60,20"),
                ("VIDPIPE_HARDWARE_ACCEL", "off"),
            ]))
            .unwrap();

        assert_eq!(config.tools.ffmpeg, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(config.max_parallel_segments, 8);
        assert_eq!(config.stage_weights.processing, 60);
        assert!(!config.use_hardware_accel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_number_is_a_config_error() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_overrides(lookup_from(&[("VIDPIPE_MAX_CONCURRENT_DOWNLOADS", "many")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = PipelineConfig {
            max_concurrent_downloads: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_weights_must_sum_to_hundred() {
        let mut config = PipelineConfig::default();
        config.stage_weights = StageWeights::new(30, 30, 30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"max_concurrent_downloads": 5, "tools": {"ffmpeg": "ff"}}"#)
                .unwrap();
        assert_eq!(config.max_concurrent_downloads, 5);
        assert_eq!(config.tools.ffmpeg, PathBuf::from("ff"));
        assert_eq!(config.tools.ffprobe, PathBuf::from("ffprobe"));
        assert_eq!(config.stage_weights, StageWeights::default());
    }
}
