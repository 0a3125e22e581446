//! Encode request and parameter types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Target video codec.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Codec {
    #[default]
    #[strum(serialize = "h264", serialize = "avc")]
    H264,
    #[strum(serialize = "h265", serialize = "hevc")]
    H265,
    Av1,
    Vp9,
}

/// Abstract encoder preset, fastest first.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Preset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    #[default]
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl Preset {
    pub fn fastest() -> Self {
        Self::Ultrafast
    }

    pub fn best_quality() -> Self {
        Self::Veryslow
    }

    /// The x264/x265 token, also used by backends that accept the same names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ultrafast => "ultrafast",
            Self::Superfast => "superfast",
            Self::Veryfast => "veryfast",
            Self::Faster => "faster",
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Slow => "slow",
            Self::Slower => "slower",
            Self::Veryslow => "veryslow",
        }
    }
}

/// The single "quality or bitrate" knob callers provide.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum QualityTarget {
    /// Constant-quality value (CRF / CQ / QP scale, lower is better).
    Quality(u32),
    /// Target bitrate in bits per second.
    Bitrate(u64),
}

impl Default for QualityTarget {
    fn default() -> Self {
        Self::Quality(23)
    }
}

impl QualityTarget {
    /// Parse `"23"` as a quality value, `"5M"` / `"2500k"` / `"800000"`-with-suffix as a bitrate.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let invalid = || Error::validation(format!("invalid quality or bitrate: '{}'", value));

        let (digits, multiplier) = match value.chars().last() {
            Some('k' | 'K') => (&value[..value.len() - 1], 1_000u64),
            Some('m' | 'M') => (&value[..value.len() - 1], 1_000_000u64),
            Some('g' | 'G') => (&value[..value.len() - 1], 1_000_000_000u64),
            Some(c) if c.is_ascii_digit() => {
                let quality: u32 = value.parse().map_err(|_| invalid())?;
                return Ok(Self::Quality(quality));
            }
            _ => return Err(invalid()),
        };

        let number: f64 = digits.parse().map_err(|_| invalid())?;
        if number <= 0.0 {
            return Err(invalid());
        }
        Ok(Self::Bitrate((number * multiplier as f64) as u64))
    }
}

/// Format a bitrate in bits per second the way ffmpeg flags expect it.
pub fn format_bitrate(bps: u64) -> String {
    if bps >= 1_000_000 && bps % 1_000_000 == 0 {
        format!("{}M", bps / 1_000_000)
    } else if bps >= 1_000 && bps % 1_000 == 0 {
        format!("{}k", bps / 1_000)
    } else {
        bps.to_string()
    }
}

/// Rate-control idiom chosen for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum RateControl {
    ConstantQuality { value: u32 },
    VariableBitrate { bitrate: u64, max_bitrate: u64 },
    FixedBitrate { bitrate: u64 },
    /// Software only: an analysis pass followed by the encoding pass.
    TwoPass { bitrate: u64 },
}

/// Accelerator vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Vendor {
    Nvidia,
    Intel,
    Amd,
    Apple,
}

/// Encode path. Declaration order is the preference order.
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
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Backend {
    Nvenc,
    Qsv,
    Vaapi,
    VideoToolbox,
    Software,
}

impl Backend {
    pub fn vendor(&self) -> Option<Vendor> {
        match self {
            Self::Nvenc => Some(Vendor::Nvidia),
            Self::Qsv => Some(Vendor::Intel),
            Self::Vaapi => Some(Vendor::Amd),
            Self::VideoToolbox => Some(Vendor::Apple),
            Self::Software => None,
        }
    }

    pub fn for_vendor(vendor: Vendor) -> Self {
        match vendor {
            Vendor::Nvidia => Self::Nvenc,
            Vendor::Intel => Self::Qsv,
            Vendor::Amd => Self::Vaapi,
            Vendor::Apple => Self::VideoToolbox,
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, Self::Software)
    }
}

/// What the caller wants encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeRequest {
    pub codec: Codec,
    pub preset: Preset,
    pub target: QualityTarget,
    #[serde(default)]
    pub resolution: Option<(u32, u32)>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub threads: Option<u32>,
    /// Prefer two-pass encoding for bitrate targets where the backend can.
    #[serde(default)]
    pub two_pass: bool,
}

impl Default for EncodeRequest {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            preset: Preset::Medium,
            target: QualityTarget::default(),
            resolution: None,
            fps: None,
            threads: None,
            two_pass: false,
        }
    }
}

impl EncodeRequest {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            ..Default::default()
        }
    }

    pub fn with_preset(mut self, preset: Preset) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_quality(mut self, quality: u32) -> Self {
        self.target = QualityTarget::Quality(quality);
        self
    }

    pub fn with_bitrate(mut self, bps: u64) -> Self {
        self.target = QualityTarget::Bitrate(bps);
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_two_pass(mut self, two_pass: bool) -> Self {
        self.two_pass = two_pass;
        self
    }
}

/// Concrete encoder parameters for one encode call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeParameterSet {
    pub backend: Backend,
    pub codec: Codec,
    /// ffmpeg encoder name, e.g. `h264_nvenc` or `libx264`.
    pub encoder: String,
    /// Backend-specific preset token, empty when the backend has none.
    pub preset: String,
    pub rate_control: RateControl,
    pub resolution: Option<(u32, u32)>,
    pub fps: Option<f64>,
    /// Flags placed before `-i`.
    pub input_args: Vec<String>,
    /// Flags placed after the filter chain.
    pub output_args: Vec<String>,
}

/// A detected accelerator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    pub vendor: Vendor,
    pub name: String,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub driver_version: Option<String>,
    pub supported_codecs: Vec<Codec>,
    pub max_width: u32,
    pub max_height: u32,
    pub max_fps: f64,
}

impl AcceleratorInfo {
    pub fn supports(&self, codec: Codec) -> bool {
        self.supported_codecs.contains(&codec)
    }
}

/// Snapshot of what the machine can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    pub accelerators: Vec<AcceleratorInfo>,
    pub detected_at: DateTime<Utc>,
}

impl HardwareCapabilities {
    pub fn software_only() -> Self {
        Self {
            accelerators: Vec::new(),
            detected_at: Utc::now(),
        }
    }

    pub fn has_vendor(&self, vendor: Vendor) -> bool {
        self.accelerators.iter().any(|a| a.vendor == vendor)
    }

    /// First accelerator of `vendor`, in detection order.
    pub fn accelerator(&self, vendor: Vendor) -> Option<&AcceleratorInfo> {
        self.accelerators.iter().find(|a| a.vendor == vendor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_codec_aliases() {
        assert_eq!(Codec::from_str("HEVC").unwrap(), Codec::H265);
        assert_eq!(Codec::from_str("avc").unwrap(), Codec::H264);
        assert_eq!(Codec::from_str("av1").unwrap(), Codec::Av1);
        assert!(Codec::from_str("mpeg2").is_err());
        assert_eq!(Codec::H265.to_string(), "h265");
    }

    #[test]
    fn test_preset_order() {
        assert!(Preset::fastest() < Preset::Medium);
        assert!(Preset::best_quality() > Preset::Slow);
        assert_eq!(Preset::from_str("VeryFast").unwrap(), Preset::Veryfast);
    }

    #[test]
    fn test_quality_target_parse() {
        assert_eq!(QualityTarget::parse("23").unwrap(), QualityTarget::Quality(23));
        assert_eq!(QualityTarget::parse("5M").unwrap(), QualityTarget::Bitrate(5_000_000));
        assert_eq!(QualityTarget::parse("2500k").unwrap(), QualityTarget::Bitrate(2_500_000));
        assert_eq!(QualityTarget::parse("1.5M").unwrap(), QualityTarget::Bitrate(1_500_000));
        assert!(QualityTarget::parse("fast").is_err());
        assert!(QualityTarget::parse("0k").is_err());
    }

    #[test]
    fn test_format_bitrate() {
        assert_eq!(format_bitrate(5_000_000), "5M");
        assert_eq!(format_bitrate(2_500_000), "2500k");
        assert_eq!(format_bitrate(1234), "1234");
    }

    #[test]
    fn test_backend_preference_order() {
        let mut backends = vec![Backend::Software, Backend::VideoToolbox, Backend::Nvenc, Backend::Vaapi, Backend::Qsv];
        backends.sort();
        assert_eq!(
            backends,
            vec![Backend::Nvenc, Backend::Qsv, Backend::Vaapi, Backend::VideoToolbox, Backend::Software]
        );
        assert_eq!(Backend::for_vendor(Vendor::Amd), Backend::Vaapi);
        assert_eq!(Backend::VideoToolbox.to_string(), "video_toolbox");
    }
}
