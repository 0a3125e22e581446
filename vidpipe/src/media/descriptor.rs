//! Media descriptors produced by probing.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Frame rate assumed when a stream does not report one.
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Frame-rate tolerance used for compatibility checks.
pub const FRAME_RATE_TOLERANCE: f64 = 0.1;

/// What is known about a media file or remote asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
    /// Container / format name, e.g. `mp4` or `mov,mp4,m4a,3gp,3g2,mj2`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    /// Audio bitrate in bits per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_bitrate: Option<u64>,
    /// Overall bitrate in bits per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl MediaDescriptor {
    /// Stand-in for a source whose metadata could not be resolved.
    pub fn placeholder(ordinal: u32, source_url: Option<&str>) -> Self {
        Self {
            title: Some(format!("Episode {}", ordinal)),
            source_url: source_url.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        Some((self.width?, self.height?))
    }

    /// Frame rate, falling back to the default.
    pub fn fps(&self) -> f64 {
        self.frame_rate.unwrap_or(DEFAULT_FRAME_RATE)
    }

    /// Same codec, resolution, and frame rate within tolerance.
    pub fn is_stream_compatible(&self, other: &Self) -> bool {
        self.incompatibility(other).is_none()
    }

    /// Describe the first mismatch against `reference`, if any.
    pub fn incompatibility(&self, reference: &Self) -> Option<String> {
        if self.video_codec != reference.video_codec {
            return Some(format!(
                "codec {} differs from {}",
                self.video_codec.as_deref().unwrap_or("unknown"),
                reference.video_codec.as_deref().unwrap_or("unknown"),
            ));
        }
        if self.resolution() != reference.resolution() {
            return Some(format!(
                "resolution {} differs from {}",
                format_resolution(self.resolution()),
                format_resolution(reference.resolution()),
            ));
        }
        if (self.fps() - reference.fps()).abs() > FRAME_RATE_TOLERANCE {
            return Some(format!(
                "frame rate {:.3} differs from {:.3}",
                self.fps(),
                reference.fps()
            ));
        }
        None
    }

    /// Build a descriptor from `ffprobe -print_format json` output.
    pub fn from_ffprobe_json(path: &Path, json: &str) -> Result<Self> {
        let parsed: FfprobeOutput = serde_json::from_str(json)
            .map_err(|e| Error::probe(path, format!("unparseable probe output: {}", e)))?;

        let format = parsed.format.unwrap_or_default();
        let video = parsed
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"));
        let audio = parsed
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"));

        Ok(Self {
            path: Some(path.to_path_buf()),
            title: format.tags.and_then(|t| t.title),
            source_url: None,
            duration_secs: parse_num::<f64>(format.duration.as_deref()).unwrap_or(0.0),
            width: video.and_then(|v| v.width),
            height: video.and_then(|v| v.height),
            frame_rate: video.map(|v| parse_frame_rate(v.r_frame_rate.as_deref())),
            container: format.format_name,
            video_codec: video.and_then(|v| v.codec_name.clone()),
            audio_codec: audio.and_then(|a| a.codec_name.clone()),
            audio_bitrate: audio.and_then(|a| parse_num(a.bit_rate.as_deref())),
            bitrate: parse_num(format.bit_rate.as_deref()),
            size_bytes: parse_num(format.size.as_deref()),
        })
    }
}

fn format_resolution(res: Option<(u32, u32)>) -> String {
    match res {
        Some((w, h)) => format!("{}x{}", w, h),
        None => "unknown".to_string(),
    }
}

fn parse_num<T: std::str::FromStr>(value: Option<&str>) -> Option<T> {
    value?.trim().parse().ok()
}

/// Parse `num/den` (or a plain number) into frames per second.
pub fn parse_frame_rate(value: Option<&str>) -> f64 {
    let Some(value) = value else {
        return DEFAULT_FRAME_RATE;
    };
    let parsed = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().unwrap_or(0.0);
            let den: f64 = den.trim().parse().unwrap_or(0.0);
            if den > 0.0 { num / den } else { 0.0 }
        }
        None => value.trim().parse().unwrap_or(0.0),
    };
    if parsed > 0.0 {
        parsed
    } else {
        DEFAULT_FRAME_RATE
    }
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
    tags: Option<FfprobeTags>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
    title: Option<String>,
}
