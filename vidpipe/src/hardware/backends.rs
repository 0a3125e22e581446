//! Per-backend encoder parameter builders.

use super::types::{
    Backend, Codec, EncodeParameterSet, EncodeRequest, Preset, QualityTarget, RateControl,
    format_bitrate,
};

/// Bitrate VideoToolbox falls back to when asked for constant quality.
pub const VIDEOTOOLBOX_DEFAULT_BITRATE: u64 = 5_000_000;

/// Constant-quality value used when the software path gets no explicit value.
pub const DEFAULT_CRF: u32 = 23;

/// H.264 levels with their macroblock-rate and frame-size limits.
const H264_LEVELS: &[(&str, u64, u64)] = &[
    ("4.0", 245_760, 8_192),
    ("4.2", 522_240, 8_704),
    ("5.0", 589_824, 22_080),
    ("5.1", 983_040, 36_864),
    ("5.2", 2_073_600, 36_864),
    ("6.0", 4_177_920, 139_264),
];

/// Level used when resolution and frame rate are unknown.
const BASELINE_H264_LEVEL: &str = "4.2";

/// Smallest H.264 level that can carry `width`x`height` at `fps`.
pub fn recommended_h264_level(width: u32, height: u32, fps: f64) -> &'static str {
    let frame_mbs = u64::from(width.div_ceil(16)) * u64::from(height.div_ceil(16));
    let mb_rate = (frame_mbs as f64 * fps.max(0.0)).ceil() as u64;

    H264_LEVELS
        .iter()
        .find(|(_, max_rate, max_frame)| mb_rate <= *max_rate && frame_mbs <= *max_frame)
        .map(|(level, _, _)| *level)
        .unwrap_or("6.0")
}

/// Level to put on the command line: the baseline unless the request needs more.
fn h264_level_for(request: &EncodeRequest) -> &'static str {
    let (Some((w, h)), Some(fps)) = (request.resolution, request.fps) else {
        return BASELINE_H264_LEVEL;
    };
    let recommended = recommended_h264_level(w, h, fps);
    let rank = |level: &str| H264_LEVELS.iter().position(|(l, _, _)| *l == level);
    if rank(recommended) > rank(BASELINE_H264_LEVEL) {
        recommended
    } else {
        BASELINE_H264_LEVEL
    }
}

/// Builds an [`EncodeParameterSet`] for one encode path.
pub trait EncodeBackend: Send + Sync {
    fn backend(&self) -> Backend;

    fn supports(&self, codec: Codec) -> bool;

    /// Build parameters. Only called for codecs [`supports`](Self::supports) accepts.
    fn build(&self, request: &EncodeRequest) -> EncodeParameterSet;
}

/// Every backend in preference order.
pub fn all_backends() -> [&'static dyn EncodeBackend; 5] {
    [
        &NvencBackend,
        &QsvBackend,
        &VaapiBackend,
        &VideoToolboxBackend,
        &SoftwareBackend,
    ]
}

pub fn backend_for(backend: Backend) -> &'static dyn EncodeBackend {
    match backend {
        Backend::Nvenc => &NvencBackend,
        Backend::Qsv => &QsvBackend,
        Backend::Vaapi => &VaapiBackend,
        Backend::VideoToolbox => &VideoToolboxBackend,
        Backend::Software => &SoftwareBackend,
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn hardware_encoder_name(codec: Codec, suffix: &str) -> String {
    match codec {
        Codec::H265 => format!("hevc_{}", suffix),
        _ => format!("h264_{}", suffix),
    }
}

/// Shared tail for hardware paths: faststart plus explicit size and rate.
fn push_hardware_output_extras(out: &mut Vec<String>, request: &EncodeRequest) {
    out.extend(args(&["-movflags", "+faststart"]));
    if let Some((w, h)) = request.resolution {
        out.push("-s".to_string());
        out.push(format!("{}x{}", w, h));
    }
    if let Some(fps) = request.fps {
        out.push("-r".to_string());
        out.push(format_fps(fps));
    }
}

fn format_fps(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as u64)
    } else {
        format!("{:.3}", fps)
    }
}

fn assemble(
    backend: Backend,
    request: &EncodeRequest,
    encoder: String,
    preset: String,
    rate_control: RateControl,
    input_args: Vec<String>,
    output_args: Vec<String>,
) -> EncodeParameterSet {
    EncodeParameterSet {
        backend,
        codec: request.codec,
        encoder,
        preset,
        rate_control,
        resolution: request.resolution,
        fps: request.fps,
        input_args,
        output_args,
    }
}

pub struct NvencBackend;

impl NvencBackend {
    pub fn preset_token(preset: Preset) -> &'static str {
        match preset {
            Preset::Ultrafast => "p1",
            Preset::Superfast => "p2",
            Preset::Veryfast => "p3",
            Preset::Faster => "p4",
            Preset::Fast => "p5",
            Preset::Medium => "p6",
            Preset::Slow | Preset::Slower | Preset::Veryslow => "p7",
        }
    }
}

impl EncodeBackend for NvencBackend {
    fn backend(&self) -> Backend {
        Backend::Nvenc
    }

    fn supports(&self, codec: Codec) -> bool {
        matches!(codec, Codec::H264 | Codec::H265)
    }

    fn build(&self, request: &EncodeRequest) -> EncodeParameterSet {
        let encoder = hardware_encoder_name(request.codec, "nvenc");
        let preset = Self::preset_token(request.preset).to_string();

        let mut out = vec!["-c:v".to_string(), encoder.clone(), "-preset".to_string(), preset.clone()];
        let rate_control = match request.target {
            QualityTarget::Quality(q) => {
                out.extend(["-cq".to_string(), q.to_string()]);
                out.extend(args(&["-rc", "constqp"]));
                RateControl::ConstantQuality { value: q }
            }
            QualityTarget::Bitrate(b) => {
                out.extend([
                    "-b:v".to_string(),
                    format_bitrate(b),
                    "-maxrate".to_string(),
                    format_bitrate(b),
                    "-bufsize".to_string(),
                    format_bitrate(b * 2),
                ]);
                out.extend(args(&["-rc", "vbr"]));
                RateControl::VariableBitrate {
                    bitrate: b,
                    max_bitrate: b,
                }
            }
        };

        out.extend(args(&["-tune", "hq"]));
        if request.codec == Codec::H264 {
            out.extend(args(&["-profile:v", "high", "-level"]));
            out.push(h264_level_for(request).to_string());
        }
        out.extend(args(&["-spatial_aq", "1", "-temporal_aq", "1"]));
        push_hardware_output_extras(&mut out, request);

        assemble(
            Backend::Nvenc,
            request,
            encoder,
            preset,
            rate_control,
            args(&["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"]),
            out,
        )
    }
}

pub struct QsvBackend;

impl QsvBackend {
    pub fn preset_token(preset: Preset) -> &'static str {
        match preset {
            Preset::Ultrafast | Preset::Superfast | Preset::Veryfast => "veryfast",
            other => other.as_str(),
        }
    }
}

impl EncodeBackend for QsvBackend {
    fn backend(&self) -> Backend {
        Backend::Qsv
    }

    fn supports(&self, codec: Codec) -> bool {
        matches!(codec, Codec::H264 | Codec::H265)
    }

    fn build(&self, request: &EncodeRequest) -> EncodeParameterSet {
        let encoder = hardware_encoder_name(request.codec, "qsv");
        let preset = Self::preset_token(request.preset).to_string();

        let mut out = vec!["-c:v".to_string(), encoder.clone(), "-preset".to_string(), preset.clone()];
        let rate_control = match request.target {
            QualityTarget::Quality(q) => {
                out.extend(["-global_quality".to_string(), q.to_string()]);
                RateControl::ConstantQuality { value: q }
            }
            QualityTarget::Bitrate(b) => {
                out.extend([
                    "-b:v".to_string(),
                    format_bitrate(b),
                    "-maxrate".to_string(),
                    format_bitrate(b),
                ]);
                RateControl::VariableBitrate {
                    bitrate: b,
                    max_bitrate: b,
                }
            }
        };
        push_hardware_output_extras(&mut out, request);

        assemble(
            Backend::Qsv,
            request,
            encoder,
            preset,
            rate_control,
            args(&["-hwaccel", "qsv"]),
            out,
        )
    }
}

pub struct VaapiBackend;

impl VaapiBackend {
    pub const RENDER_DEVICE: &'static str = "/dev/dri/renderD128";
}

impl EncodeBackend for VaapiBackend {
    fn backend(&self) -> Backend {
        Backend::Vaapi
    }

    fn supports(&self, codec: Codec) -> bool {
        matches!(codec, Codec::H264 | Codec::H265)
    }

    fn build(&self, request: &EncodeRequest) -> EncodeParameterSet {
        let encoder = hardware_encoder_name(request.codec, "vaapi");

        let mut out = vec!["-c:v".to_string(), encoder.clone()];
        let rate_control = match request.target {
            QualityTarget::Quality(q) => {
                out.extend(["-qp".to_string(), q.to_string()]);
                RateControl::ConstantQuality { value: q }
            }
            QualityTarget::Bitrate(b) => {
                out.extend(["-b:v".to_string(), format_bitrate(b)]);
                RateControl::FixedBitrate { bitrate: b }
            }
        };
        push_hardware_output_extras(&mut out, request);

        assemble(
            Backend::Vaapi,
            request,
            encoder,
            String::new(),
            rate_control,
            args(&["-hwaccel", "vaapi", "-vaapi_device", Self::RENDER_DEVICE]),
            out,
        )
    }
}

pub struct VideoToolboxBackend;

impl EncodeBackend for VideoToolboxBackend {
    fn backend(&self) -> Backend {
        Backend::VideoToolbox
    }

    fn supports(&self, codec: Codec) -> bool {
        matches!(codec, Codec::H264 | Codec::H265)
    }

    fn build(&self, request: &EncodeRequest) -> EncodeParameterSet {
        let encoder = hardware_encoder_name(request.codec, "videotoolbox");
        // Bitrate driven only.
        let bitrate = match request.target {
            QualityTarget::Bitrate(b) => b,
            QualityTarget::Quality(_) => VIDEOTOOLBOX_DEFAULT_BITRATE,
        };

        let mut out = vec![
            "-c:v".to_string(),
            encoder.clone(),
            "-b:v".to_string(),
            format_bitrate(bitrate),
        ];
        push_hardware_output_extras(&mut out, request);

        assemble(
            Backend::VideoToolbox,
            request,
            encoder,
            String::new(),
            RateControl::FixedBitrate { bitrate },
            Vec::new(),
            out,
        )
    }
}

pub struct SoftwareBackend;

impl SoftwareBackend {
    pub fn encoder_name(codec: Codec) -> &'static str {
        match codec {
            Codec::H264 => "libx264",
            Codec::H265 => "libx265",
            Codec::Av1 => "libaom-av1",
            Codec::Vp9 => "libvpx-vp9",
        }
    }
}

impl EncodeBackend for SoftwareBackend {
    fn backend(&self) -> Backend {
        Backend::Software
    }

    fn supports(&self, _codec: Codec) -> bool {
        true
    }

    fn build(&self, request: &EncodeRequest) -> EncodeParameterSet {
        let encoder = Self::encoder_name(request.codec).to_string();
        let preset = request.preset.as_str().to_string();

        let mut out = vec!["-c:v".to_string(), encoder.clone(), "-preset".to_string(), preset.clone()];
        let rate_control = match request.target {
            QualityTarget::Quality(q) => {
                out.extend(["-crf".to_string(), q.to_string()]);
                RateControl::ConstantQuality { value: q }
            }
            QualityTarget::Bitrate(b) => {
                out.extend(["-b:v".to_string(), format_bitrate(b)]);
                // libx265 takes its pass settings through -x265-params.
                if request.two_pass && request.codec != Codec::H265 {
                    RateControl::TwoPass { bitrate: b }
                } else {
                    RateControl::FixedBitrate { bitrate: b }
                }
            }
        };
        if let Some(threads) = request.threads {
            out.extend(["-threads".to_string(), threads.to_string()]);
        }

        match request.codec {
            Codec::H264 => {
                out.extend(args(&["-profile:v", "high", "-level"]));
                out.push(h264_level_for(request).to_string());
                out.extend(args(&[
                    "-x264-params",
                    "aq-mode=3:aq-strength=1.0:deblock=-1,-1",
                ]));
            }
            Codec::H265 => out.extend(args(&["-profile:v", "main", "-level", "4.1"])),
            Codec::Av1 | Codec::Vp9 => {}
        }

        assemble(
            Backend::Software,
            request,
            encoder,
            preset,
            rate_control,
            Vec::new(),
            out,
        )
    }
}
