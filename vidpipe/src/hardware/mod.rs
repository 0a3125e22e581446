//! Hardware capability negotiation.
//!
//! Detects accelerators once per process, then maps abstract encode requests
//! (codec, preset, quality or bitrate) onto the best available backend's
//! ffmpeg flags. Backends are tried in a fixed vendor order: NVIDIA, Intel,
//! AMD, Apple, then software.

mod backends;
mod detect;
mod negotiator;
mod types;

pub use backends::{
    DEFAULT_CRF, EncodeBackend, NvencBackend, QsvBackend, SoftwareBackend,
    VIDEOTOOLBOX_DEFAULT_BITRATE, VaapiBackend, VideoToolboxBackend, all_backends, backend_for,
    recommended_h264_level,
};
pub use detect::{
    CapabilityCache, CapabilityProbe, StaticProbe, SystemProbe, parse_apple_brand, parse_lspci,
    parse_nvidia_smi,
};
pub use negotiator::{HardwareNegotiator, select_for};
pub use types::{
    AcceleratorInfo, Backend, Codec, EncodeParameterSet, EncodeRequest, HardwareCapabilities,
    Preset, QualityTarget, RateControl, Vendor, format_bitrate,
};
