//! Backend selection.

use std::sync::Arc;

use tracing::{info, warn};

use super::backends::{EncodeBackend, SoftwareBackend, all_backends};
use super::detect::CapabilityCache;
use super::types::{
    AcceleratorInfo, Backend, EncodeParameterSet, EncodeRequest, HardwareCapabilities,
};

/// Turns an abstract [`EncodeRequest`] into concrete encoder parameters.
///
/// Selection never fails. When no accelerator can serve the request the
/// software path is used and the fallback is logged.
#[derive(Clone)]
pub struct HardwareNegotiator {
    cache: Arc<CapabilityCache>,
    hardware_enabled: bool,
}

impl HardwareNegotiator {
    pub fn new(cache: Arc<CapabilityCache>) -> Self {
        Self {
            cache,
            hardware_enabled: true,
        }
    }

    /// Disable hardware backends entirely.
    pub fn with_hardware(mut self, enabled: bool) -> Self {
        self.hardware_enabled = enabled;
        self
    }

    pub async fn select_params(&self, request: &EncodeRequest) -> EncodeParameterSet {
        if !self.hardware_enabled {
            return SoftwareBackend.build(request);
        }
        let caps = self.cache.get().await;
        select_for(&caps, request)
    }

    pub async fn refresh(&self) -> Arc<HardwareCapabilities> {
        self.cache.refresh().await
    }

    pub async fn capabilities(&self) -> Arc<HardwareCapabilities> {
        self.cache.get().await
    }
}

/// Pick parameters for `request` given a capability snapshot.
pub fn select_for(caps: &HardwareCapabilities, request: &EncodeRequest) -> EncodeParameterSet {
    for backend in all_backends() {
        let Some(vendor) = backend.backend().vendor() else {
            continue;
        };
        if !backend.supports(request.codec) {
            continue;
        }
        let Some(acc) = caps
            .accelerators
            .iter()
            .find(|a| a.vendor == vendor && a.supports(request.codec))
        else {
            continue;
        };

        warn_if_beyond_limits(acc, backend.backend(), request);
        info!(backend = %backend.backend(), accelerator = %acc.name, codec = %request.codec, "Selected hardware encoder");
        return backend.build(request);
    }

    if caps.accelerators.is_empty() {
        info!(codec = %request.codec, "Using software encoder");
    } else {
        warn!(
            codec = %request.codec,
            "No hardware encoder supports the requested codec, falling back to software"
        );
    }
    SoftwareBackend.build(request)
}

fn warn_if_beyond_limits(acc: &AcceleratorInfo, backend: Backend, request: &EncodeRequest) {
    if let Some((w, h)) = request.resolution
        && (w > acc.max_width || h > acc.max_height)
    {
        warn!(
            %backend,
            requested = %format!("{}x{}", w, h),
            max = %format!("{}x{}", acc.max_width, acc.max_height),
            "Requested resolution exceeds accelerator limits"
        );
    }
    if let Some(fps) = request.fps
        && fps > acc.max_fps
    {
        warn!(%backend, requested = fps, max = acc.max_fps, "Requested frame rate exceeds accelerator limits");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::detect::{StaticProbe, parse_apple_brand, parse_lspci, parse_nvidia_smi};
    use crate::hardware::types::Codec;
    use chrono::Utc;

    fn caps(accelerators: Vec<AcceleratorInfo>) -> HardwareCapabilities {
        HardwareCapabilities {
            accelerators,
            detected_at: Utc::now(),
        }
    }

    fn nvidia() -> AcceleratorInfo {
        parse_nvidia_smi("RTX 4090, 24564, 550.0").remove(0)
    }

    fn intel() -> AcceleratorInfo {
        parse_lspci("00:02.0 VGA compatible controller [0300]: Intel Corporation Arc A770")
            .remove(0)
    }

    #[test]
    fn nvidia_wins_over_intel() {
        let snapshot = caps(vec![intel(), nvidia()]);
        let params = select_for(&snapshot, &EncodeRequest::new(Codec::H264));
        assert_eq!(params.backend, Backend::Nvenc);
    }

    #[test]
    fn unsupported_codec_falls_back_to_software() {
        let snapshot = caps(vec![nvidia(), intel()]);
        let params = select_for(&snapshot, &EncodeRequest::new(Codec::Av1));
        assert_eq!(params.backend, Backend::Software);
        assert_eq!(params.encoder, "libaom-av1");

        let vp9 = select_for(&snapshot, &EncodeRequest::new(Codec::Vp9));
        assert_eq!(vp9.encoder, "libvpx-vp9");
    }

    #[test]
    fn apple_uses_videotoolbox() {
        let snapshot = caps(vec![parse_apple_brand("Apple M3").unwrap()]);
        let params = select_for(&snapshot, &EncodeRequest::new(Codec::H265));
        assert_eq!(params.backend, Backend::VideoToolbox);
        assert_eq!(params.encoder, "hevc_videotoolbox");
    }

    #[test]
    fn exceeding_limits_still_selects_hardware() {
        let snapshot = caps(vec![intel()]);
        let request = EncodeRequest::new(Codec::H264)
            .with_resolution(7680, 4320)
            .with_fps(240.0);
        let params = select_for(&snapshot, &request);
        assert_eq!(params.backend, Backend::Qsv);
    }

    #[tokio::test]
    async fn negotiator_honors_disabled_hardware() {
        let cache = Arc::new(CapabilityCache::new(Arc::new(StaticProbe(caps(vec![nvidia()])))));
        let negotiator = HardwareNegotiator::new(cache.clone());
        assert_eq!(
            negotiator.select_params(&EncodeRequest::default()).await.backend,
            Backend::Nvenc
        );

        let software = HardwareNegotiator::new(cache).with_hardware(false);
        assert_eq!(
            software.select_params(&EncodeRequest::default()).await.backend,
            Backend::Software
        );
    }

    #[tokio::test]
    async fn software_only_machine() {
        let cache = Arc::new(CapabilityCache::new(Arc::new(StaticProbe::software_only())));
        let negotiator = HardwareNegotiator::new(cache);
        let params = negotiator.select_params(&EncodeRequest::default()).await;
        assert_eq!(params.backend, Backend::Software);
        assert_eq!(params.encoder, "libx264");
        assert!(negotiator.refresh().await.accelerators.is_empty());
    }
}
