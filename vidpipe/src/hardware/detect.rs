//! Accelerator detection and the process-wide capability cache.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::{AcceleratorInfo, Codec, HardwareCapabilities, Vendor};
use crate::config::ToolPaths;
use crate::media::{ProcessRunner, ToolInvocation, ToolRunner};

/// Discovers the accelerators present on this machine.
///
/// Detection never fails: a missing or misbehaving probe tool simply means
/// that vendor is absent.
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn detect(&self) -> HardwareCapabilities;
}

/// A probe that reports a fixed set of capabilities.
#[derive(Debug, Clone)]
pub struct StaticProbe(pub HardwareCapabilities);

impl StaticProbe {
    pub fn software_only() -> Self {
        Self(HardwareCapabilities::software_only())
    }
}

#[async_trait]
impl CapabilityProbe for StaticProbe {
    async fn detect(&self) -> HardwareCapabilities {
        self.0.clone()
    }
}

/// Probes the system with `nvidia-smi`, `lspci` and `sysctl`.
pub struct SystemProbe {
    runner: Arc<dyn ToolRunner>,
    nvidia_smi: PathBuf,
    lspci: PathBuf,
    sysctl: PathBuf,
    timeout: Duration,
}

impl SystemProbe {
    pub fn new(runner: Arc<dyn ToolRunner>, tools: &ToolPaths) -> Self {
        Self {
            runner,
            nvidia_smi: tools.nvidia_smi.clone(),
            lspci: tools.lspci.clone(),
            sysctl: tools.sysctl.clone(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a query tool, returning its stdout on a clean exit.
    async fn query(&self, program: &Path, args: &[&str]) -> Option<String> {
        let invocation = ToolInvocation::new(
            program,
            args.iter().map(|a| a.to_string()).collect(),
        )
        .with_timeout(self.timeout)
        .capturing_stdout();

        match self
            .runner
            .run(&invocation, &CancellationToken::new(), None)
            .await
        {
            Ok(output) if output.success() => Some(output.stdout_text()),
            Ok(output) => {
                debug!(program = %invocation.program_name(), reason = %output.failure_summary(), "Capability query failed");
                None
            }
            Err(e) => {
                debug!(program = %invocation.program_name(), error = %e, "Capability query unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl CapabilityProbe for SystemProbe {
    async fn detect(&self) -> HardwareCapabilities {
        let mut accelerators = Vec::new();

        if let Some(out) = self
            .query(
                &self.nvidia_smi,
                &[
                    "--query-gpu=name,memory.total,driver_version",
                    "--format=csv,noheader,nounits",
                ],
            )
            .await
        {
            accelerators.extend(parse_nvidia_smi(&out));
        }

        if cfg!(target_os = "linux")
            && let Some(out) = self.query(&self.lspci, &["-nn"]).await
        {
            accelerators.extend(parse_lspci(&out));
        }

        if cfg!(target_os = "macos")
            && let Some(out) = self
                .query(&self.sysctl, &["-n", "machdep.cpu.brand_string"])
                .await
            && let Some(apple) = parse_apple_brand(&out)
        {
            accelerators.push(apple);
        }

        HardwareCapabilities {
            accelerators,
            detected_at: Utc::now(),
        }
    }
}

/// Advisory limits and codec support per vendor.
fn vendor_profile(vendor: Vendor, name: &str) -> (Vec<Codec>, u32, u32, f64) {
    match vendor {
        Vendor::Nvidia => (vec![Codec::H264, Codec::H265, Codec::Av1], 8192, 8192, 240.0),
        Vendor::Intel => (vec![Codec::H264, Codec::H265], 4096, 4096, 120.0),
        Vendor::Amd => (vec![Codec::H264, Codec::H265], 4096, 2160, 120.0),
        Vendor::Apple => {
            let (w, h) = if name.contains("Max") || name.contains("Ultra") {
                (7680, 4320)
            } else {
                (4096, 4096)
            };
            (vec![Codec::H264, Codec::H265], w, h, 120.0)
        }
    }
}

fn accelerator(
    vendor: Vendor,
    name: String,
    memory_mb: Option<u64>,
    driver_version: Option<String>,
) -> AcceleratorInfo {
    let (supported_codecs, max_width, max_height, max_fps) = vendor_profile(vendor, &name);
    AcceleratorInfo {
        vendor,
        name,
        memory_mb,
        driver_version,
        supported_codecs,
        max_width,
        max_height,
        max_fps,
    }
}

/// Parse `name, memory_mb, driver` rows.
pub fn parse_nvidia_smi(output: &str) -> Vec<AcceleratorInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let name = fields.next().filter(|n| !n.is_empty())?;
            let memory_mb = fields.next().and_then(|m| m.parse().ok());
            let driver = fields
                .next()
                .filter(|d| !d.is_empty())
                .map(str::to_string);
            Some(accelerator(Vendor::Nvidia, name.to_string(), memory_mb, driver))
        })
        .collect()
}

/// Pick Intel and AMD display controllers out of `lspci -nn`.
pub fn parse_lspci(output: &str) -> Vec<AcceleratorInfo> {
    output
        .lines()
        .filter(|line| {
            line.contains("VGA compatible controller")
                || line.contains("Display controller")
                || line.contains("3D controller")
        })
        .filter_map(|line| {
            let vendor = if line.contains("Intel") {
                Vendor::Intel
            } else if line.contains("AMD") || line.contains("ATI") || line.contains("Radeon") {
                Vendor::Amd
            } else {
                return None;
            };
            // "00:02.0 VGA compatible controller [0300]: Intel Corporation ..."
            let name = line
                .split_once("]: ")
                .or_else(|| line.split_once(": "))
                .map(|(_, rest)| rest.trim())
                .unwrap_or(line)
                .to_string();
            Some(accelerator(vendor, name, None, None))
        })
        .collect()
}

/// Recognize Apple Silicon from the CPU brand string.
pub fn parse_apple_brand(output: &str) -> Option<AcceleratorInfo> {
    let brand = output.trim();
    brand
        .starts_with("Apple")
        .then(|| accelerator(Vendor::Apple, brand.to_string(), None, None))
}

/// Read-mostly cache of detected capabilities.
///
/// Detection runs on first use and again only on [`refresh`](Self::refresh).
/// Concurrent first callers wait for a single detection.
pub struct CapabilityCache {
    probe: Arc<dyn CapabilityProbe>,
    cached: RwLock<Option<Arc<HardwareCapabilities>>>,
    detecting: tokio::sync::Mutex<()>,
}

static GLOBAL_CACHE: OnceLock<Arc<CapabilityCache>> = OnceLock::new();

impl CapabilityCache {
    pub fn new(probe: Arc<dyn CapabilityProbe>) -> Self {
        Self {
            probe,
            cached: RwLock::new(None),
            detecting: tokio::sync::Mutex::new(()),
        }
    }

    /// The process-wide cache. The first caller's tool paths win.
    pub fn global(tools: &ToolPaths) -> Arc<CapabilityCache> {
        GLOBAL_CACHE
            .get_or_init(|| {
                let probe = SystemProbe::new(Arc::new(ProcessRunner::new()), tools);
                Arc::new(CapabilityCache::new(Arc::new(probe)))
            })
            .clone()
    }

    /// Cached capabilities, detecting them on first use.
    pub async fn get(&self) -> Arc<HardwareCapabilities> {
        if let Some(caps) = self.peek() {
            return caps;
        }

        let _guard = self.detecting.lock().await;
        if let Some(caps) = self.peek() {
            return caps;
        }
        self.detect_and_store().await
    }

    /// Re-run detection and replace the cached snapshot.
    pub async fn refresh(&self) -> Arc<HardwareCapabilities> {
        let _guard = self.detecting.lock().await;
        self.detect_and_store().await
    }

    /// Snapshot without triggering detection.
    pub fn peek(&self) -> Option<Arc<HardwareCapabilities>> {
        self.cached.read().clone()
    }

    async fn detect_and_store(&self) -> Arc<HardwareCapabilities> {
        let caps = Arc::new(self.probe.detect().await);
        if caps.accelerators.is_empty() {
            info!("No hardware encoders detected");
        } else {
            for acc in &caps.accelerators {
                info!(vendor = %acc.vendor, name = %acc.name, "Detected hardware encoder");
            }
        }
        *self.cached.write() = Some(caps.clone());
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_nvidia_smi() {
        let out = "NVIDIA GeForce RTX 3080, 10240, 535.54.03\nTesla T4, 15360, 535.54.03\n";
        let gpus = parse_nvidia_smi(out);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 3080");
        assert_eq!(gpus[0].memory_mb, Some(10240));
        assert_eq!(gpus[0].driver_version.as_deref(), Some("535.54.03"));
        assert!(gpus[0].supports(Codec::Av1));
        assert_eq!(gpus[0].max_width, 8192);
    }

    #[test]
    fn test_parse_lspci() {
        let out = "\
00:00.0 Host bridge [0600]: Intel Corporation 8th Gen Core Processor Host Bridge [8086:3ec4]
00:02.0 VGA compatible controller [0300]: Intel Corporation UHD Graphics 630 [8086:3e9b]
01:00.0 VGA compatible controller [0300]: NVIDIA Corporation TU104 [10de:1e87]
03:00.0 Display controller [0380]: Advanced Micro Devices, Inc. [AMD/ATI] Navi 14 [1002:7340]
";
        let found = parse_lspci(out);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].vendor, Vendor::Intel);
        assert!(found[0].name.starts_with("Intel Corporation UHD"));
        assert_eq!(found[1].vendor, Vendor::Amd);
        assert_eq!((found[1].max_width, found[1].max_height), (4096, 2160));
    }

    #[test]
    fn test_parse_apple_brand() {
        let max = parse_apple_brand("Apple M2 Max\n").unwrap();
        assert_eq!((max.max_width, max.max_height), (7680, 4320));
        let base = parse_apple_brand("Apple M1").unwrap();
        assert_eq!(base.max_width, 4096);
        assert!(parse_apple_brand("Intel(R) Core(TM) i9-9880H").is_none());
    }

    struct CountingProbe(AtomicUsize);

    #[async_trait]
    impl CapabilityProbe for CountingProbe {
        async fn detect(&self) -> HardwareCapabilities {
            self.0.fetch_add(1, Ordering::SeqCst);
            HardwareCapabilities::software_only()
        }
    }

    #[tokio::test]
    async fn test_cache_detects_once_until_refresh() {
        let probe = Arc::new(CountingProbe(AtomicUsize::new(0)));
        let cache = Arc::new(CapabilityCache::new(probe.clone()));
        assert!(cache.peek().is_none());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get().await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(probe.0.load(Ordering::SeqCst), 1);

        cache.refresh().await;
        cache.get().await;
        assert_eq!(probe.0.load(Ordering::SeqCst), 2);
    }
}
