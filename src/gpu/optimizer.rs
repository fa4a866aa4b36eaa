//! Hardware detection and work-group sizing.

use std::collections::VecDeque;
use std::fmt;

use bitflags::bitflags;
use serde::Serialize;

use super::backend::{DeviceLimits, GpuContext, WorkGroupSize};
use crate::config::OptimizerConfig;
use crate::util::Result;

/// Smallest thread-group size the adaptive tuning will go down to.
pub const MIN_THREAD_GROUP_SIZE: u32 = 8;

/// Below this pixel count the thread-group size is halved.
const SMALL_IMAGE_PIXELS: u64 = 256 * 256;
/// Above this pixel count the thread-group size is doubled.
const LARGE_IMAGE_PIXELS: u64 = 1024 * 1024;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Other,
}

impl GpuVendor {
    /// Classify from the driver's vendor and renderer strings.
    pub fn classify(vendor: &str, renderer: &str) -> Self {
        let s = format!("{vendor} {renderer}").to_ascii_lowercase();
        if s.contains("nvidia") || s.contains("geforce") || s.contains("quadro") {
            Self::Nvidia
        } else if s.contains("amd") || s.contains("ati technologies") || s.contains("radeon") {
            Self::Amd
        } else if s.contains("intel") {
            Self::Intel
        } else {
            Self::Other
        }
    }

    /// PCI vendor id, as reported by native backends.
    pub fn from_pci_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 | 0x1022 => Self::Amd,
            0x8086 => Self::Intel,
            _ => Self::Other,
        }
    }

    /// Warp/wavefront-aligned default thread-group size.
    pub fn default_thread_group_size(self) -> u32 {
        match self {
            Self::Nvidia => 32,
            Self::Amd => 64,
            Self::Intel | Self::Other => 16,
        }
    }

    pub fn tuning(self) -> VendorTuning {
        match self {
            Self::Nvidia => VendorTuning::WARP_32 | VendorTuning::ASYNC_COMPUTE | VendorTuning::FAST_SHARED_MEMORY,
            Self::Amd => VendorTuning::WAVE_64 | VendorTuning::ASYNC_COMPUTE,
            Self::Intel => VendorTuning::SMALL_GROUPS | VendorTuning::SHARED_SYSTEM_MEMORY,
            Self::Other => VendorTuning::SMALL_GROUPS,
        }
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nvidia => "NVIDIA",
            Self::Amd => "AMD",
            Self::Intel => "Intel",
            Self::Other => "other",
        })
    }
}

bitflags! {
    /// Vendor-specific tuning hints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VendorTuning: u32 {
        const WARP_32 = 1 << 0;
        const WAVE_64 = 1 << 1;
        const SMALL_GROUPS = 1 << 2;
        const ASYNC_COMPUTE = 1 << 3;
        const FAST_SHARED_MEMORY = 1 << 4;
        /// Integrated part sharing system RAM
        const SHARED_SYSTEM_MEMORY = 1 << 5;
    }
}

/// What the optimizer knows about the device.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareProfile {
    pub vendor: GpuVendor,
    pub vendor_name: String,
    pub model: String,
    /// Rough compute unit (SM/CU/EU cluster) estimate
    pub compute_units: u32,
    /// Rough memory bandwidth estimate in GB/s
    pub memory_bandwidth_gbps: f32,
    pub optimal_thread_group_size: u32,
    pub limits: DeviceLimits,
    pub tuning: VendorTuning,
}

impl Default for HardwareProfile {
    fn default() -> Self {
        let vendor = GpuVendor::Other;
        Self {
            vendor,
            vendor_name: "unknown".into(),
            model: "unknown".into(),
            compute_units: 1,
            memory_bandwidth_gbps: 0.0,
            optimal_thread_group_size: vendor.default_thread_group_size(),
            limits: DeviceLimits::default(),
            tuning: vendor.tuning(),
        }
    }
}

impl fmt::Display for HardwareProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "vendor:        {} ({})", self.vendor, self.vendor_name)?;
        writeln!(f, "model:         {}", self.model)?;
        writeln!(f, "compute units: ~{}", self.compute_units)?;
        writeln!(f, "bandwidth:     ~{:.0} GB/s", self.memory_bandwidth_gbps)?;
        writeln!(f, "thread group:  {}", self.optimal_thread_group_size)?;
        writeln!(
            f,
            "limits:        group {:?}, invocations {}, count {:?}",
            self.limits.max_work_group_size, self.limits.max_invocations, self.limits.max_work_group_count
        )?;
        write!(f, "tuning:        {:?}", self.tuning)
    }
}

/// One throughput observation fed to the adaptive tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningSample {
    pub thread_group_size: u32,
    pub performance: f64,
    pub target: f64,
}

/// Detects the device and picks work-group sizes for it.
pub struct HardwareOptimizer {
    ctx: GpuContext,
    config: OptimizerConfig,
    profile: HardwareProfile,
    detected: bool,
    history: VecDeque<TuningSample>,
}

impl HardwareOptimizer {
    pub fn new(ctx: GpuContext, config: OptimizerConfig) -> Self {
        Self {
            ctx,
            config,
            profile: HardwareProfile::default(),
            detected: false,
            history: VecDeque::new(),
        }
    }

    /// Read vendor/renderer strings and limits, then derive the profile.
    pub fn detect_hardware_capabilities(&mut self) -> Result<&HardwareProfile> {
        self.ctx.check_thread()?;
        let info = self.ctx.adapter_info().clone();
        let limits = self.ctx.limits().clone();
        let vendor = GpuVendor::classify(&info.vendor, &info.renderer);
        let (compute_units, bandwidth) = estimate_throughput(vendor, &info.renderer);

        let max = limits.max_invocations.max(1);
        self.profile = HardwareProfile {
            vendor,
            vendor_name: info.vendor,
            model: info.renderer,
            compute_units,
            memory_bandwidth_gbps: bandwidth,
            optimal_thread_group_size: vendor.default_thread_group_size().min(max),
            limits,
            tuning: vendor.tuning(),
        };
        self.detected = true;
        tracing::info!(
            vendor = %self.profile.vendor,
            model = %self.profile.model,
            thread_group = self.profile.optimal_thread_group_size,
            "hardware detected"
        );
        Ok(&self.profile)
    }

    pub fn is_detected(&self) -> bool {
        self.detected
    }

    pub fn profile(&self) -> &HardwareProfile {
        &self.profile
    }

    /// 1-D thread-group size for an image of `width x height`.
    pub fn optimal_thread_group_size(&self, width: u32, height: u32) -> u32 {
        let base = self.profile.optimal_thread_group_size;
        let max = self.profile.limits.max_invocations.max(1);
        let pixels = width as u64 * height as u64;
        let size = if pixels < SMALL_IMAGE_PIXELS {
            base / 2
        } else if pixels > LARGE_IMAGE_PIXELS {
            base.saturating_mul(2)
        } else {
            base
        };
        size.clamp(MIN_THREAD_GROUP_SIZE.min(max), max)
    }

    /// Most square (x, y) factorization of the 1-D size, x >= y.
    pub fn optimal_work_group_dimensions(&self, width: u32, height: u32) -> WorkGroupSize {
        let size = self.optimal_thread_group_size(width, height);
        let (x, y) = square_factors(size);
        let [mx, my, _] = self.profile.limits.max_work_group_size;
        WorkGroupSize::new(x.min(mx.max(1)), y.min(my.max(1)), 1)
    }

    /// Work groups needed to cover `width x height` (ceil division).
    pub fn dispatch_groups(width: u32, height: u32, work_group: WorkGroupSize) -> [u32; 3] {
        [
            width.div_ceil(work_group.x.max(1)),
            height.div_ceil(work_group.y.max(1)),
            1,
        ]
    }

    /// Grow or shrink the thread-group size by 20% when performance drifts
    /// outside [0.8, 1.2] of the target.
    pub fn update_optimization_based_on_performance(&mut self, current: f64, target: f64) {
        if !self.config.adaptive || target <= 0.0 || !current.is_finite() {
            return;
        }
        let size = self.profile.optimal_thread_group_size;
        self.history.push_back(TuningSample { thread_group_size: size, performance: current, target });
        while self.history.len() > self.config.history_size.max(1) {
            self.history.pop_front();
        }

        let ratio = current / target;
        let scaled = if ratio < 0.8 {
            (size as f64 * 0.8).round() as u32
        } else if ratio > 1.2 {
            (size as f64 * 1.2).round() as u32
        } else {
            return;
        };
        let max = self.profile.limits.max_invocations.max(MIN_THREAD_GROUP_SIZE);
        let new_size = scaled.clamp(MIN_THREAD_GROUP_SIZE, max);
        if new_size != size {
            tracing::debug!(from = size, to = new_size, ratio, "thread group size adjusted");
            self.profile.optimal_thread_group_size = new_size;
        }
    }

    /// Mean observed performance over the tuning history.
    pub fn average_performance(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().map(|s| s.performance).sum::<f64>() / self.history.len() as f64)
    }

    pub fn history(&self) -> impl Iterator<Item = &TuningSample> {
        self.history.iter()
    }
}

/// Most square factor pair of `n` with `x >= y`.
fn square_factors(n: u32) -> (u32, u32) {
    let n = n.max(1);
    let mut y = (n as f64).sqrt() as u32;
    while y > 1 && n % y != 0 {
        y -= 1;
    }
    let y = y.max(1);
    (n / y, y)
}

/// Compute-unit and bandwidth guesses; drivers do not report these portably.
fn estimate_throughput(vendor: GpuVendor, renderer: &str) -> (u32, f32) {
    let r = renderer.to_ascii_lowercase();
    match vendor {
        GpuVendor::Nvidia if r.contains("rtx 40") => (76, 716.0),
        GpuVendor::Nvidia if r.contains("rtx") => (46, 448.0),
        GpuVendor::Nvidia => (20, 192.0),
        GpuVendor::Amd if r.contains("rx 7") => (60, 576.0),
        GpuVendor::Amd => (36, 448.0),
        GpuVendor::Intel if r.contains("arc") => (32, 512.0),
        GpuVendor::Intel => (8, 68.0),
        GpuVendor::Other => (rayon::current_num_threads() as u32, 25.6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareBackend;

    fn optimizer(vendor: &str, renderer: &str) -> HardwareOptimizer {
        let sw = SoftwareBackend::new().with_adapter(vendor, renderer);
        let mut opt = HardwareOptimizer::new(GpuContext::new(Box::new(sw)), OptimizerConfig::default());
        opt.detect_hardware_capabilities().unwrap();
        opt
    }

    #[test]
    fn test_vendor_classification() {
        assert_eq!(GpuVendor::classify("NVIDIA Corporation", "GeForce RTX 3080"), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::classify("ATI Technologies Inc.", "Radeon Pro"), GpuVendor::Amd);
        assert_eq!(GpuVendor::classify("Intel", "Iris Xe"), GpuVendor::Intel);
        assert_eq!(GpuVendor::classify("Mesa", "llvmpipe"), GpuVendor::Other);
        assert_eq!(GpuVendor::from_pci_id(0x1022), GpuVendor::Amd);
    }

    #[test]
    fn test_default_sizes_per_vendor() {
        assert_eq!(optimizer("NVIDIA", "RTX").profile().optimal_thread_group_size, 32);
        assert_eq!(optimizer("AMD", "Radeon").profile().optimal_thread_group_size, 64);
        assert_eq!(optimizer("Intel", "UHD").profile().optimal_thread_group_size, 16);
        assert_eq!(optimizer("Mesa", "llvmpipe").profile().optimal_thread_group_size, 16);
    }

    #[test]
    fn test_thread_group_size_by_image() {
        let opt = optimizer("AMD", "Radeon");
        assert_eq!(opt.optimal_thread_group_size(128, 128), 32);
        assert_eq!(opt.optimal_thread_group_size(512, 512), 64);
        assert_eq!(opt.optimal_thread_group_size(2048, 2048), 128);
    }

    #[test]
    fn test_large_image_capped_at_max_invocations() {
        let sw = SoftwareBackend::new().with_adapter("AMD", "Radeon").with_limits(DeviceLimits {
            max_invocations: 96,
            ..DeviceLimits::default()
        });
        let mut opt = HardwareOptimizer::new(GpuContext::new(Box::new(sw)), OptimizerConfig::default());
        opt.detect_hardware_capabilities().unwrap();
        assert_eq!(opt.optimal_thread_group_size(4096, 4096), 96);
    }

    #[test]
    fn test_work_group_dimensions_are_square() {
        let opt = optimizer("NVIDIA", "GeForce");
        assert_eq!(opt.optimal_work_group_dimensions(512, 512), WorkGroupSize::new(8, 4, 1));
        let opt = optimizer("AMD", "Radeon");
        assert_eq!(opt.optimal_work_group_dimensions(512, 512), WorkGroupSize::new(8, 8, 1));
        assert_eq!(square_factors(16), (4, 4));
        assert_eq!(square_factors(7), (7, 1));
    }

    #[test]
    fn test_dispatch_groups_round_up() {
        let groups = HardwareOptimizer::dispatch_groups(100, 30, WorkGroupSize::new(8, 8, 1));
        assert_eq!(groups, [13, 4, 1]);
    }

    #[test]
    fn test_adaptive_update() {
        let mut opt = optimizer("AMD", "Radeon");
        opt.update_optimization_based_on_performance(50.0, 100.0);
        assert_eq!(opt.profile().optimal_thread_group_size, 51);
        opt.update_optimization_based_on_performance(100.0, 100.0);
        assert_eq!(opt.profile().optimal_thread_group_size, 51);
        opt.update_optimization_based_on_performance(200.0, 100.0);
        assert_eq!(opt.profile().optimal_thread_group_size, 61);

        for _ in 0..50 {
            opt.update_optimization_based_on_performance(1.0, 100.0);
        }
        assert_eq!(opt.profile().optimal_thread_group_size, MIN_THREAD_GROUP_SIZE);
        assert_eq!(opt.history().count(), 20);
        for _ in 0..50 {
            opt.update_optimization_based_on_performance(1000.0, 100.0);
        }
        assert_eq!(opt.profile().optimal_thread_group_size, 1024);
    }

    #[test]
    fn test_shrunk_base_keeps_minimum_on_small_image() {
        let mut opt = optimizer("AMD", "Radeon");
        for _ in 0..50 {
            opt.update_optimization_based_on_performance(1.0, 100.0);
        }
        assert_eq!(opt.profile().optimal_thread_group_size, MIN_THREAD_GROUP_SIZE);
        assert_eq!(opt.optimal_thread_group_size(64, 64), MIN_THREAD_GROUP_SIZE);
        assert_eq!(opt.optimal_work_group_dimensions(64, 64).total(), MIN_THREAD_GROUP_SIZE);
    }
}
