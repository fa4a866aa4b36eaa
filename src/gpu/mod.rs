//! GPU side of the hybrid engine.
//!
//! - [`GpuBackend`] / [`GpuContext`] - runtime capability object and thread pinning
//! - [`MemoryManager`] - buffer allocation, pooling and transfers
//! - [`ComputePipeline`] - program lifecycle, sync/async dispatch
//! - [`HardwareOptimizer`] - vendor detection and work-group sizing
//! - [`PerformanceMonitor`] - timings, speedup, regression checks

mod backend;
mod buffer;
mod memory;
mod monitor;
mod null;
mod optimizer;
mod pipeline;
pub mod software;
#[cfg(feature = "wgpu")]
mod wgpu_backend;

pub use backend::*;
pub use buffer::*;
pub use memory::{LeakedBuffer, MemoryManager, PoolOptimization};
pub use monitor::{PerformanceMeasurement, PerformanceMonitor};
pub use null::NullBackend;
pub use optimizer::{GpuVendor, HardwareOptimizer, HardwareProfile, TuningSample, VendorTuning, MIN_THREAD_GROUP_SIZE};
pub use pipeline::{ComputePipeline, DispatchStats, PipelineState};
pub use software::{KernelFn, KernelInvocation, SoftwareBackend, SoftwareConfig};
#[cfg(feature = "wgpu")]
pub use wgpu_backend::WgpuBackend;

use crate::config::BackendKind;

/// Build the backend for `kind`. Without a native device the result is a
/// [`NullBackend`], so callers fall back to the CPU; the software emulator is
/// only used when asked for explicitly.
pub fn create_backend(kind: BackendKind) -> Box<dyn GpuBackend> {
    match kind {
        BackendKind::Null => Box::new(NullBackend::new()),
        BackendKind::Software => Box::new(SoftwareBackend::new()),
        BackendKind::Wgpu | BackendKind::Auto => native_or_null(),
    }
}

#[cfg(feature = "wgpu")]
fn native_or_null() -> Box<dyn GpuBackend> {
    match WgpuBackend::new() {
        Ok(b) => Box::new(b),
        Err(e) => {
            tracing::warn!("no native GPU ({e}), running CPU-only");
            Box::new(NullBackend::with_reason(e.to_string()))
        }
    }
}

#[cfg(not(feature = "wgpu"))]
fn native_or_null() -> Box<dyn GpuBackend> {
    tracing::info!("built without the `wgpu` feature, running CPU-only");
    Box::new(NullBackend::with_reason("built without the `wgpu` feature"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_kinds() {
        assert!(!create_backend(BackendKind::Null).capabilities().compute_shaders);
        assert!(create_backend(BackendKind::Software).capabilities().compute_shaders);
    }

    #[test]
    #[cfg(not(feature = "wgpu"))]
    fn test_auto_without_device_is_null() {
        let ctx = GpuContext::new(create_backend(BackendKind::Auto));
        assert!(!ctx.is_available());
        assert!(!create_backend(BackendKind::Wgpu).capabilities().compute_shaders);
    }
}
