//! # hybrid-trace
//!
//! Hybrid GPU/CPU execution engine for progressive Monte-Carlo path tracing.
//!
//! The engine decides per render whether the GPU or the CPU should do the
//! work, manages GPU memory and compute programs behind a runtime capability
//! object, and drives multi-step GPU rendering from a single-threaded main
//! loop without ever blocking it.
//!
//! ## Modules
//!
//! - [`util`] - Error type, math helpers
//! - [`config`] - JSON configuration with per-user defaults
//! - [`gpu`] - Backends, memory manager, compute pipeline, optimizer, monitor
//! - [`selector`] - CPU vs GPU prediction and adaptive selection
//! - [`scheduler`] - Non-blocking progressive GPU scheduler
//! - [`render`] - Minimal sphere/cube path tracer (CPU and GPU kernels)
//! - [`engine`] - [`HybridEngine`] facade tying everything together
//!
//! ## Example
//!
//! ```ignore
//! use hybrid_trace::prelude::*;
//!
//! let mut engine = HybridEngine::from_config(EngineConfig::load())?;
//! let settings = RenderSettings::new(320, 240, 16);
//! engine.start_progressive(&Scene::demo(), &Camera::demo(settings.aspect()), &settings)?;
//! while engine.scheduler().is_active() {
//!     engine.tick(&mut |px: &[f32], w, h, cur, target| { /* show px */ })?;
//! }
//! ```

pub mod config;
pub mod engine;
pub mod gpu;
pub mod render;
pub mod scheduler;
pub mod selector;
pub mod util;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::HybridEngine;
pub use util::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{BackendKind, EngineConfig};
    pub use crate::engine::{BenchResult, HybridEngine, RenderOutput};
    pub use crate::gpu::{GpuBackend, GpuContext, NullBackend, SoftwareBackend};
    pub use crate::render::{Camera, Material, Primitive, RenderSettings, Scene};
    pub use crate::scheduler::{FrameSink, ProgressiveScheduler, StepStatus};
    pub use crate::selector::{Backend, HybridSelector, SceneCharacteristics, SelectionMode};
    pub use crate::util::{Error, Result};
}
