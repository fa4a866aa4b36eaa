//! Minimal path tracer used to drive both execution paths.
//!
//! ## Architecture
//! ```text
//! Scene + Camera ─┬─> CpuRenderer (rayon, stop flag) ──> RGBA f32
//!                 └─> GpuPathTracer (pools + pipeline) ─> RGBA f32
//! ```
//! Both paths evaluate [`trace::sample_pixel`] with the same random
//! sequence, so equal sample counts give the same image.

mod camera;
mod cpu;
mod gpu;
mod scene;
pub mod trace;
mod worker;

pub use camera::Camera;
pub use cpu::CpuRenderer;
pub use gpu::{GpuPathTracer, PATHTRACE_ENTRY, PATHTRACE_WGSL};
pub use scene::{GpuPrimitive, Material, Primitive, PrimitiveKind, Scene};
pub use worker::{CpuWorker, WorkerCommand, WorkerResult};

use bytemuck::{Pod, Zeroable};

use crate::config::RenderConfig;

/// Storage slot of the primitive array.
pub const SLOT_SCENE: u32 = 0;
/// Uniform slot of [`RenderUniforms`].
pub const SLOT_UNIFORMS: u32 = 1;
/// Storage slot of the RGBA accumulation buffer.
pub const SLOT_ACCUMULATION: u32 = 2;

/// Image size and path budget for one render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub max_depth: u32,
}

impl RenderSettings {
    pub fn new(width: u32, height: u32, samples: u32) -> Self {
        Self { width, height, samples, max_depth: 8 }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }

    /// Bytes of the RGBA f32 accumulation buffer.
    pub fn accumulation_bytes(&self) -> u64 {
        self.pixel_count() as u64 * 16
    }
}

impl Default for RenderSettings {
    fn default() -> Self {
        (&RenderConfig::default()).into()
    }
}

impl From<&RenderConfig> for RenderSettings {
    fn from(c: &RenderConfig) -> Self {
        Self { width: c.width, height: c.height, samples: c.samples, max_depth: c.max_depth }
    }
}

/// Kernel uniforms. Samples `[sample_offset, samples_per_pixel)` are traced;
/// a zero offset overwrites the accumulation buffer instead of adding to it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RenderUniforms {
    pub image_width: u32,
    pub image_height: u32,
    pub samples_per_pixel: u32,
    pub max_depth: u32,
    pub sphere_count: u32,
    pub sample_offset: u32,
    pub _pad: [u32; 2],
    pub position: [f32; 4],
    pub lower_left: [f32; 4],
    pub horizontal: [f32; 4],
    pub vertical: [f32; 4],
}

impl RenderUniforms {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(settings: &RenderSettings, primitive_count: usize, camera: &Camera) -> Self {
        Self {
            image_width: settings.width,
            image_height: settings.height,
            samples_per_pixel: settings.samples,
            max_depth: settings.max_depth,
            sphere_count: primitive_count as u32,
            sample_offset: 0,
            _pad: [0; 2],
            position: camera.position.extend(0.0).to_array(),
            lower_left: camera.lower_left.extend(0.0).to_array(),
            horizontal: camera.horizontal.extend(0.0).to_array(),
            vertical: camera.vertical.extend(0.0).to_array(),
        }
    }

    /// Same frame, samples `[start, end)`.
    pub fn with_samples(mut self, start: u32, end: u32) -> Self {
        self.sample_offset = start;
        self.samples_per_pixel = end;
        self
    }

    pub fn camera(&self) -> Camera {
        let v = |a: [f32; 4]| glam::Vec4::from_array(a).truncate();
        Camera {
            position: v(self.position),
            lower_left: v(self.lower_left),
            horizontal: v(self.horizontal),
            vertical: v(self.vertical),
        }
    }

    pub fn settings(&self) -> RenderSettings {
        RenderSettings {
            width: self.image_width,
            height: self.image_height,
            samples: self.samples_per_pixel,
            max_depth: self.max_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layout() {
        assert_eq!(RenderUniforms::SIZE, 96);
        assert_eq!(std::mem::offset_of!(RenderUniforms, position), 32);
        let cam = Camera::demo(2.0);
        let u = RenderUniforms::new(&RenderSettings::new(64, 32, 4), 5, &cam).with_samples(4, 8);
        assert_eq!(u.camera(), cam);
        assert_eq!(u.sample_offset, 4);
        assert_eq!(u.settings().samples, 8);
    }

    #[test]
    fn test_settings_from_config() {
        let s = RenderSettings::default();
        assert_eq!((s.width, s.height), (320, 240));
        assert_eq!(s.accumulation_bytes(), 320 * 240 * 16);
    }
}
