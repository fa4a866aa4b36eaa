//! Multi-threaded CPU path tracing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use rayon::prelude::*;

use super::camera::Camera;
use super::scene::Scene;
use super::trace::sample_pixel;
use super::RenderSettings;
use crate::util::{Error, Result, Vec3};

/// Row-parallel renderer over the shared tracing kernel.
pub struct CpuRenderer;

impl CpuRenderer {
    /// Render `settings.samples` samples per pixel into RGBA f32 (alpha 1).
    ///
    /// `stop` is polled per pixel and per sample; once set the render
    /// returns [`Error::Cancelled`]. `progress(rows_done, height)` is called
    /// from worker threads as rows finish.
    #[tracing::instrument(skip_all, fields(w = settings.width, h = settings.height, spp = settings.samples))]
    pub fn render(
        scene: &Scene,
        camera: &Camera,
        settings: &RenderSettings,
        stop: &AtomicBool,
        progress: Option<&(dyn Fn(u32, u32) + Sync)>,
    ) -> Result<Vec<f32>> {
        let (width, height) = (settings.width, settings.height);
        if width == 0 || height == 0 {
            return Err(Error::Config(format!("empty image {width}x{height}")));
        }
        let samples = settings.samples.max(1);
        let prims = scene.primitives.as_slice();
        let rows_done = AtomicU32::new(0);
        let mut pixels = vec![0.0f32; settings.pixel_count() * 4];

        pixels
            .par_chunks_mut(width as usize * 4)
            .enumerate()
            .try_for_each(|(y, row)| -> Result<()> {
                let y = y as u32;
                for x in 0..width {
                    if stop.load(Ordering::Relaxed) {
                        return Err(Error::Cancelled);
                    }
                    let mut sum = Vec3::ZERO;
                    for s in 0..samples {
                        if stop.load(Ordering::Relaxed) {
                            return Err(Error::Cancelled);
                        }
                        sum += sample_pixel(prims, camera, width, height, x, y, s, settings.max_depth);
                    }
                    let c = sum / samples as f32;
                    let i = x as usize * 4;
                    row[i..i + 4].copy_from_slice(&[c.x, c.y, c.z, 1.0]);
                }
                let done = rows_done.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(cb) = progress {
                    cb(done, height);
                }
                Ok(())
            })?;

        tracing::debug!("cpu render finished");
        Ok(pixels)
    }
}
