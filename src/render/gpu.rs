//! GPU path tracer: binds the memory manager and compute pipeline to the
//! tracing kernel.
//!
//! ## Usage
//! ```ignore
//! let mut pt = GpuPathTracer::new(ctx, MemoryConfig::default());
//! pt.initialize(WorkGroupSize::new(8, 8, 1))?;
//! pt.load_scene(&scene, &camera, &settings)?;
//! let rgba = pt.render(16)?; // blocking
//! ```
//! The progressive protocol (`begin_pass` / `poll_pass` / `finish_pass`) is
//! driven by [`ProgressiveScheduler`](crate::scheduler::ProgressiveScheduler).

use std::sync::Arc;

use rayon::prelude::*;

use super::camera::Camera;
use super::scene::{GpuPrimitive, Scene};
use super::trace::sample_pixel;
use super::{RenderSettings, RenderUniforms, SLOT_ACCUMULATION, SLOT_SCENE, SLOT_UNIFORMS};
use crate::config::MemoryConfig;
use crate::gpu::{
    BufferType, ComputePipeline, GpuBuffer, GpuContext, HardwareOptimizer, KernelFn, KernelInvocation,
    MemoryManager, PipelineState, ShaderSource, SoftwareBackend, UsagePattern, WorkGroupSize,
};
use crate::scheduler::ProgressiveTarget;
use crate::util::{Error, Result, Vec3};

/// WGSL source of the tracing kernel.
pub const PATHTRACE_WGSL: &str = include_str!("shaders/pathtrace.wgsl");
/// Compute entry point shared by the WGSL source and the software kernel.
pub const PATHTRACE_ENTRY: &str = "main";

/// Buffers of the currently loaded frame.
struct Frame {
    scene: Arc<GpuBuffer>,
    uniforms: Arc<GpuBuffer>,
    accumulation: Arc<GpuBuffer>,
    base: RenderUniforms,
    settings: RenderSettings,
}

#[derive(Debug, Clone, Copy)]
struct Pass {
    start: u32,
    end: u32,
    complete: bool,
}

pub struct GpuPathTracer {
    memory: MemoryManager,
    pipeline: ComputePipeline,
    work_group: WorkGroupSize,
    frame: Option<Frame>,
    pass: Option<Pass>,
}

impl GpuPathTracer {
    pub fn new(ctx: GpuContext, memory: MemoryConfig) -> Self {
        Self {
            memory: MemoryManager::new(ctx.clone(), memory),
            pipeline: ComputePipeline::new(ctx),
            work_group: WorkGroupSize::default(),
            frame: None,
            pass: None,
        }
    }

    /// Prepare memory pools and build the kernel for `work_group`.
    #[tracing::instrument(skip_all, fields(wg = %work_group))]
    pub fn initialize(&mut self, work_group: WorkGroupSize) -> Result<()> {
        self.memory.initialize()?;
        self.pipeline.initialize()?;
        let registered = self
            .memory
            .context()
            .with_backend::<SoftwareBackend, _>(|sw| sw.register_kernel(PATHTRACE_ENTRY, software_kernel()))?;
        if registered.is_some() {
            tracing::debug!("software kernel registered");
        }
        self.build(work_group)
    }

    /// Rebuild the kernel with another work-group size. Not allowed while a
    /// pass is in flight.
    pub fn set_work_group(&mut self, work_group: WorkGroupSize) -> Result<()> {
        if work_group == self.work_group && self.is_ready() {
            return Ok(());
        }
        self.ensure_no_pass()?;
        self.build(work_group)
    }

    fn build(&mut self, work_group: WorkGroupSize) -> Result<()> {
        let source = ShaderSource::new("pathtrace", PATHTRACE_WGSL, PATHTRACE_ENTRY);
        self.pipeline.compile_shader(&source)?;
        self.pipeline.link_program(work_group)?;
        self.pipeline.use_program()?;
        self.work_group = work_group;
        if let Some(frame) = &self.frame {
            bind_frame(&mut self.pipeline, frame)?;
        }
        tracing::debug!(%work_group, "path tracing kernel ready");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.pipeline.state() == PipelineState::Dispatchable
    }

    /// Upload the scene and size the frame buffers for `settings`.
    ///
    /// Buffers of a previously loaded frame go back to their pools first.
    #[tracing::instrument(skip_all, fields(prims = scene.len(), w = settings.width, h = settings.height))]
    pub fn load_scene(&mut self, scene: &Scene, camera: &Camera, settings: &RenderSettings) -> Result<()> {
        self.ensure_no_pass()?;
        if settings.width == 0 || settings.height == 0 {
            return Err(Error::Config(format!("empty image {}x{}", settings.width, settings.height)));
        }
        self.release_frame()?;

        let records = scene.to_gpu();
        let bytes: &[u8] = bytemuck::cast_slice(&records);
        if bytes.len() as u64 != scene.gpu_bytes() {
            return Err(Error::other(format!(
                "scene buffer is {} bytes, expected {} primitives x {}",
                bytes.len(),
                scene.len(),
                GpuPrimitive::SIZE
            )));
        }

        // An empty scene still needs a bindable buffer.
        let scene_size = scene.gpu_bytes().max(GpuPrimitive::SIZE as u64);
        let mut taken: Vec<Arc<GpuBuffer>> = Vec::with_capacity(3);
        let result = (|| -> Result<Frame> {
            let scene_buf = self.memory.allocate_from_pool(
                scene_size,
                BufferType::ShaderStorage,
                UsagePattern::Static,
                "pt.scene",
            )?;
            taken.push(Arc::clone(&scene_buf));
            let uniforms = self.memory.allocate_from_pool(
                RenderUniforms::SIZE as u64,
                BufferType::Uniform,
                UsagePattern::Dynamic,
                "pt.uniforms",
            )?;
            taken.push(Arc::clone(&uniforms));
            let accumulation = self.memory.allocate_from_pool(
                settings.accumulation_bytes(),
                BufferType::ShaderStorage,
                UsagePattern::Dynamic,
                "pt.accumulation",
            )?;
            taken.push(Arc::clone(&accumulation));

            if !bytes.is_empty() {
                self.memory.transfer_to_gpu(&scene_buf, bytes, 0)?;
            }
            Ok(Frame {
                scene: scene_buf,
                uniforms,
                accumulation,
                base: RenderUniforms::new(settings, scene.len(), camera),
                settings: *settings,
            })
        })();

        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                for b in &taken {
                    let _ = self.memory.release_to_pool(b);
                }
                return Err(e);
            }
        };
        bind_frame(&mut self.pipeline, &frame)?;
        self.frame = Some(frame);
        Ok(())
    }

    /// Return the frame buffers to their pools.
    pub fn release_frame(&mut self) -> Result<()> {
        self.ensure_no_pass()?;
        if let Some(frame) = self.frame.take() {
            self.pipeline.clear_bindings();
            for b in [&frame.scene, &frame.uniforms, &frame.accumulation] {
                self.memory.release_to_pool(b)?;
            }
        }
        Ok(())
    }

    /// Blocking render of `samples` samples per pixel into RGBA f32.
    #[tracing::instrument(skip_all)]
    pub fn render(&mut self, samples: u32) -> Result<Vec<f32>> {
        self.ensure_no_pass()?;
        let samples = samples.max(1);
        let groups = self.upload_uniforms(0, samples)?;
        self.pipeline.dispatch(groups[0], groups[1], groups[2])?;
        self.read_back(samples)
    }

    pub fn settings(&self) -> Option<&RenderSettings> {
        self.frame.as_ref().map(|f| &f.settings)
    }

    pub fn work_group(&self) -> WorkGroupSize {
        self.work_group
    }

    /// True while a progressive pass is outstanding.
    pub fn has_pass(&self) -> bool {
        self.pass.is_some()
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryManager {
        &mut self.memory
    }

    pub fn pipeline(&self) -> &ComputePipeline {
        &self.pipeline
    }

    fn frame(&self) -> Result<&Frame> {
        self.frame.as_ref().ok_or_else(|| Error::invalid_state("no scene loaded"))
    }

    fn ensure_no_pass(&self) -> Result<()> {
        match self.pass {
            Some(p) => Err(Error::invalid_state(format!("pass [{}, {}) still outstanding", p.start, p.end))),
            None => Ok(()),
        }
    }

    /// Write uniforms for samples `[start, end)` and return the group counts.
    fn upload_uniforms(&mut self, start: u32, end: u32) -> Result<[u32; 3]> {
        let frame = self.frame()?;
        let uniforms = frame.base.with_samples(start, end);
        let target = Arc::clone(&frame.uniforms);
        let (w, h) = (frame.settings.width, frame.settings.height);
        self.memory.transfer_to_gpu(&target, bytemuck::bytes_of(&uniforms), 0)?;
        Ok(HardwareOptimizer::dispatch_groups(w, h, self.work_group))
    }

    /// Read the accumulation buffer and divide by the sample count.
    fn read_back(&mut self, samples: u32) -> Result<Vec<f32>> {
        let frame = self.frame()?;
        let accumulation = Arc::clone(&frame.accumulation);
        let len = frame.settings.accumulation_bytes();
        let bytes = self.memory.transfer_from_gpu(&accumulation, 0, len)?;
        let mut pixels: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        let inv = 1.0 / samples.max(1) as f32;
        for px in pixels.chunks_exact_mut(4) {
            px[0] *= inv;
            px[1] *= inv;
            px[2] *= inv;
            px[3] = 1.0;
        }
        Ok(pixels)
    }
}

impl ProgressiveTarget for GpuPathTracer {
    fn is_ready(&self) -> bool {
        self.is_ready() && self.frame.is_some()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.frame.as_ref().map_or((0, 0), |f| (f.settings.width, f.settings.height))
    }

    fn begin_pass(&mut self, start: u32, end: u32) -> Result<()> {
        self.ensure_no_pass()?;
        if end <= start {
            return Err(Error::invalid_state(format!("empty sample range [{start}, {end})")));
        }
        let groups = self.upload_uniforms(start, end)?;
        self.pipeline.dispatch_async(groups[0], groups[1], groups[2])?;
        self.pass = Some(Pass { start, end, complete: false });
        Ok(())
    }

    fn poll_pass(&mut self) -> Result<bool> {
        let Some(pass) = self.pass.as_mut() else {
            return Err(Error::invalid_state("no pass in flight"));
        };
        if pass.complete {
            return Ok(true);
        }
        if !self.pipeline.is_complete()? {
            return Ok(false);
        }
        if let Some(err) = self.pipeline.take_async_failure() {
            self.pass = None;
            return Err(err);
        }
        pass.complete = true;
        Ok(true)
    }

    fn finish_pass(&mut self) -> Result<Vec<f32>> {
        match self.pass {
            Some(p) if p.complete => {
                self.pass = None;
                self.read_back(p.end)
            }
            Some(_) => Err(Error::invalid_state("pass not complete")),
            None => Err(Error::invalid_state("no pass in flight")),
        }
    }

    fn discard_pass(&mut self) -> Result<bool> {
        if self.pass.is_none() {
            return Ok(true);
        }
        let done = match self.poll_pass() {
            Ok(done) => done,
            // The result is being thrown away; a failed pass is just as finished.
            Err(e) if !matches!(e, Error::WrongThread { .. }) => true,
            Err(e) => return Err(e),
        };
        if done {
            self.pass = None;
            tracing::debug!("in-flight pass discarded");
        }
        Ok(done)
    }
}

fn bind_frame(pipeline: &mut ComputePipeline, frame: &Frame) -> Result<()> {
    pipeline.bind_buffer(SLOT_SCENE, &frame.scene)?;
    pipeline.bind_buffer(SLOT_UNIFORMS, &frame.uniforms)?;
    pipeline.bind_buffer(SLOT_ACCUMULATION, &frame.accumulation)
}

/// CPU implementation of [`PATHTRACE_ENTRY`] for the software backend.
pub fn software_kernel() -> KernelFn {
    Arc::new(run_kernel)
}

fn run_kernel(inv: &mut KernelInvocation<'_>) -> std::result::Result<(), String> {
    let uniforms = inv
        .buffer(SLOT_UNIFORMS)
        .filter(|b| b.len() >= RenderUniforms::SIZE)
        .map(|b| bytemuck::pod_read_unaligned::<RenderUniforms>(&b[..RenderUniforms::SIZE]))
        .ok_or_else(|| "uniform buffer missing or too small".to_string())?;

    let count = uniforms.sphere_count as usize;
    let scene = inv.buffer(SLOT_SCENE).ok_or_else(|| "scene buffer not bound".to_string())?;
    if scene.len() < count * GpuPrimitive::SIZE {
        return Err(format!("scene buffer holds {} bytes, {count} primitives need {}", scene.len(), count * GpuPrimitive::SIZE));
    }
    let prims: Vec<_> = scene[..count * GpuPrimitive::SIZE]
        .chunks_exact(GpuPrimitive::SIZE)
        .map(|c| bytemuck::pod_read_unaligned::<GpuPrimitive>(c).to_primitive())
        .collect();

    let camera = uniforms.camera();
    let (w, h) = (uniforms.image_width, uniforms.image_height);
    let [gx, gy, _] = inv.global_size();
    let (start, end, depth) = (uniforms.sample_offset, uniforms.samples_per_pixel, uniforms.max_depth);

    let row_bytes = w as usize * 16;
    let accum = inv
        .buffer_mut(SLOT_ACCUMULATION)
        .ok_or_else(|| "accumulation buffer not bound".to_string())?;
    if accum.len() < row_bytes * h as usize {
        return Err(format!("accumulation buffer too small for {w}x{h}"));
    }

    accum[..row_bytes * h as usize]
        .par_chunks_mut(row_bytes)
        .enumerate()
        .filter(|(y, _)| (*y as u32) < gy)
        .for_each(|(y, row)| {
            let y = y as u32;
            for x in 0..w.min(gx) {
                let px = &mut row[x as usize * 16..x as usize * 16 + 16];
                let mut acc = if start > 0 {
                    let v: [f32; 4] = bytemuck::pod_read_unaligned(px);
                    Vec3::new(v[0], v[1], v[2])
                } else {
                    Vec3::ZERO
                };
                for s in start..end {
                    acc += sample_pixel(&prims, &camera, w, h, x, y, s, depth);
                }
                px.copy_from_slice(bytemuck::bytes_of(&[acc.x, acc.y, acc.z, 1.0f32]));
            }
        });
    Ok(())
}
