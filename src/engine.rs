//! Hybrid engine facade.
//!
//! Owns the GPU context and every component built on it, picks a backend per
//! render and feeds measured times back into the selector, monitor and
//! optimizer. All methods must be called from the thread that created the
//! engine, which owns the graphics context. CPU work runs on the rayon pool
//! or the background [`CpuWorker`].
//!
//! ## Usage
//! ```ignore
//! let mut engine = HybridEngine::from_config(EngineConfig::load())?;
//! let out = engine.render(&Scene::demo(), &Camera::demo(4.0 / 3.0), &settings)?;
//! println!("{} in {:.1} ms", out.backend, out.elapsed_ms);
//! ```

use std::fmt::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::gpu::{create_backend, GpuBackend, GpuContext, HardwareOptimizer, PerformanceMeasurement, PerformanceMonitor};
use crate::render::{Camera, CpuRenderer, CpuWorker, GpuPathTracer, RenderSettings, Scene, WorkerResult};
use crate::scheduler::{FrameSink, ProgressiveScheduler, StepStatus};
use crate::selector::{Backend, Decision, HybridSelector, SceneCharacteristics};
use crate::util::{Error, Result};

/// Result of a single render.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    /// RGBA f32, row 0 at the top
    pub pixels: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub backend: Backend,
    pub elapsed_ms: f64,
    pub decision: Decision,
}

/// Side-by-side timing of both backends on one workload.
#[derive(Debug, Clone)]
pub struct BenchResult {
    pub cpu_ms: f64,
    pub gpu_ms: Option<f64>,
    pub measurement: PerformanceMeasurement,
    /// Largest per-channel difference between the two images
    pub max_difference: Option<f32>,
}

pub struct HybridEngine {
    config: EngineConfig,
    ctx: GpuContext,
    gpu: Option<GpuPathTracer>,
    gpu_error: Option<String>,
    optimizer: HardwareOptimizer,
    monitor: PerformanceMonitor,
    selector: HybridSelector,
    scheduler: ProgressiveScheduler,
    worker: Option<CpuWorker>,
    /// Workload of the outstanding background CPU render
    cpu_job: Option<(u64, SceneCharacteristics)>,
}

impl HybridEngine {
    /// Build with the backend named in `config.render.backend`.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let backend = create_backend(config.render.backend);
        Self::new(config, backend)
    }

    /// Build on `backend`. A GPU that fails to come up leaves the engine in
    /// CPU-only mode; only an invalid configuration is an error.
    pub fn new(mut config: EngineConfig, backend: Box<dyn GpuBackend>) -> Result<Self> {
        config.validate()?;
        let ctx = GpuContext::new(backend);
        let mut optimizer = HardwareOptimizer::new(ctx.clone(), config.optimizer.clone());
        let monitor = PerformanceMonitor::new(ctx.clone(), config.monitor.clone());
        let mut selector = HybridSelector::new(&config.selector);
        let scheduler = ProgressiveScheduler::new(config.scheduler.clone());

        let (gpu, gpu_error) = match init_gpu(&ctx, &config, &mut optimizer) {
            Ok(tracer) => (Some(tracer), None),
            Err(e) => {
                tracing::warn!("GPU path disabled, rendering on CPU only: {e}");
                (None, Some(e.to_string()))
            }
        };
        selector.set_gpu_available(gpu.is_some(), config.memory.max_memory_bytes());
        tracing::info!(
            backend = ctx.backend_name(),
            gpu = gpu.is_some(),
            mode = %selector.mode(),
            "hybrid engine ready"
        );

        Ok(Self {
            config,
            ctx,
            gpu,
            gpu_error,
            optimizer,
            monitor,
            selector,
            scheduler,
            worker: None,
            cpu_job: None,
        })
    }

    /// Render once on the backend the selector picks.
    ///
    /// A failing GPU render falls back to the CPU; capability failures also
    /// disable the GPU path for the rest of the session.
    #[tracing::instrument(skip_all, fields(w = settings.width, h = settings.height, spp = settings.samples))]
    pub fn render(&mut self, scene: &Scene, camera: &Camera, settings: &RenderSettings) -> Result<RenderOutput> {
        let chars = scene.characteristics(settings.width, settings.height, settings.samples);
        let decision = self.selector.decide(&chars);
        tracing::debug!(backend = %decision.backend, reason = %decision.reason, "backend selected");

        if decision.backend == Backend::Gpu {
            match self.render_gpu(scene, camera, settings) {
                Ok((pixels, ms)) => {
                    self.selector.update_performance_model(&chars, Some(ms), None);
                    self.maybe_calibrate();
                    return Ok(self.output(pixels, settings, Backend::Gpu, ms, decision));
                }
                Err(e) => self.gpu_failed(e),
            }
        }

        let (pixels, ms) = self.render_cpu(scene, camera, settings)?;
        self.selector.update_performance_model(&chars, None, Some(ms));
        self.maybe_calibrate();
        Ok(self.output(pixels, settings, Backend::Cpu, ms, decision))
    }

    /// Render on both backends, commit a full measurement and teach the selector.
    pub fn benchmark(&mut self, scene: &Scene, camera: &Camera, settings: &RenderSettings) -> Result<BenchResult> {
        let chars = scene.characteristics(settings.width, settings.height, settings.samples);
        let gpu = match self.render_gpu(scene, camera, settings) {
            Ok(r) => Some(r),
            Err(e) => {
                self.gpu_failed(e);
                None
            }
        };
        let (cpu_pixels, cpu_ms) = self.render_cpu(scene, camera, settings)?;
        self.monitor.record_cpu_time(cpu_ms);

        let gpu_ms = gpu.as_ref().map(|(_, ms)| *ms);
        let max_difference = gpu.as_ref().map(|(px, _)| {
            px.iter()
                .zip(&cpu_pixels)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, f32::max)
        });
        self.selector.update_performance_model(&chars, gpu_ms, Some(cpu_ms));
        self.maybe_calibrate();
        let measurement = self.monitor.commit();
        if self.monitor.is_performance_regression() {
            tracing::warn!(speedup = measurement.speedup, "performance regression detected");
        }
        Ok(BenchResult { cpu_ms, gpu_ms, measurement, max_difference })
    }

    /// Begin a progressive render. Returns the backend doing the work: the
    /// GPU run is advanced by [`tick`](Self::tick), a CPU run goes to the
    /// background worker and is collected with [`poll_cpu_render`](Self::poll_cpu_render).
    pub fn start_progressive(&mut self, scene: &Scene, camera: &Camera, settings: &RenderSettings) -> Result<Backend> {
        let chars = scene.characteristics(settings.width, settings.height, settings.samples);
        let decision = self.selector.decide(&chars);
        if decision.backend == Backend::Gpu {
            match self.start_gpu_progressive(scene, camera, settings) {
                Ok(()) => return Ok(Backend::Gpu),
                Err(e) => self.gpu_failed(e),
            }
        }
        self.start_cpu_render(Arc::new(scene.clone()), *camera, *settings);
        Ok(Backend::Cpu)
    }

    fn start_gpu_progressive(&mut self, scene: &Scene, camera: &Camera, settings: &RenderSettings) -> Result<()> {
        let Some(tracer) = self.gpu.as_mut() else {
            return Err(Error::capability("no GPU path"));
        };
        self.scheduler.cancel();
        if tracer.has_pass() {
            return Err(Error::invalid_state("previous progressive pass still draining"));
        }
        let wg = self.optimizer.optimal_work_group_dimensions(settings.width, settings.height);
        tracer.set_work_group(wg)?;
        tracer.load_scene(scene, camera, settings)?;
        let c = &self.config.scheduler;
        let initial = c.initial_samples.min(settings.samples.max(1));
        self.scheduler
            .start_with(tracer, initial, settings.samples.max(1), c.total_steps, c.update_interval())
    }

    /// Advance the progressive GPU run. Never blocks.
    pub fn tick(&mut self, sink: &mut dyn FrameSink) -> Result<StepStatus> {
        match self.gpu.as_mut() {
            Some(tracer) => self.scheduler.step(tracer, sink),
            None => Ok(StepStatus::Idle),
        }
    }

    /// Cancel the progressive GPU run and any background CPU render.
    pub fn cancel(&mut self) {
        self.scheduler.cancel();
        if let Some(w) = &self.worker {
            w.cancel();
        }
    }

    /// Queue a render on the background CPU worker; returns its epoch.
    pub fn start_cpu_render(&mut self, scene: Arc<Scene>, camera: Camera, settings: RenderSettings) -> u64 {
        let chars = scene.characteristics(settings.width, settings.height, settings.samples);
        let worker = self.worker.get_or_insert_with(CpuWorker::spawn);
        let epoch = worker.request(scene, camera, settings);
        self.cpu_job = Some((epoch, chars));
        epoch
    }

    /// Non-blocking poll of the background CPU worker. Finished renders of the
    /// latest request are fed to the selector.
    pub fn poll_cpu_render(&mut self) -> Option<WorkerResult> {
        let result = self.worker.as_ref()?.try_recv()?;
        if let WorkerResult::Finished { epoch, elapsed, .. } = &result {
            if let Some((job, chars)) = self.cpu_job {
                if job == *epoch {
                    self.selector
                        .update_performance_model(&chars, None, Some(elapsed.as_secs_f64() * 1000.0));
                    self.cpu_job = None;
                }
            }
        }
        Some(result)
    }

    /// Human readable state of every component.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Backend: {} ({})", self.ctx.backend_name(), self.ctx.adapter_info());
        match &self.gpu_error {
            Some(e) => {
                let _ = writeln!(out, "GPU path: disabled ({e})");
            }
            None => {
                let _ = writeln!(out, "GPU path: enabled");
            }
        }
        if self.optimizer.is_detected() {
            let _ = writeln!(out, "{}", self.optimizer.profile());
        }
        if let Some(tracer) = &self.gpu {
            out.push_str(&tracer.memory().memory_report());
            let s = tracer.pipeline().stats();
            let _ = writeln!(
                out,
                "Dispatches: {} sync, {} async, {} failed, last {:.2} ms",
                s.sync_dispatches,
                s.async_dispatches,
                s.failed_dispatches,
                s.last_duration.as_secs_f64() * 1000.0
            );
        }
        out.push_str(&self.monitor.performance_report());
        let _ = writeln!(
            out,
            "Selector: mode {}, threshold {:.2}, decisions {}/{} correct, accuracy {}",
            self.selector.mode(),
            self.selector.performance_threshold(),
            self.selector.correct_decisions(),
            self.selector.total_decisions(),
            self.selector
                .prediction_accuracy()
                .map_or_else(|| "n/a".to_string(), |a| format!("{:.0}%", a * 100.0))
        );
        let st = self.scheduler.state();
        let _ = writeln!(
            out,
            "Progressive: {} (step {}/{}, {}/{} samples)",
            self.scheduler.status(),
            st.current_step,
            st.total_steps,
            st.current_samples,
            st.target_samples
        );
        out
    }

    pub fn is_gpu_available(&self) -> bool {
        self.gpu.is_some()
    }

    /// Why the GPU path is off, if it is.
    pub fn gpu_error(&self) -> Option<&str> {
        self.gpu_error.as_deref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    pub fn selector(&self) -> &HybridSelector {
        &self.selector
    }

    pub fn selector_mut(&mut self) -> &mut HybridSelector {
        &mut self.selector
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn optimizer(&self) -> &HardwareOptimizer {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &ProgressiveScheduler {
        &self.scheduler
    }

    pub fn tracer(&self) -> Option<&GpuPathTracer> {
        self.gpu.as_ref()
    }

    /// Timed GPU render including scene upload; feeds the monitor and optimizer.
    fn render_gpu(&mut self, scene: &Scene, camera: &Camera, settings: &RenderSettings) -> Result<(Vec<f32>, f64)> {
        let Some(tracer) = self.gpu.as_mut() else {
            return Err(Error::capability("no GPU path"));
        };
        if self.scheduler.is_active() || self.scheduler.is_busy() {
            return Err(Error::invalid_state("progressive GPU render in progress"));
        }
        let wg = self.optimizer.optimal_work_group_dimensions(settings.width, settings.height);
        tracer.set_work_group(wg)?;

        let transfers_before = tracer.memory().stats().transfers.total_time;
        self.monitor.set_workload(settings.width, settings.height, settings.samples);
        self.monitor.start_gpu_timing()?;
        tracer.load_scene(scene, camera, settings)?;
        let pixels = tracer.render(settings.samples)?;
        let ms = self.monitor.end_gpu_timing()?;
        let transfer = tracer.memory().stats().transfers.total_time.saturating_sub(transfers_before);
        self.monitor.record_transfer_time(transfer.as_secs_f64() * 1000.0);

        if ms > 0.0 {
            // Millions of samples per second.
            let perf = settings.pixel_count() as f64 * settings.samples.max(1) as f64 / (ms * 1000.0);
            let target = self.optimizer.average_performance().unwrap_or(perf);
            self.optimizer.update_optimization_based_on_performance(perf, target);
        }
        tracing::debug!(ms, "gpu render finished");
        Ok((pixels, ms))
    }

    fn render_cpu(&mut self, scene: &Scene, camera: &Camera, settings: &RenderSettings) -> Result<(Vec<f32>, f64)> {
        let stop = AtomicBool::new(false);
        let start = Instant::now();
        let pixels = CpuRenderer::render(scene, camera, settings, &stop, None)?;
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        tracing::debug!(ms, "cpu render finished");
        Ok((pixels, ms))
    }

    fn gpu_failed(&mut self, err: Error) {
        tracing::warn!("GPU render failed, using CPU: {err}");
        if err.is_capability() {
            self.gpu = None;
            self.gpu_error = Some(err.to_string());
            self.selector.set_gpu_available(false, 0);
        }
    }

    fn maybe_calibrate(&mut self) {
        let n = self.selector.record_count();
        if n > 0 && n % 10 == 0 {
            self.selector.calibrate_performance_model();
        }
    }

    fn output(&self, pixels: Vec<f32>, s: &RenderSettings, backend: Backend, ms: f64, decision: Decision) -> RenderOutput {
        RenderOutput { pixels, width: s.width, height: s.height, backend, elapsed_ms: ms, decision }
    }
}

fn init_gpu(ctx: &GpuContext, config: &EngineConfig, optimizer: &mut HardwareOptimizer) -> Result<GpuPathTracer> {
    if !ctx.is_available() {
        return Err(Error::capability(format!("{} backend has no compute support", ctx.backend_name())));
    }
    optimizer.detect_hardware_capabilities()?;
    let wg = optimizer.optimal_work_group_dimensions(config.render.width, config.render.height);
    let mut tracer = GpuPathTracer::new(ctx.clone(), config.memory.clone());
    tracer.initialize(wg)?;
    Ok(tracer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{NullBackend, SoftwareBackend};
    use crate::selector::SelectionMode;

    fn settings() -> RenderSettings {
        RenderSettings::new(16, 8, 2).with_max_depth(3)
    }

    #[test]
    fn test_null_backend_falls_back_to_cpu() {
        let mut engine = HybridEngine::new(EngineConfig::default(), Box::new(NullBackend::new())).unwrap();
        assert!(!engine.is_gpu_available());
        assert!(engine.gpu_error().is_some());
        engine.selector_mut().set_mode(SelectionMode::AlwaysGpu);
        let out = engine.render(&Scene::demo(), &Camera::demo(2.0), &settings()).unwrap();
        assert_eq!(out.backend, Backend::Cpu);
        assert_eq!(out.pixels.len(), 16 * 8 * 4);
    }

    #[test]
    fn test_always_gpu_uses_software_device() {
        let mut cfg = EngineConfig::default();
        cfg.selector.mode = SelectionMode::AlwaysGpu;
        let mut engine = HybridEngine::new(cfg, Box::new(SoftwareBackend::new())).unwrap();
        assert!(engine.is_gpu_available());
        let out = engine.render(&Scene::demo(), &Camera::demo(2.0), &settings()).unwrap();
        assert_eq!(out.backend, Backend::Gpu);
        assert_eq!(engine.selector().record_count(), 1);
        assert!(engine.report().contains("GPU path: enabled"));
    }

    #[test]
    fn test_benchmark_images_agree() {
        let mut engine = HybridEngine::new(EngineConfig::default(), Box::new(SoftwareBackend::new())).unwrap();
        let bench = engine.benchmark(&Scene::demo(), &Camera::demo(2.0), &settings()).unwrap();
        assert!(bench.gpu_ms.is_some());
        assert!(bench.max_difference.unwrap() < 1e-4);
        assert_eq!(engine.monitor().history_len(), 1);
        assert_eq!(engine.selector().total_decisions(), 1);
    }

    #[test]
    #[cfg(not(feature = "wgpu"))]
    fn test_auto_backend_runs_cpu_only() {
        let mut engine = HybridEngine::from_config(EngineConfig::default()).unwrap();
        assert!(!engine.is_gpu_available());
        let s = settings();
        let backend = engine.start_progressive(&Scene::demo(), &Camera::demo(2.0), &s).unwrap();
        assert_eq!(backend, Backend::Cpu);
        assert!(!engine.scheduler().is_active());
        engine.cancel();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.scheduler.total_steps = 0;
        assert!(HybridEngine::new(cfg, Box::new(SoftwareBackend::new())).is_err());
    }
}
