//! Compute program lifecycle and dispatch.
//!
//! A [`ComputePipeline`] walks the state machine
//! `Uninitialized -> Initialized -> ShaderCompiled -> ProgramLinked -> Dispatchable`.
//! Synchronous dispatches block until the device is idle. Asynchronous
//! dispatches return immediately and are tracked by a single fence, polled
//! with [`ComputePipeline::is_complete`].

use std::fmt;
use std::time::{Duration, Instant};

use super::backend::*;
use super::buffer::GpuBuffer;
use crate::util::{Error, Result};

/// Lifecycle of a compute pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Uninitialized,
    Initialized,
    ShaderCompiled,
    ProgramLinked,
    Dispatchable,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::ShaderCompiled => "shader compiled",
            Self::ProgramLinked => "program linked",
            Self::Dispatchable => "dispatchable",
        };
        f.write_str(s)
    }
}

/// Dispatch counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchStats {
    pub sync_dispatches: u64,
    pub async_dispatches: u64,
    pub failed_dispatches: u64,
    /// Wall time of the last completed dispatch (async: submit to observed completion)
    pub last_duration: Duration,
    pub total_duration: Duration,
}

impl DispatchStats {
    fn record(&mut self, elapsed: Duration) {
        self.last_duration = elapsed;
        self.total_duration += elapsed;
    }
}

struct InFlight {
    fence: FenceId,
    submitted: Instant,
}

/// Compiles, links and dispatches one compute program.
pub struct ComputePipeline {
    ctx: GpuContext,
    state: PipelineState,
    /// Set once initialization found the device unusable
    unavailable: bool,
    limits: DeviceLimits,
    shader: Option<ShaderId>,
    program: Option<ProgramId>,
    work_group: WorkGroupSize,
    bindings: Vec<Binding>,
    in_flight: Option<InFlight>,
    last_error: Option<String>,
    async_failure: Option<Error>,
    stats: DispatchStats,
}

impl ComputePipeline {
    pub fn new(ctx: GpuContext) -> Self {
        Self {
            ctx,
            state: PipelineState::Uninitialized,
            unavailable: false,
            limits: DeviceLimits::default(),
            shader: None,
            program: None,
            work_group: WorkGroupSize::default(),
            bindings: Vec::new(),
            in_flight: None,
            last_error: None,
            async_failure: None,
            stats: DispatchStats::default(),
        }
    }

    /// Validate compute support and cache the device limits.
    ///
    /// A capability failure is permanent for this instance.
    pub fn initialize(&mut self) -> Result<()> {
        self.ctx.check_thread()?;
        if self.unavailable {
            return Err(Error::capability(self.error_message()));
        }
        if self.state != PipelineState::Uninitialized {
            return Ok(());
        }
        if !self.ctx.capabilities().compute_shaders {
            self.unavailable = true;
            return Err(self.fail(Error::capability(format!(
                "compute shaders not supported by {} backend",
                self.ctx.backend_name()
            ))));
        }
        self.limits = self.ctx.limits().clone();
        self.state = PipelineState::Initialized;
        tracing::debug!(
            max_group_size = ?self.limits.max_work_group_size,
            max_invocations = self.limits.max_invocations,
            "compute pipeline initialized"
        );
        Ok(())
    }

    /// Compile a compute shader. Any previous program is discarded first.
    ///
    /// On failure the driver log is kept verbatim in [`last_error`](Self::last_error)
    /// and the pipeline stays `Initialized`.
    #[tracing::instrument(skip_all, fields(label = %source.label))]
    pub fn compile_shader(&mut self, source: &ShaderSource) -> Result<()> {
        self.ctx.check_thread()?;
        self.require(PipelineState::Initialized)?;
        self.ensure_idle()?;
        self.release_program()?;

        match self.ctx.with(|b| b.compile_shader(source))? {
            Ok(id) => {
                self.shader = Some(id);
                self.state = PipelineState::ShaderCompiled;
                tracing::debug!("shader compiled");
                Ok(())
            }
            Err(log) => {
                self.state = PipelineState::Initialized;
                tracing::error!("shader compilation failed:\n{log}");
                self.last_error = Some(log.clone());
                Err(Error::Compile(log))
            }
        }
    }

    /// Link the compiled shader with the given work-group size.
    pub fn link_program(&mut self, work_group: WorkGroupSize) -> Result<()> {
        self.ctx.check_thread()?;
        if self.state != PipelineState::ShaderCompiled {
            return Err(self.fail(Error::invalid_state(format!("cannot link in state '{}'", self.state))));
        }
        if let Err(e) = work_group.validate(&self.limits) {
            return Err(self.fail(e));
        }
        let Some(shader) = self.shader else {
            return Err(self.fail(Error::invalid_state("no compiled shader")));
        };

        match self.ctx.with(|b| b.link_program(shader, work_group))? {
            Ok(id) => {
                self.program = Some(id);
                self.work_group = work_group;
                self.state = PipelineState::ProgramLinked;
                tracing::debug!(%work_group, "program linked");
                Ok(())
            }
            Err(log) => {
                self.state = PipelineState::ShaderCompiled;
                tracing::error!("program link failed:\n{log}");
                self.last_error = Some(log.clone());
                Err(Error::Link(log))
            }
        }
    }

    /// Make the linked program current.
    pub fn use_program(&mut self) -> Result<()> {
        self.ctx.check_thread()?;
        match self.state {
            PipelineState::ProgramLinked | PipelineState::Dispatchable => {
                self.state = PipelineState::Dispatchable;
                Ok(())
            }
            s => Err(self.fail(Error::invalid_state(format!("no linked program to use (state '{s}')")))),
        }
    }

    /// Bind a buffer to a storage/uniform slot, replacing any previous binding.
    pub fn bind_buffer(&mut self, slot: u32, buffer: &GpuBuffer) -> Result<()> {
        self.ctx.check_thread()?;
        self.require(PipelineState::Initialized)?;
        let binding = Binding { slot, buffer: buffer.id() };
        match self.bindings.iter_mut().find(|b| b.slot == slot) {
            Some(existing) => *existing = binding,
            None => self.bindings.push(binding),
        }
        Ok(())
    }

    pub fn clear_bindings(&mut self) {
        self.bindings.clear();
    }

    /// Dispatch and block until the device is idle.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.ctx.check_thread()?;
        let program = self.prepare_dispatch([x, y, z])?;
        let bindings = self.bindings.clone();
        let start = Instant::now();

        let code = self.ctx.with(|b| -> Result<Option<u32>> {
            b.dispatch(program, &bindings, [x, y, z])?;
            b.memory_barrier();
            b.finish()?;
            let first = b.take_error();
            while b.take_error().is_some() {}
            Ok(first)
        })?;
        let code = match code {
            Ok(code) => code,
            Err(e) => {
                self.stats.failed_dispatches += 1;
                return Err(self.fail(e));
            }
        };
        if let Some(code) = code {
            self.stats.failed_dispatches += 1;
            return Err(self.fail(Error::Driver { code, operation: format!("dispatch {x}x{y}x{z}") }));
        }

        self.stats.sync_dispatches += 1;
        self.stats.record(start.elapsed());
        Ok(())
    }

    /// Issue a dispatch and return immediately.
    ///
    /// Only one asynchronous dispatch may be in flight; a second call fails
    /// with [`Error::AsyncInFlight`] before touching the device.
    pub fn dispatch_async(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.ctx.check_thread()?;
        let program = self.prepare_dispatch([x, y, z])?;
        let bindings = self.bindings.clone();

        let fence = self.ctx.with(|b| -> Result<FenceId> {
            b.dispatch(program, &bindings, [x, y, z])?;
            b.memory_barrier();
            b.create_fence().inspect_err(|_| {
                // Without a fence the work cannot be tracked; drain it here.
                let _ = b.finish();
                while b.take_error().is_some() {}
            })
        })?;
        match fence {
            Ok(fence) => {
                self.in_flight = Some(InFlight { fence, submitted: Instant::now() });
                self.async_failure = None;
                self.stats.async_dispatches += 1;
                tracing::trace!(fence = fence.0, "async dispatch {x}x{y}x{z}");
                Ok(())
            }
            Err(e) => {
                self.stats.failed_dispatches += 1;
                Err(self.fail(e))
            }
        }
    }

    /// Zero-timeout poll of the in-flight dispatch.
    ///
    /// Returns true when nothing is pending. A failed completion counts as
    /// complete; the error is kept in [`take_async_failure`](Self::take_async_failure).
    pub fn is_complete(&mut self) -> Result<bool> {
        self.ctx.check_thread()?;
        let Some(in_flight) = &self.in_flight else {
            return Ok(true);
        };
        let fence = in_flight.fence;
        let submitted = in_flight.submitted;

        let (status, code) = self.ctx.with(|b| {
            let status = b.poll_fence(fence);
            if status == FenceStatus::Pending {
                return (status, None);
            }
            b.delete_fence(fence);
            (status, b.take_error())
        })?;

        match status {
            FenceStatus::Pending => Ok(false),
            FenceStatus::Signaled => {
                self.in_flight = None;
                if let Some(code) = code {
                    self.record_async_failure(Error::Driver { code, operation: "async dispatch".into() });
                } else {
                    self.stats.record(submitted.elapsed());
                }
                Ok(true)
            }
            FenceStatus::Failed(msg) => {
                self.in_flight = None;
                let err = match code {
                    Some(code) => Error::Driver { code, operation: format!("async dispatch: {msg}") },
                    None => Error::other(format!("async dispatch failed: {msg}")),
                };
                self.record_async_failure(err);
                Ok(true)
            }
        }
    }

    /// Block (by polling) until the in-flight dispatch completes or `timeout` passes.
    pub fn wait(&mut self, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        loop {
            if self.is_complete()? {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::yield_now();
        }
    }

    pub fn has_pending_async(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Error from the last asynchronous completion, if it failed.
    pub fn take_async_failure(&mut self) -> Option<Error> {
        self.async_failure.take()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// False before initialization and permanently after a capability failure.
    pub fn is_available(&self) -> bool {
        !self.unavailable && self.state != PipelineState::Uninitialized
    }

    pub fn work_group(&self) -> WorkGroupSize {
        self.work_group
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Last error text, or "no error".
    pub fn error_message(&self) -> String {
        self.last_error.clone().unwrap_or_else(|| "no error".to_string())
    }

    fn prepare_dispatch(&mut self, groups: [u32; 3]) -> Result<ProgramId> {
        if self.state != PipelineState::Dispatchable {
            return Err(self.fail(Error::invalid_state(format!("cannot dispatch in state '{}'", self.state))));
        }
        if let Some(f) = &self.in_flight {
            let fence = f.fence.0;
            return Err(self.fail(Error::AsyncInFlight { fence }));
        }
        if groups.contains(&0) {
            return Err(self.fail(Error::invalid_state(format!("empty dispatch {groups:?}"))));
        }
        if let Err(e) = self.limits.validate_group_count(groups) {
            return Err(self.fail(e));
        }
        if let Err(e) = self.work_group.validate(&self.limits) {
            return Err(self.fail(e));
        }
        match self.program {
            Some(p) => Ok(p),
            None => Err(self.fail(Error::invalid_state("no program"))),
        }
    }

    fn require(&mut self, min: PipelineState) -> Result<()> {
        if self.unavailable {
            return Err(Error::capability(self.error_message()));
        }
        if self.state < min {
            return Err(self.fail(Error::invalid_state(format!("pipeline is {}, needs {min}", self.state))));
        }
        Ok(())
    }

    fn ensure_idle(&mut self) -> Result<()> {
        match &self.in_flight {
            Some(f) => {
                let fence = f.fence.0;
                Err(self.fail(Error::AsyncInFlight { fence }))
            }
            None => Ok(()),
        }
    }

    fn release_program(&mut self) -> Result<()> {
        let program = self.program.take();
        let shader = self.shader.take();
        if program.is_some() || shader.is_some() {
            self.ctx.with(|b| {
                if let Some(p) = program {
                    b.destroy_program(p);
                }
                if let Some(s) = shader {
                    b.destroy_shader(s);
                }
            })?;
        }
        if self.state > PipelineState::Initialized {
            self.state = PipelineState::Initialized;
        }
        Ok(())
    }

    fn record_async_failure(&mut self, err: Error) {
        tracing::warn!("{err}");
        self.stats.failed_dispatches += 1;
        self.last_error = Some(err.to_string());
        self.async_failure = Some(err);
    }

    fn fail(&mut self, err: Error) -> Error {
        self.last_error = Some(err.to_string());
        err
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        if !self.ctx.is_owner_thread() {
            return;
        }
        if let Some(f) = self.in_flight.take() {
            let _ = self.ctx.with(|b| b.delete_fence(f.fence));
        }
        let _ = self.release_program();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::gpu::software::{KernelInvocation, SoftwareBackend};

    const SRC: &str = "@compute @workgroup_size(8, 8, 1)\nfn main() {}";

    fn software(fence_latency: u32) -> SoftwareBackend {
        let mut sw = SoftwareBackend::new().with_fence_latency(fence_latency);
        sw.register_kernel(
            "main",
            Arc::new(|inv: &mut KernelInvocation<'_>| {
                let [w, h, _] = inv.global_size();
                if let Some(out) = inv.buffer_mut(0) {
                    out[..4].copy_from_slice(&(w * h).to_le_bytes());
                }
                Ok(())
            }),
        );
        sw
    }

    fn ready_pipeline(sw: SoftwareBackend) -> ComputePipeline {
        let mut p = ComputePipeline::new(GpuContext::new(Box::new(sw)));
        p.initialize().unwrap();
        p.compile_shader(&ShaderSource::new("test", SRC, "main")).unwrap();
        p.link_program(WorkGroupSize::new(8, 8, 1)).unwrap();
        p.use_program().unwrap();
        p
    }

    #[test]
    fn test_state_machine() {
        let mut p = ComputePipeline::new(GpuContext::new(Box::new(software(0))));
        assert_eq!(p.state(), PipelineState::Uninitialized);
        assert!(!p.is_available());
        assert!(p.dispatch(1, 1, 1).is_err());

        p.initialize().unwrap();
        assert!(p.is_available());
        assert!(p.use_program().is_err());
        p.compile_shader(&ShaderSource::new("t", SRC, "main")).unwrap();
        assert_eq!(p.state(), PipelineState::ShaderCompiled);
        p.link_program(WorkGroupSize::new(8, 8, 1)).unwrap();
        assert_eq!(p.state(), PipelineState::ProgramLinked);
        p.use_program().unwrap();
        assert_eq!(p.state(), PipelineState::Dispatchable);
    }

    #[test]
    fn test_capability_failure_is_permanent() {
        let mut p = ComputePipeline::new(GpuContext::null());
        assert!(p.initialize().unwrap_err().is_capability());
        assert!(!p.is_available());
        assert!(p.initialize().is_err());
        assert!(!p.is_available());
    }

    #[test]
    fn test_compile_failure_keeps_log_and_reverts() {
        let mut p = ComputePipeline::new(GpuContext::new(Box::new(software(0))));
        p.initialize().unwrap();
        let err = p.compile_shader(&ShaderSource::new("t", SRC, "missing")).unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
        assert_eq!(p.state(), PipelineState::Initialized);
        assert!(p.last_error().unwrap().contains("'missing'"));
    }

    #[test]
    fn test_link_failure_reverts() {
        let mut sw = software(0);
        sw.faults_mut().link_failure = Some("error: too many registers".into());
        let mut p = ComputePipeline::new(GpuContext::new(Box::new(sw)));
        p.initialize().unwrap();
        p.compile_shader(&ShaderSource::new("t", SRC, "main")).unwrap();
        let err = p.link_program(WorkGroupSize::default()).unwrap_err();
        assert!(matches!(err, Error::Link(_)));
        assert_eq!(p.state(), PipelineState::ShaderCompiled);
        assert_eq!(p.last_error(), Some("error: too many registers"));
    }

    #[test]
    fn test_oversized_work_group_rejected() {
        let mut p = ComputePipeline::new(GpuContext::new(Box::new(software(0))));
        p.initialize().unwrap();
        p.compile_shader(&ShaderSource::new("t", SRC, "main")).unwrap();
        let err = p.link_program(WorkGroupSize::new(4096, 1, 1)).unwrap_err();
        assert!(matches!(err, Error::WorkGroupTooLarge { axis: 'x', .. }));
        assert_eq!(p.state(), PipelineState::ShaderCompiled);
    }

    #[test]
    fn test_oversized_group_count_rejected_before_dispatch() {
        let mut p = ready_pipeline(software(0));
        let err = p.dispatch(70000, 1, 1).unwrap_err();
        assert!(matches!(err, Error::WorkGroupTooLarge { axis: 'x', requested: 70000, .. }));
        let dispatched = p
            .ctx
            .with_backend(|sw: &mut SoftwareBackend| sw.dispatch_count())
            .unwrap();
        assert_eq!(dispatched, Some(0));
    }

    #[test]
    fn test_sync_dispatch_writes_output() {
        let ctx_sw = software(0);
        let mut p = ready_pipeline(ctx_sw);
        let id = p
            .ctx
            .with(|b| b.create_buffer(4, crate::gpu::NativeBufferFlags::STORAGE, "out"))
            .unwrap()
            .unwrap();
        let buf = GpuBuffer::new(id, 4, crate::gpu::BufferType::ShaderStorage, crate::gpu::UsagePattern::Dynamic, "out");
        p.bind_buffer(0, &buf).unwrap();
        p.dispatch(2, 3, 1).unwrap();
        let bytes = p.ctx.with(|b| b.read_buffer(id, 0, 4)).unwrap().unwrap();
        assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), 16 * 24);
        assert_eq!(p.stats().sync_dispatches, 1);
    }

    #[test]
    fn test_driver_error_reported() {
        let mut sw = software(0);
        sw.faults_mut().dispatch_error = Some(error_codes::OUT_OF_MEMORY);
        let mut p = ready_pipeline(sw);
        let err = p.dispatch(1, 1, 1).unwrap_err();
        assert!(matches!(err, Error::Driver { code: error_codes::OUT_OF_MEMORY, .. }));
        assert!(p.error_message().contains("0x0505"));
        assert_eq!(p.stats().failed_dispatches, 1);
    }

    #[test]
    fn test_sync_failure_does_not_leak_into_async() {
        let mut sw = software(0);
        sw.faults_mut().dispatch_error = Some(error_codes::INVALID_OPERATION);
        let mut p = ready_pipeline(sw);
        assert!(p.dispatch(1, 1, 1).is_err());
        p.dispatch_async(1, 1, 1).unwrap();
        assert!(p.wait(Duration::from_secs(1)).unwrap());
        assert!(p.take_async_failure().is_none());
        assert_eq!(p.stats().failed_dispatches, 1);
    }

    #[test]
    fn test_missing_fence_drains_dispatch() {
        let mut sw = software(0);
        sw.faults_mut().dispatch_error = Some(error_codes::INVALID_OPERATION);
        let mut p = ready_pipeline(sw);
        p.ctx
            .with_backend(|sw: &mut SoftwareBackend| {
                sw.config_mut().capabilities.sync_objects = false;
            })
            .unwrap();
        assert!(p.dispatch_async(1, 1, 1).unwrap_err().is_capability());
        assert!(!p.has_pending_async());
        // The queued driver error was drained with the untracked work.
        p.ctx
            .with_backend(|sw: &mut SoftwareBackend| sw.config_mut().capabilities.sync_objects = true)
            .unwrap();
        p.dispatch(1, 1, 1).unwrap();
    }

    #[test]
    fn test_async_exclusivity() {
        let mut p = ready_pipeline(software(3));
        p.dispatch_async(1, 1, 1).unwrap();
        let err = p.dispatch_async(1, 1, 1).unwrap_err();
        assert!(matches!(err, Error::AsyncInFlight { .. }));
        assert!(matches!(p.dispatch(1, 1, 1), Err(Error::AsyncInFlight { .. })));
        let dispatched = p
            .ctx
            .with_backend(|sw: &mut SoftwareBackend| sw.dispatch_count())
            .unwrap();
        assert_eq!(dispatched, Some(1));
    }

    #[test]
    fn test_is_complete_does_not_block() {
        let mut p = ready_pipeline(software(2));
        assert!(p.is_complete().unwrap());
        p.dispatch_async(1, 1, 1).unwrap();
        assert!(!p.is_complete().unwrap());
        assert!(!p.is_complete().unwrap());
        assert!(p.is_complete().unwrap());
        assert!(!p.has_pending_async());
        // Next async dispatch is accepted again.
        p.dispatch_async(1, 1, 1).unwrap();
        assert!(p.wait(Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn test_failed_async_counts_as_complete() {
        let mut sw = software(0);
        sw.faults_mut().dispatch_error = Some(error_codes::DEVICE_LOST);
        let mut p = ready_pipeline(sw);
        p.dispatch_async(1, 1, 1).unwrap();
        assert!(p.is_complete().unwrap());
        let err = p.take_async_failure().unwrap();
        assert!(matches!(err, Error::Driver { code: error_codes::DEVICE_LOST, .. }));
        assert!(p.last_error().is_some());
    }

    #[test]
    fn test_recompile_releases_old_program() {
        let mut p = ready_pipeline(software(0));
        p.compile_shader(&ShaderSource::new("t2", SRC, "main")).unwrap();
        assert_eq!(p.state(), PipelineState::ShaderCompiled);
        let programs = p
            .ctx
            .with_backend(|sw: &mut SoftwareBackend| (sw.live_program_count(), sw.live_shader_count()))
            .unwrap();
        assert_eq!(programs, Some((0, 1)));
    }
}
