//! Emulated compute device.
//!
//! Buffers live in host memory, programs are CPU kernels registered by entry
//! point name, and fences signal only after a configurable number of polls so
//! asynchronous behaviour can be exercised deterministically. Used as the
//! default backend when no native GPU backend is compiled in, and by the test
//! suite.
//!
//! ## Usage
//! ```ignore
//! let mut sw = SoftwareBackend::new();
//! sw.register_kernel("main", Arc::new(|inv: &mut KernelInvocation<'_>| { ... Ok(()) }));
//! let ctx = GpuContext::new(Box::new(sw));
//! ```

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use super::backend::*;
use super::buffer::{BufferId, NativeBufferFlags};
use crate::util::{Error, Result};

/// CPU implementation of a compute entry point.
pub type KernelFn = Arc<dyn Fn(&mut KernelInvocation<'_>) -> std::result::Result<(), String> + Send + Sync>;

/// Arguments passed to a software kernel for one dispatch.
pub struct KernelInvocation<'a> {
    pub groups: [u32; 3],
    pub work_group: WorkGroupSize,
    buffers: &'a mut HashMap<u32, Vec<u8>>,
}

impl KernelInvocation<'_> {
    /// Contents of the buffer bound at `slot`.
    pub fn buffer(&self, slot: u32) -> Option<&[u8]> {
        self.buffers.get(&slot).map(|b| b.as_slice())
    }

    pub fn buffer_mut(&mut self, slot: u32) -> Option<&mut [u8]> {
        self.buffers.get_mut(&slot).map(|b| b.as_mut_slice())
    }

    /// Total invocations per axis (`groups * work_group`).
    pub fn global_size(&self) -> [u32; 3] {
        [
            self.groups[0] * self.work_group.x,
            self.groups[1] * self.work_group.y,
            self.groups[2] * self.work_group.z,
        ]
    }
}

/// Device description and timing behaviour of the emulated device.
#[derive(Debug, Clone)]
pub struct SoftwareConfig {
    pub adapter: AdapterInfo,
    pub limits: DeviceLimits,
    pub capabilities: BackendCapabilities,
    /// Device memory available for buffers
    pub device_memory: u64,
    /// Polls returning `Pending` before a fence signals
    pub fence_latency_polls: u32,
    /// Polls returning `None` before a timestamp becomes available
    pub query_latency_polls: u32,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterInfo {
                vendor: "hybrid-trace".into(),
                renderer: "Software Compute Emulator".into(),
                driver: env!("CARGO_PKG_VERSION").into(),
                backend: "software".into(),
            },
            limits: DeviceLimits {
                max_storage_buffer_size: 1 << 30,
                ..DeviceLimits::default()
            },
            capabilities: BackendCapabilities {
                compute_shaders: true,
                storage_buffers: true,
                buffer_mapping: true,
                timestamp_queries: true,
                sync_objects: true,
                api_version: "4.6 (emulated)".into(),
            },
            device_memory: 2 << 30,
            fence_latency_polls: 1,
            query_latency_polls: 0,
        }
    }
}

struct SwBuffer {
    data: Vec<u8>,
    flags: NativeBufferFlags,
    mapped: bool,
}

struct SwProgram {
    kernel: KernelFn,
    work_group: WorkGroupSize,
}

struct SwFence {
    remaining_polls: u32,
    failure: Option<String>,
}

struct SwQuery {
    nanos: Option<u64>,
    remaining_polls: u32,
}

/// Fault injection switches for tests.
#[derive(Debug, Clone, Default)]
pub struct FaultInjection {
    /// Next dispatch reports this native error code
    pub dispatch_error: Option<u32>,
    /// Next compile fails with this log
    pub compile_failure: Option<String>,
    /// Next link fails with this log
    pub link_failure: Option<String>,
    /// Timestamp results never become available
    pub queries_never_ready: bool,
}

/// In-memory compute device.
pub struct SoftwareBackend {
    config: SoftwareConfig,
    next_id: u64,
    buffers: HashMap<BufferId, SwBuffer>,
    shaders: HashMap<ShaderId, ShaderSource>,
    programs: HashMap<ProgramId, SwProgram>,
    kernels: HashMap<String, KernelFn>,
    fences: HashMap<FenceId, SwFence>,
    queries: HashMap<QueryId, SwQuery>,
    errors: VecDeque<u32>,
    last_failure: Option<String>,
    faults: FaultInjection,
    epoch: Instant,
    allocated_bytes: u64,
    native_allocations: u64,
    dispatch_count: u64,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::with_config(SoftwareConfig::default())
    }

    pub fn with_config(config: SoftwareConfig) -> Self {
        Self {
            config,
            next_id: 1,
            buffers: HashMap::new(),
            shaders: HashMap::new(),
            programs: HashMap::new(),
            kernels: HashMap::new(),
            fences: HashMap::new(),
            queries: HashMap::new(),
            errors: VecDeque::new(),
            last_failure: None,
            faults: FaultInjection::default(),
            epoch: Instant::now(),
            allocated_bytes: 0,
            native_allocations: 0,
            dispatch_count: 0,
        }
    }

    /// Emulate a specific vendor/model (for hardware detection tests).
    pub fn with_adapter(mut self, vendor: &str, renderer: &str) -> Self {
        self.config.adapter.vendor = vendor.to_string();
        self.config.adapter.renderer = renderer.to_string();
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.config.limits = limits;
        self
    }

    pub fn with_capabilities(mut self, caps: BackendCapabilities) -> Self {
        self.config.capabilities = caps;
        self
    }

    pub fn with_fence_latency(mut self, polls: u32) -> Self {
        self.config.fence_latency_polls = polls;
        self
    }

    /// Change device behaviour after construction (capabilities, latencies).
    pub fn config_mut(&mut self) -> &mut SoftwareConfig {
        &mut self.config
    }

    /// Register a CPU kernel for an entry point name.
    pub fn register_kernel(&mut self, entry_point: &str, kernel: KernelFn) {
        self.kernels.insert(entry_point.to_string(), kernel);
    }

    pub fn faults_mut(&mut self) -> &mut FaultInjection {
        &mut self.faults
    }

    pub fn set_fence_latency(&mut self, polls: u32) {
        self.config.fence_latency_polls = polls;
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_program_count(&self) -> usize {
        self.programs.len()
    }

    pub fn live_shader_count(&self) -> usize {
        self.shaders.len()
    }

    pub fn pending_fence_count(&self) -> usize {
        self.fences.len()
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&mut self, id: BufferId) -> Result<&mut SwBuffer> {
        self.buffers
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownBuffer(id.to_string()))
    }

    fn push_error(&mut self, code: u32) {
        self.errors.push_back(code);
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn check_range(id: BufferId, offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::OutOfBounds { name: id.to_string(), offset, len, size }),
    }
}

impl GpuBackend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.config.capabilities.clone()
    }

    fn adapter_info(&self) -> AdapterInfo {
        self.config.adapter.clone()
    }

    fn limits(&self) -> DeviceLimits {
        self.config.limits.clone()
    }

    fn create_buffer(&mut self, size: u64, flags: NativeBufferFlags, label: &str) -> Result<BufferId> {
        if self.allocated_bytes + size > self.config.device_memory {
            return Err(Error::Driver {
                code: error_codes::OUT_OF_MEMORY,
                operation: format!("create_buffer '{label}' ({size} bytes)"),
            });
        }
        let id = BufferId(self.next());
        self.buffers.insert(id, SwBuffer { data: vec![0; size as usize], flags, mapped: false });
        self.allocated_bytes += size;
        self.native_allocations += 1;
        tracing::trace!(%id, size, label, ?flags, "software buffer created");
        Ok(id)
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        if let Some(buf) = self.buffers.remove(&id) {
            self.allocated_bytes -= buf.data.len() as u64;
        }
    }

    fn write_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let buf = self.buffer(id)?;
        check_range(id, offset, data.len() as u64, buf.data.len() as u64)?;
        let start = offset as usize;
        buf.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, id: BufferId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let buf = self.buffer(id)?;
        check_range(id, offset, len, buf.data.len() as u64)?;
        let start = offset as usize;
        Ok(buf.data[start..start + len as usize].to_vec())
    }

    fn map_buffer(&mut self, id: BufferId) -> Result<()> {
        let buf = self.buffer(id)?;
        if buf.mapped {
            return Err(Error::invalid_state(format!("{id} is already mapped")));
        }
        buf.mapped = true;
        Ok(())
    }

    fn unmap_buffer(&mut self, id: BufferId) {
        if let Some(buf) = self.buffers.get_mut(&id) {
            buf.mapped = false;
        }
    }

    fn compile_shader(&mut self, source: &ShaderSource) -> std::result::Result<ShaderId, NativeLog> {
        if let Some(log) = self.faults.compile_failure.take() {
            return Err(log);
        }
        if source.code.trim().is_empty() {
            return Err(format!("0:0: error: empty shader source '{}'", source.label));
        }
        if !source.code.contains("@compute") {
            return Err(format!("0:0: error: '{}' declares no @compute entry point", source.label));
        }
        if !self.kernels.contains_key(&source.entry_point) {
            return Err(format!(
                "0:0: error: entry point '{}' has no registered kernel",
                source.entry_point
            ));
        }
        let id = ShaderId(self.next());
        self.shaders.insert(id, source.clone());
        Ok(id)
    }

    fn link_program(&mut self, shader: ShaderId, work_group: WorkGroupSize) -> std::result::Result<ProgramId, NativeLog> {
        if let Some(log) = self.faults.link_failure.take() {
            return Err(log);
        }
        let source = self
            .shaders
            .get(&shader)
            .ok_or_else(|| format!("link error: shader {} does not exist", shader.0))?;
        let kernel = self
            .kernels
            .get(&source.entry_point)
            .cloned()
            .ok_or_else(|| format!("link error: unresolved entry point '{}'", source.entry_point))?;
        let id = ProgramId(self.next());
        self.programs.insert(id, SwProgram { kernel, work_group });
        Ok(id)
    }

    fn destroy_shader(&mut self, id: ShaderId) {
        self.shaders.remove(&id);
    }

    fn destroy_program(&mut self, id: ProgramId) {
        self.programs.remove(&id);
    }

    fn dispatch(&mut self, program: ProgramId, bindings: &[Binding], groups: [u32; 3]) -> Result<()> {
        // A fence only reports the failure of the dispatch right before it.
        self.last_failure = None;
        if let Some(code) = self.faults.dispatch_error.take() {
            self.push_error(code);
            self.last_failure = Some(format!("injected driver error 0x{code:04X}"));
            return Ok(());
        }
        let (kernel, work_group) = match self.programs.get(&program) {
            Some(p) => (Arc::clone(&p.kernel), p.work_group),
            None => {
                self.push_error(error_codes::INVALID_OPERATION);
                return Ok(());
            }
        };

        // Move bound storage out of the device for the duration of the kernel.
        let mut bound = HashMap::with_capacity(bindings.len());
        for b in bindings {
            match self.buffers.get_mut(&b.buffer) {
                Some(buf) => {
                    bound.insert(b.slot, std::mem::take(&mut buf.data));
                }
                None => {
                    self.push_error(error_codes::INVALID_VALUE);
                    // Put back whatever was taken so far.
                    for prev in bindings {
                        if let (Some(data), Some(buf)) = (bound.remove(&prev.slot), self.buffers.get_mut(&prev.buffer)) {
                            buf.data = data;
                        }
                    }
                    return Ok(());
                }
            }
        }

        let mut invocation = KernelInvocation { groups, work_group, buffers: &mut bound };
        let outcome = kernel(&mut invocation);

        for b in bindings {
            if let (Some(data), Some(buf)) = (bound.remove(&b.slot), self.buffers.get_mut(&b.buffer)) {
                buf.data = data;
            }
        }

        self.dispatch_count += 1;
        if let Err(msg) = outcome {
            tracing::warn!(program = program.0, "software kernel failed: {msg}");
            self.push_error(error_codes::INVALID_OPERATION);
            self.last_failure = Some(msg);
        }
        Ok(())
    }

    fn memory_barrier(&mut self) {}

    fn finish(&mut self) -> Result<()> {
        for fence in self.fences.values_mut() {
            fence.remaining_polls = 0;
        }
        self.last_failure = None;
        Ok(())
    }

    fn create_fence(&mut self) -> Result<FenceId> {
        if !self.config.capabilities.sync_objects {
            return Err(Error::capability("sync objects not supported"));
        }
        let id = FenceId(self.next());
        self.fences.insert(
            id,
            SwFence {
                remaining_polls: self.config.fence_latency_polls,
                failure: self.last_failure.take(),
            },
        );
        Ok(id)
    }

    fn poll_fence(&mut self, fence: FenceId) -> FenceStatus {
        let Some(f) = self.fences.get_mut(&fence) else {
            return FenceStatus::Failed(format!("fence {} does not exist", fence.0));
        };
        if f.remaining_polls > 0 {
            f.remaining_polls -= 1;
            return FenceStatus::Pending;
        }
        match &f.failure {
            Some(msg) => FenceStatus::Failed(msg.clone()),
            None => FenceStatus::Signaled,
        }
    }

    fn delete_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence);
    }

    fn create_timestamp_query(&mut self) -> Result<QueryId> {
        if !self.config.capabilities.timestamp_queries {
            return Err(Error::capability("timestamp queries not supported"));
        }
        let id = QueryId(self.next());
        self.queries.insert(id, SwQuery { nanos: None, remaining_polls: 0 });
        Ok(id)
    }

    fn write_timestamp(&mut self, query: QueryId) -> Result<()> {
        let nanos = self.epoch.elapsed().as_nanos() as u64;
        let latency = self.config.query_latency_polls;
        let q = self
            .queries
            .get_mut(&query)
            .ok_or_else(|| Error::invalid_state(format!("query {} does not exist", query.0)))?;
        q.nanos = Some(nanos);
        q.remaining_polls = latency;
        Ok(())
    }

    fn timestamp_result(&mut self, query: QueryId) -> Option<u64> {
        if self.faults.queries_never_ready {
            return None;
        }
        let q = self.queries.get_mut(&query)?;
        if q.remaining_polls > 0 {
            q.remaining_polls -= 1;
            return None;
        }
        q.nanos
    }

    fn delete_query(&mut self, query: QueryId) {
        self.queries.remove(&query);
    }

    fn take_error(&mut self) -> Option<u32> {
        self.errors.pop_front()
    }

    fn native_allocation_count(&self) -> u64 {
        self.native_allocations
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl std::fmt::Debug for SoftwareBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("buffers", &self.buffers.len())
            .field("programs", &self.programs.len())
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .field("allocated_bytes", &self.allocated_bytes)
            .finish()
    }
}
