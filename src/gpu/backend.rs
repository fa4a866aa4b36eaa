//! Runtime GPU capability object.
//!
//! All native GPU work goes through one [`GpuBackend`] trait object. Which
//! implementation sits behind it (real device, software emulation, or the
//! null backend) is decided once at startup, so calling code never branches
//! on build configuration.
//!
//! [`GpuContext`] wraps the backend together with the identity of the thread
//! that owns the graphics context. Every access checks the calling thread and
//! fails with [`Error::WrongThread`] instead of touching the device.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::buffer::{BufferId, NativeBufferFlags};
use crate::util::{Error, Result};

/// Native error codes reported through [`GpuBackend::take_error`].
pub mod error_codes {
    pub const INVALID_ENUM: u32 = 0x0500;
    pub const INVALID_VALUE: u32 = 0x0501;
    pub const INVALID_OPERATION: u32 = 0x0502;
    pub const OUT_OF_MEMORY: u32 = 0x0505;
    pub const DEVICE_LOST: u32 = 0x0507;
}

/// Compiled shader handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderId(pub u64);

/// Linked program handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u64);

/// Fence (sync object) handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(pub u64);

/// Timestamp query handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub u64);

/// Result of a zero-timeout fence poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    Pending,
    /// The work finished but the driver reported a failure.
    Failed(String),
}

/// Feature set resolved once when the backend is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub compute_shaders: bool,
    pub storage_buffers: bool,
    pub buffer_mapping: bool,
    pub timestamp_queries: bool,
    pub sync_objects: bool,
    /// Driver/API version string as reported by the device
    pub api_version: String,
}

/// Vendor and model strings as reported by the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub vendor: String,
    pub renderer: String,
    pub driver: String,
    pub backend: String,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} ({}, {})", self.vendor, self.renderer, self.backend, self.driver)
    }
}

/// Work-group dimensions for a compute program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkGroupSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkGroupSize {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Total invocations per work group.
    pub fn total(&self) -> u32 {
        self.x.saturating_mul(self.y).saturating_mul(self.z)
    }

    /// Reject sizes that exceed the per-axis or total invocation limits.
    pub fn validate(&self, limits: &DeviceLimits) -> Result<()> {
        for (axis, requested, max) in [
            ('x', self.x, limits.max_work_group_size[0]),
            ('y', self.y, limits.max_work_group_size[1]),
            ('z', self.z, limits.max_work_group_size[2]),
        ] {
            if requested == 0 {
                return Err(Error::invalid_state(format!("work group {axis} is zero")));
            }
            if requested > max {
                return Err(Error::WorkGroupTooLarge { axis, requested, max });
            }
        }
        if self.total() > limits.max_invocations {
            return Err(Error::WorkGroupTooLarge {
                axis: '*',
                requested: self.total(),
                max: limits.max_invocations,
            });
        }
        Ok(())
    }
}

impl Default for WorkGroupSize {
    fn default() -> Self {
        Self::new(8, 8, 1)
    }
}

impl fmt::Display for WorkGroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{} ({} invocations)", self.x, self.y, self.z, self.total())
    }
}

/// Hardware-reported compute limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    /// Max work groups per dispatch, per axis
    pub max_work_group_count: [u32; 3],
    /// Max local size per axis
    pub max_work_group_size: [u32; 3],
    /// Max invocations in one work group
    pub max_invocations: u32,
    pub max_storage_buffer_size: u64,
    pub max_uniform_buffer_size: u64,
}

impl Default for DeviceLimits {
    /// Minimums guaranteed by any compute-capable driver.
    fn default() -> Self {
        Self {
            max_work_group_count: [65535, 65535, 65535],
            max_work_group_size: [1024, 1024, 64],
            max_invocations: 1024,
            max_storage_buffer_size: 128 << 20,
            max_uniform_buffer_size: 64 << 10,
        }
    }
}

impl DeviceLimits {
    /// Reject dispatch counts that exceed the per-axis maximum.
    pub fn validate_group_count(&self, groups: [u32; 3]) -> Result<()> {
        for (i, axis) in ['x', 'y', 'z'].into_iter().enumerate() {
            if groups[i] > self.max_work_group_count[i] {
                return Err(Error::WorkGroupTooLarge {
                    axis,
                    requested: groups[i],
                    max: self.max_work_group_count[i],
                });
            }
        }
        Ok(())
    }
}

/// Compute shader source plus entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub label: String,
    pub code: String,
    pub entry_point: String,
}

impl ShaderSource {
    pub fn new(label: impl Into<String>, code: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self { label: label.into(), code: code.into(), entry_point: entry_point.into() }
    }

    /// Source with `override WORKGROUP_{X,Y,Z}` declarations pinned to `wg`.
    ///
    /// Declarations not present in the source are left alone, so a shader
    /// with a literal `@workgroup_size` is returned unchanged.
    pub fn specialized(&self, wg: WorkGroupSize) -> String {
        self.code
            .lines()
            .map(|line| {
                let trimmed = line.trim_start();
                for (name, value) in [("WORKGROUP_X", wg.x), ("WORKGROUP_Y", wg.y), ("WORKGROUP_Z", wg.z)] {
                    if trimmed.starts_with(&format!("override {name}")) {
                        return format!("const {name}: u32 = {value}u;");
                    }
                }
                line.to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One storage/uniform binding for a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub slot: u32,
    pub buffer: BufferId,
}

/// Native driver log returned by compile/link.
pub type NativeLog = String;

/// Native GPU entry points, resolved once when the backend is built.
///
/// Implementations are not required to be thread-safe beyond `Send`:
/// [`GpuContext`] serializes access and pins it to the owning thread.
pub trait GpuBackend: Send {
    /// Short backend name for logs ("software", "wgpu", "null").
    fn name(&self) -> &str;
    fn capabilities(&self) -> BackendCapabilities;
    fn adapter_info(&self) -> AdapterInfo;
    fn limits(&self) -> DeviceLimits;

    // Buffers
    fn create_buffer(&mut self, size: u64, flags: NativeBufferFlags, label: &str) -> Result<BufferId>;
    fn destroy_buffer(&mut self, id: BufferId);
    fn write_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> Result<()>;
    fn read_buffer(&mut self, id: BufferId, offset: u64, len: u64) -> Result<Vec<u8>>;
    fn map_buffer(&mut self, id: BufferId) -> Result<()>;
    fn unmap_buffer(&mut self, id: BufferId);

    // Programs
    fn compile_shader(&mut self, source: &ShaderSource) -> std::result::Result<ShaderId, NativeLog>;
    fn link_program(&mut self, shader: ShaderId, work_group: WorkGroupSize) -> std::result::Result<ProgramId, NativeLog>;
    fn destroy_shader(&mut self, id: ShaderId);
    fn destroy_program(&mut self, id: ProgramId);

    // Execution
    fn dispatch(&mut self, program: ProgramId, bindings: &[Binding], groups: [u32; 3]) -> Result<()>;
    fn memory_barrier(&mut self);
    /// Block until all submitted work has completed.
    fn finish(&mut self) -> Result<()>;

    // Sync objects
    fn create_fence(&mut self) -> Result<FenceId>;
    /// Zero-timeout poll.
    fn poll_fence(&mut self, fence: FenceId) -> FenceStatus;
    fn delete_fence(&mut self, fence: FenceId);

    // Timestamp queries
    fn create_timestamp_query(&mut self) -> Result<QueryId>;
    fn write_timestamp(&mut self, query: QueryId) -> Result<()>;
    /// Nanoseconds, or `None` if the result is not yet available.
    fn timestamp_result(&mut self, query: QueryId) -> Option<u64>;
    fn delete_query(&mut self, query: QueryId);

    /// Pop the oldest pending native error code.
    fn take_error(&mut self) -> Option<u32>;
    /// Number of native buffer allocations performed so far.
    fn native_allocation_count(&self) -> u64;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shared, thread-pinned handle to the active backend.
#[derive(Clone)]
pub struct GpuContext {
    backend: Arc<Mutex<Box<dyn GpuBackend>>>,
    owner: ThreadId,
    name: Arc<str>,
    capabilities: BackendCapabilities,
    adapter: AdapterInfo,
    limits: DeviceLimits,
}

impl GpuContext {
    /// Wrap a backend; the calling thread becomes the context owner.
    pub fn new(backend: Box<dyn GpuBackend>) -> Self {
        let name: Arc<str> = Arc::from(backend.name());
        let capabilities = backend.capabilities();
        let adapter = backend.adapter_info();
        let limits = backend.limits();
        tracing::debug!(backend = %name, adapter = %adapter, "GPU context created");
        Self {
            backend: Arc::new(Mutex::new(backend)),
            owner: thread::current().id(),
            name,
            capabilities,
            adapter,
            limits,
        }
    }

    /// Context with no GPU behind it.
    pub fn null() -> Self {
        Self::new(Box::new(super::NullBackend::new()))
    }

    pub fn backend_name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Fail fast when called off the owning thread.
    pub fn check_thread(&self) -> Result<()> {
        let caller = thread::current().id();
        if caller != self.owner {
            tracing::error!(?caller, owner = ?self.owner, "GPU call from non-owning thread rejected");
            return Err(Error::WrongThread { owner: self.owner, caller });
        }
        Ok(())
    }

    /// Run `f` against the backend on the owning thread.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn GpuBackend) -> R) -> Result<R> {
        self.check_thread()?;
        let mut guard = self.backend.lock();
        Ok(f(&mut **guard))
    }

    /// Run `f` against the concrete backend type, if it matches.
    pub fn with_backend<B: GpuBackend + 'static, R>(&self, f: impl FnOnce(&mut B) -> R) -> Result<Option<R>> {
        self.with(|backend| backend.as_any_mut().downcast_mut::<B>().map(f))
    }

    /// Capabilities resolved at construction (readable from any thread).
    pub fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// Whether compute dispatch is possible at all.
    pub fn is_available(&self) -> bool {
        self.capabilities.compute_shaders
    }
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("backend", &self.name)
            .field("owner", &self.owner)
            .field("adapter", &self.adapter)
            .finish()
    }
}
