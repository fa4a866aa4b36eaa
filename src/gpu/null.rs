//! Backend used when no compute-capable GPU or driver is present.
//!
//! Reports no capabilities and fails every native call with a capability
//! error, so the rest of the engine degrades to CPU rendering without
//! special-casing the missing device.

use std::any::Any;

use super::backend::*;
use super::buffer::{BufferId, NativeBufferFlags};
use crate::util::{Error, Result};

/// No-op GPU backend.
#[derive(Debug)]
pub struct NullBackend {
    reason: String,
}

impl NullBackend {
    pub fn new() -> Self {
        Self { reason: "no GPU backend available".to_string() }
    }

    /// Null backend remembering why the real one could not be created.
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn unavailable<T>(&self) -> Result<T> {
        Err(Error::capability(self.reason.clone()))
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    fn adapter_info(&self) -> AdapterInfo {
        AdapterInfo {
            vendor: "none".into(),
            renderer: "none".into(),
            driver: self.reason.clone(),
            backend: "null".into(),
        }
    }

    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            max_work_group_count: [0; 3],
            max_work_group_size: [0; 3],
            max_invocations: 0,
            max_storage_buffer_size: 0,
            max_uniform_buffer_size: 0,
        }
    }

    fn create_buffer(&mut self, _size: u64, _flags: NativeBufferFlags, _label: &str) -> Result<BufferId> {
        self.unavailable()
    }

    fn destroy_buffer(&mut self, _id: BufferId) {}

    fn write_buffer(&mut self, _id: BufferId, _offset: u64, _data: &[u8]) -> Result<()> {
        self.unavailable()
    }

    fn read_buffer(&mut self, _id: BufferId, _offset: u64, _len: u64) -> Result<Vec<u8>> {
        self.unavailable()
    }

    fn map_buffer(&mut self, _id: BufferId) -> Result<()> {
        self.unavailable()
    }

    fn unmap_buffer(&mut self, _id: BufferId) {}

    fn compile_shader(&mut self, _source: &ShaderSource) -> std::result::Result<ShaderId, NativeLog> {
        Err(self.reason.clone())
    }

    fn link_program(&mut self, _shader: ShaderId, _wg: WorkGroupSize) -> std::result::Result<ProgramId, NativeLog> {
        Err(self.reason.clone())
    }

    fn destroy_shader(&mut self, _id: ShaderId) {}

    fn destroy_program(&mut self, _id: ProgramId) {}

    fn dispatch(&mut self, _program: ProgramId, _bindings: &[Binding], _groups: [u32; 3]) -> Result<()> {
        self.unavailable()
    }

    fn memory_barrier(&mut self) {}

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn create_fence(&mut self) -> Result<FenceId> {
        self.unavailable()
    }

    fn poll_fence(&mut self, _fence: FenceId) -> FenceStatus {
        FenceStatus::Failed(self.reason.clone())
    }

    fn delete_fence(&mut self, _fence: FenceId) {}

    fn create_timestamp_query(&mut self) -> Result<QueryId> {
        self.unavailable()
    }

    fn write_timestamp(&mut self, _query: QueryId) -> Result<()> {
        self.unavailable()
    }

    fn timestamp_result(&mut self, _query: QueryId) -> Option<u64> {
        None
    }

    fn delete_query(&mut self, _query: QueryId) {}

    fn take_error(&mut self) -> Option<u32> {
        None
    }

    fn native_allocation_count(&self) -> u64 {
        0
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
