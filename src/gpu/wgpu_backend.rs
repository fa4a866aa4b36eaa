//! Native GPU backend on top of `wgpu`.
//!
//! Fences are flags flipped by `Queue::on_submitted_work_done`; readback goes
//! through staging buffers and `map_async`. Validation errors are captured
//! with error scopes and surfaced as compile/link logs or driver codes.
//! Timestamps are taken on the host when submitted work completes, so no
//! `TIMESTAMP_QUERY` feature is required.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Instant;

use super::backend::*;
use super::buffer::{BufferId, NativeBufferFlags};
use super::optimizer::GpuVendor;
use crate::util::{Error, Result};

const ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;
const UNSET: u64 = u64::MAX;

struct NativeBuffer {
    buffer: wgpu::Buffer,
    /// Requested size (the native buffer is padded to `ALIGN`)
    size: u64,
}

struct NativeShader {
    source: ShaderSource,
}

struct NativeProgram {
    pipeline: wgpu::ComputePipeline,
}

struct NativeFence {
    done: Arc<AtomicBool>,
    failure: Option<String>,
}

/// `wgpu` device and queue behind the [`GpuBackend`] interface.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: AdapterInfo,
    limits: DeviceLimits,
    next_id: u64,
    buffers: HashMap<BufferId, NativeBuffer>,
    shaders: HashMap<ShaderId, NativeShader>,
    programs: HashMap<ProgramId, NativeProgram>,
    fences: HashMap<FenceId, NativeFence>,
    queries: HashMap<QueryId, Arc<AtomicU64>>,
    errors: VecDeque<u32>,
    last_failure: Option<String>,
    epoch: Instant,
    native_allocations: u64,
}

impl WgpuBackend {
    /// Pick a high-performance adapter and open a device on it.
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::capability(format!("no GPU adapter: {e}")))?;

        let raw = adapter.get_info();
        if raw.device_type == wgpu::DeviceType::Cpu {
            return Err(Error::capability(format!("only a CPU adapter is available ({})", raw.name)));
        }
        let adapter_limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("hybrid-trace"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter_limits.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::capability(format!("device request failed: {e}")))?;

        let info = AdapterInfo {
            vendor: match GpuVendor::from_pci_id(raw.vendor) {
                GpuVendor::Other => format!("0x{:04X}", raw.vendor),
                v => v.to_string(),
            },
            renderer: raw.name.clone(),
            driver: format!("{} {}", raw.driver, raw.driver_info).trim().to_string(),
            backend: format!("wgpu/{:?}", raw.backend),
        };
        let l = device.limits();
        let limits = DeviceLimits {
            max_work_group_count: [l.max_compute_workgroups_per_dimension; 3],
            max_work_group_size: [
                l.max_compute_workgroup_size_x,
                l.max_compute_workgroup_size_y,
                l.max_compute_workgroup_size_z,
            ],
            max_invocations: l.max_compute_invocations_per_workgroup,
            max_storage_buffer_size: l.max_storage_buffer_binding_size as u64,
            max_uniform_buffer_size: l.max_uniform_buffer_binding_size as u64,
        };
        tracing::info!(adapter = %info, "wgpu device created");

        Ok(Self {
            device,
            queue,
            info,
            limits,
            next_id: 1,
            buffers: HashMap::new(),
            shaders: HashMap::new(),
            programs: HashMap::new(),
            fences: HashMap::new(),
            queries: HashMap::new(),
            errors: VecDeque::new(),
            last_failure: None,
            epoch: Instant::now(),
            native_allocations: 0,
        })
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&self, id: BufferId) -> Result<&NativeBuffer> {
        self.buffers.get(&id).ok_or_else(|| Error::UnknownBuffer(id.to_string()))
    }

    /// Run `f` inside a validation error scope.
    fn scoped<R>(&self, f: impl FnOnce(&wgpu::Device) -> R) -> (R, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f(&self.device);
        let err = pollster::block_on(self.device.pop_error_scope());
        (out, err)
    }

    /// Copy `[start, end)` of a buffer into a mappable staging buffer and read it.
    fn read_aligned(&self, src: &wgpu::Buffer, start: u64, end: u64) -> Result<Vec<u8>> {
        let len = end - start;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("hybrid_trace_staging"),
            size: len,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(src, start, &staging, 0, len);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        let _ = self.device.poll(wgpu::PollType::wait_indefinitely());
        rx.recv()
            .map_err(|_| Error::other("map_async channel closed"))?
            .map_err(|e| Error::Driver {
                code: error_codes::INVALID_OPERATION,
                operation: format!("map_async: {e}"),
            })?;
        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    fn poll(&self) {
        let _ = self.device.poll(wgpu::PollType::Poll);
    }
}

fn usage_for(flags: NativeBufferFlags) -> wgpu::BufferUsages {
    let mut usage = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
    if flags.intersects(NativeBufferFlags::STORAGE | NativeBufferFlags::ATOMIC | NativeBufferFlags::TEXEL) {
        usage |= wgpu::BufferUsages::STORAGE;
    }
    if flags.contains(NativeBufferFlags::UNIFORM) {
        usage |= wgpu::BufferUsages::UNIFORM;
    }
    if flags.contains(NativeBufferFlags::VERTEX) {
        usage |= wgpu::BufferUsages::VERTEX;
    }
    if flags.contains(NativeBufferFlags::INDEX) {
        usage |= wgpu::BufferUsages::INDEX;
    }
    usage
}

fn align_down(v: u64) -> u64 {
    v / ALIGN * ALIGN
}

fn align_up(v: u64) -> u64 {
    v.div_ceil(ALIGN) * ALIGN
}

fn check_range(id: BufferId, offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::OutOfBounds { name: id.to_string(), offset, len, size }),
    }
}

impl GpuBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            compute_shaders: true,
            storage_buffers: true,
            buffer_mapping: true,
            timestamp_queries: true,
            sync_objects: true,
            api_version: self.info.backend.clone(),
        }
    }

    fn adapter_info(&self) -> AdapterInfo {
        self.info.clone()
    }

    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn create_buffer(&mut self, size: u64, flags: NativeBufferFlags, label: &str) -> Result<BufferId> {
        let usage = usage_for(flags);
        let (buffer, err) = self.scoped(|device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: align_up(size),
                usage,
                mapped_at_creation: false,
            })
        });
        if let Some(e) = err {
            self.errors.push_back(error_codes::OUT_OF_MEMORY);
            return Err(Error::Driver {
                code: error_codes::OUT_OF_MEMORY,
                operation: format!("create_buffer '{label}': {e}"),
            });
        }
        let id = BufferId(self.next());
        self.buffers.insert(id, NativeBuffer { buffer, size });
        self.native_allocations += 1;
        Ok(id)
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        if let Some(b) = self.buffers.remove(&id) {
            b.buffer.destroy();
        }
    }

    fn write_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let nb = self.buffer(id)?;
        check_range(id, offset, data.len() as u64, nb.size)?;
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64;
        if offset % ALIGN == 0 && data.len() as u64 % ALIGN == 0 {
            self.queue.write_buffer(&nb.buffer, offset, data);
            return Ok(());
        }
        // Unaligned: read-modify-write the covering aligned range.
        let (start, stop) = (align_down(offset), align_up(end));
        let mut block = self.read_aligned(&nb.buffer, start, stop)?;
        let at = (offset - start) as usize;
        block[at..at + data.len()].copy_from_slice(data);
        self.queue.write_buffer(&nb.buffer, start, &block);
        Ok(())
    }

    fn read_buffer(&mut self, id: BufferId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let nb = self.buffer(id)?;
        check_range(id, offset, len, nb.size)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let (start, stop) = (align_down(offset), align_up(offset + len));
        let block = self.read_aligned(&nb.buffer, start, stop)?;
        let at = (offset - start) as usize;
        Ok(block[at..at + len as usize].to_vec())
    }

    // Mapping is emulated through staging copies; only the flag is tracked.
    fn map_buffer(&mut self, id: BufferId) -> Result<()> {
        self.buffer(id).map(|_| ())
    }

    fn unmap_buffer(&mut self, _id: BufferId) {}

    fn compile_shader(&mut self, source: &ShaderSource) -> std::result::Result<ShaderId, NativeLog> {
        let (_module, err) = self.scoped(|device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&source.label),
                source: wgpu::ShaderSource::Wgsl(source.code.as_str().into()),
            })
        });
        if let Some(e) = err {
            return Err(e.to_string());
        }
        let id = ShaderId(self.next());
        self.shaders.insert(id, NativeShader { source: source.clone() });
        Ok(id)
    }

    fn link_program(&mut self, shader: ShaderId, work_group: WorkGroupSize) -> std::result::Result<ProgramId, NativeLog> {
        let source = self
            .shaders
            .get(&shader)
            .map(|s| s.source.clone())
            .ok_or_else(|| format!("shader {} does not exist", shader.0))?;
        let code = source.specialized(work_group);
        let (pipeline, err) = self.scoped(|device| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&source.label),
                source: wgpu::ShaderSource::Wgsl(code.as_str().into()),
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&source.label),
                layout: None,
                module: &module,
                entry_point: Some(&source.entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
        });
        if let Some(e) = err {
            return Err(e.to_string());
        }
        let id = ProgramId(self.next());
        self.programs.insert(id, NativeProgram { pipeline });
        Ok(id)
    }

    fn destroy_shader(&mut self, id: ShaderId) {
        self.shaders.remove(&id);
    }

    fn destroy_program(&mut self, id: ProgramId) {
        self.programs.remove(&id);
    }

    fn dispatch(&mut self, program: ProgramId, bindings: &[Binding], groups: [u32; 3]) -> Result<()> {
        let Some(prog) = self.programs.get(&program) else {
            self.errors.push_back(error_codes::INVALID_OPERATION);
            return Ok(());
        };
        let mut entries = Vec::with_capacity(bindings.len());
        for b in bindings {
            let Some(nb) = self.buffers.get(&b.buffer) else {
                self.errors.push_back(error_codes::INVALID_VALUE);
                return Ok(());
            };
            entries.push(wgpu::BindGroupEntry { binding: b.slot, resource: nb.buffer.as_entire_binding() });
        }

        let ((), err) = self.scoped(|device| {
            let layout = prog.pipeline.get_bind_group_layout(0);
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("hybrid_trace_bindings"),
                layout: &layout,
                entries: &entries,
            });
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("dispatch") });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("hybrid_trace_compute"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&prog.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
            }
            self.queue.submit(std::iter::once(encoder.finish()));
        });
        if let Some(e) = err {
            tracing::warn!("wgpu dispatch validation error: {e}");
            self.errors.push_back(error_codes::INVALID_OPERATION);
            self.last_failure = Some(e.to_string());
        }
        Ok(())
    }

    // Submissions are ordered on the queue.
    fn memory_barrier(&mut self) {}

    fn finish(&mut self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map(|_| ())
            .map_err(|e| Error::Driver { code: error_codes::DEVICE_LOST, operation: format!("finish: {e}") })
    }

    fn create_fence(&mut self) -> Result<FenceId> {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        self.queue.on_submitted_work_done(move || flag.store(true, Ordering::Release));
        let id = FenceId(self.next());
        self.fences.insert(id, NativeFence { done, failure: self.last_failure.take() });
        Ok(id)
    }

    fn poll_fence(&mut self, fence: FenceId) -> FenceStatus {
        self.poll();
        let Some(f) = self.fences.get(&fence) else {
            return FenceStatus::Failed(format!("fence {} does not exist", fence.0));
        };
        if !f.done.load(Ordering::Acquire) {
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
        let id = QueryId(self.next());
        self.queries.insert(id, Arc::new(AtomicU64::new(UNSET)));
        Ok(id)
    }

    fn write_timestamp(&mut self, query: QueryId) -> Result<()> {
        let slot = self
            .queries
            .get(&query)
            .cloned()
            .ok_or_else(|| Error::invalid_state(format!("query {} does not exist", query.0)))?;
        slot.store(UNSET, Ordering::Release);
        let epoch = self.epoch;
        self.queue
            .on_submitted_work_done(move || slot.store(epoch.elapsed().as_nanos() as u64, Ordering::Release));
        Ok(())
    }

    fn timestamp_result(&mut self, query: QueryId) -> Option<u64> {
        self.poll();
        let v = self.queries.get(&query)?.load(Ordering::Acquire);
        (v != UNSET).then_some(v)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a GPU"]
    fn test_wgpu_round_trip() {
        let mut gpu = WgpuBackend::new().expect("GPU adapter");
        let id = gpu.create_buffer(10, NativeBufferFlags::STORAGE, "rt").unwrap();
        gpu.write_buffer(id, 1, &[1, 2, 3]).unwrap();
        assert_eq!(gpu.read_buffer(id, 0, 5).unwrap(), vec![0, 1, 2, 3, 0]);
    }
}
