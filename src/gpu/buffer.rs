//! GPU buffer handles and pooling metadata.
//!
//! Pure data: no native calls happen here. The [`MemoryManager`](super::MemoryManager)
//! is the only component that creates or destroys the native resource behind a
//! [`GpuBuffer`]; callers only ever hold `Arc<GpuBuffer>` references.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Opaque native buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// What the buffer is bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferType {
    ShaderStorage,
    Uniform,
    Vertex,
    Index,
    AtomicCounter,
    Texture,
}

/// How often the buffer contents change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsagePattern {
    /// Written once, read many times
    Static,
    /// Rewritten regularly
    Dynamic,
    /// Rewritten every use
    Stream,
}

bitflags! {
    /// Native allocation flags derived from (type, usage).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NativeBufferFlags: u32 {
        const STORAGE   = 1 << 0;
        const UNIFORM   = 1 << 1;
        const VERTEX    = 1 << 2;
        const INDEX     = 1 << 3;
        const ATOMIC    = 1 << 4;
        const TEXEL     = 1 << 5;
        const COPY_SRC  = 1 << 6;
        const COPY_DST  = 1 << 7;
        const MAP_READ  = 1 << 8;
        const MAP_WRITE = 1 << 9;
        /// Hint: keep in device-local memory
        const DEVICE_LOCAL = 1 << 10;
        /// Hint: host-visible, frequently rewritten
        const HOST_VISIBLE = 1 << 11;
    }
}

impl NativeBufferFlags {
    /// Select native flags for a buffer type and usage pattern.
    pub fn for_buffer(ty: BufferType, usage: UsagePattern) -> Self {
        let binding = match ty {
            BufferType::ShaderStorage => Self::STORAGE,
            BufferType::Uniform => Self::UNIFORM,
            BufferType::Vertex => Self::VERTEX,
            BufferType::Index => Self::INDEX,
            BufferType::AtomicCounter => Self::ATOMIC | Self::STORAGE,
            BufferType::Texture => Self::TEXEL,
        };
        let residency = match usage {
            UsagePattern::Static => Self::DEVICE_LOCAL,
            UsagePattern::Dynamic => Self::HOST_VISIBLE,
            UsagePattern::Stream => Self::HOST_VISIBLE | Self::MAP_WRITE,
        };
        binding | residency | Self::COPY_SRC | Self::COPY_DST
    }
}

/// Shared handle to a native GPU buffer.
///
/// Reference counting only tracks application interest. Dropping the last
/// `Arc` does not release VRAM; the manager must be asked explicitly.
pub struct GpuBuffer {
    id: BufferId,
    size: u64,
    buffer_type: BufferType,
    usage: UsagePattern,
    name: String,
    mapped: AtomicBool,
}

impl GpuBuffer {
    pub(crate) fn new(
        id: BufferId,
        size: u64,
        buffer_type: BufferType,
        usage: UsagePattern,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            size,
            buffer_type,
            usage,
            name: name.into(),
            mapped: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    #[inline]
    pub fn usage(&self) -> UsagePattern {
        self.usage
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the buffer is currently mapped into host memory.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    pub(crate) fn set_mapped(&self, mapped: bool) {
        self.mapped.store(mapped, Ordering::Release);
    }

    /// Pool signature of this buffer.
    pub fn pool_key(&self) -> PoolKey {
        PoolKey { size: self.size, buffer_type: self.buffer_type, usage: self.usage }
    }
}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("type", &self.buffer_type)
            .field("usage", &self.usage)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// (size, type, usage) signature shared by every buffer in one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub size: u64,
    pub buffer_type: BufferType,
    pub usage: UsagePattern,
}

/// Free/used lists for buffers sharing one [`PoolKey`].
///
/// A buffer is in exactly one of the two lists while pooled.
#[derive(Debug)]
pub struct MemoryPool {
    pub key: PoolKey,
    pub free: Vec<Arc<GpuBuffer>>,
    pub used: Vec<Arc<GpuBuffer>>,
}

impl MemoryPool {
    pub fn new(key: PoolKey) -> Self {
        Self { key, free: Vec::new(), used: Vec::new() }
    }

    /// Whether the pool can serve a request for `size` bytes of `ty`/`usage`.
    pub fn fits(&self, size: u64, ty: BufferType, usage: UsagePattern) -> bool {
        self.key.size >= size && self.key.buffer_type == ty && self.key.usage == usage
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.free.iter().chain(self.used.iter()).any(|b| b.id() == id)
    }

    /// Move a free buffer to the used list.
    pub fn acquire(&mut self) -> Option<Arc<GpuBuffer>> {
        let buf = self.free.pop()?;
        self.used.push(Arc::clone(&buf));
        Some(buf)
    }

    /// Move a used buffer back to the free list. Returns false if not in use.
    pub fn release(&mut self, id: BufferId) -> bool {
        match self.used.iter().position(|b| b.id() == id) {
            Some(pos) => {
                let buf = self.used.swap_remove(pos);
                self.free.push(buf);
                true
            }
            None => false,
        }
    }

    /// Drop the buffer from whichever list holds it.
    pub fn remove(&mut self, id: BufferId) -> Option<Arc<GpuBuffer>> {
        if let Some(pos) = self.used.iter().position(|b| b.id() == id) {
            return Some(self.used.swap_remove(pos));
        }
        let pos = self.free.iter().position(|b| b.id() == id)?;
        Some(self.free.swap_remove(pos))
    }

    /// Bytes held in the free list.
    pub fn free_bytes(&self) -> u64 {
        self.free.len() as u64 * self.key.size
    }
}

/// Host <-> device transfer counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransferStats {
    pub transfer_count: u64,
    pub failed_transfers: u64,
    pub total_bytes: u64,
    pub total_time: Duration,
    pub peak_time: Duration,
    pub average_time: Duration,
}

impl TransferStats {
    /// Record one transfer attempt. `bytes` is zero for rejected transfers.
    pub fn record(&mut self, bytes: u64, elapsed: Duration, ok: bool) {
        self.transfer_count += 1;
        if !ok {
            self.failed_transfers += 1;
        }
        self.total_bytes += bytes;
        self.total_time += elapsed;
        self.peak_time = self.peak_time.max(elapsed);
        self.average_time = self.total_time.div_f64(self.transfer_count as f64);
    }

    /// Effective throughput in MB/s over all transfers.
    pub fn throughput_mb_s(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

/// Aggregate memory counters, recomputed after every (de)allocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    /// Bytes held by live native buffers
    pub total_allocated: u64,
    /// Bytes not sitting idle in a pool free list
    pub total_used: u64,
    pub peak_usage: u64,
    pub buffer_count: usize,
    /// `1 - used/allocated`, 0 when nothing is allocated
    pub fragmentation_ratio: f64,
    pub pool_count: usize,
    pub transfers: TransferStats,
}
