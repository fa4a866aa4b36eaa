//! GPU memory manager.
//!
//! Owns every native buffer created through it. Callers receive
//! `Arc<GpuBuffer>` handles; native memory is released only by
//! [`MemoryManager::deallocate_buffer`], pool trimming, or
//! [`MemoryManager::shutdown`]. Buffers sharing a (size, type, usage)
//! signature can be recycled through pools without new native allocations.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::time::Instant;

use super::backend::GpuContext;
use super::buffer::*;
use crate::config::MemoryConfig;
use crate::util::{Error, Result};

/// Buffer handed out but never deallocated, with no references left outside the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakedBuffer {
    pub id: BufferId,
    pub name: String,
    pub size: u64,
}

/// Outcome of [`MemoryManager::optimize_memory_pools`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolOptimization {
    /// Used buffers moved back to their free list
    pub reclaimed: usize,
    /// Free buffers whose native memory was released
    pub trimmed: usize,
}

/// Allocates, pools, transfers and tracks GPU buffers.
pub struct MemoryManager {
    ctx: GpuContext,
    config: MemoryConfig,
    initialized: bool,
    /// Allocation order
    buffers: Vec<Arc<GpuBuffer>>,
    names: HashMap<String, Weak<GpuBuffer>>,
    pools: HashMap<PoolKey, MemoryPool>,
    stats: MemoryStats,
    last_error: Option<String>,
}

impl MemoryManager {
    pub fn new(ctx: GpuContext, config: MemoryConfig) -> Self {
        Self {
            ctx,
            config,
            initialized: false,
            buffers: Vec::new(),
            names: HashMap::new(),
            pools: HashMap::new(),
            stats: MemoryStats::default(),
            last_error: None,
        }
    }

    /// Check buffer capabilities and register the default pools.
    pub fn initialize(&mut self) -> Result<()> {
        self.ctx.check_thread()?;
        let caps = self.ctx.capabilities().clone();
        if !caps.storage_buffers {
            return Err(self.fail(Error::capability("storage buffers not supported by the device")));
        }
        if !caps.buffer_mapping {
            return Err(self.fail(Error::capability("buffer mapping not supported by the device")));
        }

        for &size in &self.config.default_pool_sizes {
            let key = PoolKey { size, buffer_type: BufferType::ShaderStorage, usage: UsagePattern::Dynamic };
            self.pools.entry(key).or_insert_with(|| MemoryPool::new(key));
        }
        self.initialized = true;
        self.update_stats();
        tracing::debug!(
            pools = self.pools.len(),
            max_buffers = self.config.max_buffers,
            max_memory_mb = self.config.max_memory_mb,
            "memory manager initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Create a new native buffer.
    ///
    /// Rejected requests (zero size, buffer cap, memory budget) leave all
    /// bookkeeping untouched.
    pub fn allocate_buffer(
        &mut self,
        size: u64,
        buffer_type: BufferType,
        usage: UsagePattern,
        name: &str,
    ) -> Result<Arc<GpuBuffer>> {
        self.ctx.check_thread()?;
        if !self.initialized {
            return Err(self.fail(Error::invalid_state("memory manager not initialized")));
        }
        if size == 0 {
            return Err(self.fail(Error::invalid_state(format!("zero-sized allocation '{name}'"))));
        }
        if self.buffers.len() >= self.config.max_buffers {
            return Err(self.fail(Error::ResourceExhausted(format!(
                "buffer count limit {} reached allocating '{name}'",
                self.config.max_buffers
            ))));
        }
        let budget = self.config.max_memory_bytes();
        if self.stats.total_allocated + size > budget {
            return Err(self.fail(Error::ResourceExhausted(format!(
                "'{name}' ({size} bytes) would exceed the {} MB budget ({} bytes in use)",
                self.config.max_memory_mb, self.stats.total_allocated
            ))));
        }

        let flags = NativeBufferFlags::for_buffer(buffer_type, usage);
        let id = match self.ctx.with(|b| b.create_buffer(size, flags, name))? {
            Ok(id) => id,
            Err(e) => return Err(self.fail(e)),
        };

        let buffer = Arc::new(GpuBuffer::new(id, size, buffer_type, usage, name));
        self.buffers.push(Arc::clone(&buffer));
        self.names.insert(name.to_string(), Arc::downgrade(&buffer));
        self.update_stats();
        tracing::trace!(%id, size, name, ?buffer_type, ?usage, "buffer allocated");
        Ok(buffer)
    }

    /// Serve from a pool when possible, otherwise allocate and pool the new buffer.
    ///
    /// A hit picks the smallest free buffer that fits and performs no native
    /// allocation.
    pub fn allocate_from_pool(
        &mut self,
        size: u64,
        buffer_type: BufferType,
        usage: UsagePattern,
        name: &str,
    ) -> Result<Arc<GpuBuffer>> {
        self.ctx.check_thread()?;
        let best = self
            .pools
            .values()
            .filter(|p| !p.free.is_empty() && p.fits(size, buffer_type, usage))
            .map(|p| p.key)
            .min_by_key(|k| k.size);

        if let Some(key) = best {
            if let Some(buffer) = self.pools.get_mut(&key).and_then(|p| p.acquire()) {
                self.names.insert(name.to_string(), Arc::downgrade(&buffer));
                self.update_stats();
                tracing::trace!(id = %buffer.id(), requested = size, pooled = key.size, "pool hit");
                return Ok(buffer);
            }
        }

        let buffer = self.allocate_buffer(size, buffer_type, usage, name)?;
        let key = buffer.pool_key();
        self.pools
            .entry(key)
            .or_insert_with(|| MemoryPool::new(key))
            .used
            .push(Arc::clone(&buffer));
        self.update_stats();
        tracing::trace!(id = %buffer.id(), size, "pool miss, new buffer pooled");
        Ok(buffer)
    }

    /// Return a pooled buffer to its free list. False if it was not in use.
    pub fn release_to_pool(&mut self, buffer: &Arc<GpuBuffer>) -> Result<bool> {
        self.ctx.check_thread()?;
        if buffer.is_mapped() {
            self.ctx.with(|b| b.unmap_buffer(buffer.id()))?;
            buffer.set_mapped(false);
        }
        let released = self
            .pools
            .get_mut(&buffer.pool_key())
            .is_some_and(|p| p.release(buffer.id()));
        if released {
            self.update_stats();
        }
        Ok(released)
    }

    /// Destroy a buffer and drop all bookkeeping for it. False if unknown.
    pub fn deallocate_buffer(&mut self, buffer: &Arc<GpuBuffer>) -> Result<bool> {
        self.ctx.check_thread()?;
        let Some(pos) = self.buffers.iter().position(|b| b.id() == buffer.id()) else {
            return Ok(false);
        };
        let owned = self.buffers.remove(pos);
        self.destroy_native(&owned)?;
        if let Some(pool) = self.pools.get_mut(&owned.pool_key()) {
            pool.remove(owned.id());
        }
        self.names
            .retain(|_, w| w.upgrade().is_some_and(|b| b.id() != owned.id()));
        self.update_stats();
        tracing::trace!(id = %owned.id(), name = owned.name(), "buffer deallocated");
        Ok(true)
    }

    /// Upload `data` at `offset`. Statistics are recorded whether or not the copy happens.
    pub fn transfer_to_gpu(&mut self, buffer: &GpuBuffer, data: &[u8], offset: u64) -> Result<()> {
        self.ctx.check_thread()?;
        let start = Instant::now();
        let result = self
            .validate_range(buffer, offset, data.len() as u64)
            .and_then(|_| self.ctx.with(|b| b.write_buffer(buffer.id(), offset, data))?);
        let ok = result.is_ok();
        self.stats
            .transfers
            .record(if ok { data.len() as u64 } else { 0 }, start.elapsed(), ok);
        result.map_err(|e| self.fail(e))
    }

    /// Read `len` bytes at `offset`.
    pub fn transfer_from_gpu(&mut self, buffer: &GpuBuffer, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.ctx.check_thread()?;
        let start = Instant::now();
        let result = self
            .validate_range(buffer, offset, len)
            .and_then(|_| self.ctx.with(|b| b.read_buffer(buffer.id(), offset, len))?);
        let ok = result.is_ok();
        self.stats
            .transfers
            .record(if ok { len } else { 0 }, start.elapsed(), ok);
        result.map_err(|e| self.fail(e))
    }

    pub fn map_buffer(&mut self, buffer: &GpuBuffer) -> Result<()> {
        self.ctx.check_thread()?;
        if !self.is_managed(buffer.id()) {
            return Err(self.fail(Error::UnknownBuffer(buffer.name().to_string())));
        }
        if buffer.is_mapped() {
            return Err(self.fail(Error::invalid_state(format!("'{}' is already mapped", buffer.name()))));
        }
        match self.ctx.with(|b| b.map_buffer(buffer.id()))? {
            Ok(()) => {
                buffer.set_mapped(true);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn unmap_buffer(&mut self, buffer: &GpuBuffer) -> Result<()> {
        self.ctx.check_thread()?;
        if buffer.is_mapped() {
            self.ctx.with(|b| b.unmap_buffer(buffer.id()))?;
            buffer.set_mapped(false);
        }
        Ok(())
    }

    /// Look up a live buffer by name.
    pub fn find_buffer(&self, name: &str) -> Option<Arc<GpuBuffer>> {
        self.names.get(name).and_then(Weak::upgrade)
    }

    /// Evict dead weak references from the name index. No data moves.
    pub fn defragment(&mut self) -> usize {
        let before = self.names.len();
        self.names.retain(|_, w| w.strong_count() > 0);
        let evicted = before - self.names.len();
        if evicted > 0 {
            tracing::debug!(evicted, "name index pruned");
        }
        evicted
    }

    /// [`defragment`](Self::defragment) plus a stats refresh.
    pub fn garbage_collect(&mut self) -> usize {
        let evicted = self.defragment();
        self.update_stats();
        evicted
    }

    /// Reclaim pooled buffers nobody outside the manager references, then
    /// trim free buffers beyond a quarter of `max_buffers`.
    pub fn optimize_memory_pools(&mut self) -> Result<PoolOptimization> {
        self.ctx.check_thread()?;
        let mut result = PoolOptimization::default();

        // Manager list + pool used list = 2 internal references.
        for pool in self.pools.values_mut() {
            let idle: Vec<BufferId> = pool
                .used
                .iter()
                .filter(|b| Arc::strong_count(*b) <= 2)
                .map(|b| b.id())
                .collect();
            for id in idle {
                if pool.release(id) {
                    result.reclaimed += 1;
                }
            }
        }

        let keep = self.config.max_buffers / 4;
        let mut free_total: usize = self.pools.values().map(|p| p.free.len()).sum();
        let mut victims = Vec::new();
        if free_total > keep {
            let mut keys: Vec<PoolKey> = self.pools.keys().copied().collect();
            // Largest buffers go first.
            keys.sort_by(|a, b| b.size.cmp(&a.size));
            for key in keys {
                let Some(pool) = self.pools.get_mut(&key) else { continue };
                while free_total > keep {
                    let Some(buf) = pool.free.pop() else { break };
                    victims.push(buf);
                    free_total -= 1;
                }
            }
        }
        for buf in victims {
            if let Some(pos) = self.buffers.iter().position(|b| b.id() == buf.id()) {
                self.buffers.remove(pos);
            }
            self.destroy_native(&buf)?;
            result.trimmed += 1;
        }

        self.defragment();
        self.update_stats();
        if result != PoolOptimization::default() {
            tracing::debug!(reclaimed = result.reclaimed, trimmed = result.trimmed, "pools optimized");
        }
        Ok(result)
    }

    /// Buffers still holding native memory that the application dropped
    /// without deallocating. Idle pool buffers are not leaks.
    pub fn leaked_buffers(&self) -> Vec<LeakedBuffer> {
        self.buffers
            .iter()
            .filter(|b| {
                let pool = self.pools.get(&b.pool_key());
                if pool.is_some_and(|p| p.free.iter().any(|f| f.id() == b.id())) {
                    return false;
                }
                let pooled = pool.is_some_and(|p| p.contains(b.id()));
                Arc::strong_count(*b) <= 1 + usize::from(pooled)
            })
            .map(|b| LeakedBuffer { id: b.id(), name: b.name().to_string(), size: b.size() })
            .collect()
    }

    /// Release every native buffer and clear all bookkeeping.
    pub fn shutdown(&mut self) -> Result<()> {
        self.ctx.check_thread()?;
        let leaks = self.leaked_buffers();
        if !leaks.is_empty() {
            tracing::warn!(count = leaks.len(), "releasing buffers that were never deallocated");
        }
        let buffers = std::mem::take(&mut self.buffers);
        for buf in &buffers {
            self.destroy_native(buf)?;
        }
        self.pools.clear();
        self.names.clear();
        self.update_stats();
        self.initialized = false;
        tracing::debug!(released = buffers.len(), "memory manager shut down");
        Ok(())
    }

    /// Human readable summary of memory state.
    pub fn memory_report(&self) -> String {
        let s = &self.stats;
        let mut out = String::new();
        let _ = writeln!(out, "GPU memory ({}):", self.ctx.backend_name());
        let _ = writeln!(
            out,
            "  allocated: {:.2} MB / {} MB, used: {:.2} MB, peak: {:.2} MB",
            mb(s.total_allocated),
            self.config.max_memory_mb,
            mb(s.total_used),
            mb(s.peak_usage)
        );
        let _ = writeln!(
            out,
            "  buffers: {} / {}, pools: {}, fragmentation: {:.1}%",
            s.buffer_count,
            self.config.max_buffers,
            s.pool_count,
            s.fragmentation_ratio * 100.0
        );
        let t = &s.transfers;
        let _ = writeln!(
            out,
            "  transfers: {} ({} failed), {:.2} MB, avg {:?}, peak {:?}, {:.1} MB/s",
            t.transfer_count,
            t.failed_transfers,
            mb(t.total_bytes),
            t.average_time,
            t.peak_time,
            t.throughput_mb_s()
        );
        let mut pools: Vec<&MemoryPool> = self.pools.values().filter(|p| p.free.len() + p.used.len() > 0).collect();
        pools.sort_by_key(|p| p.key.size);
        for p in pools {
            let _ = writeln!(
                out,
                "  pool {:>10} B {:?}/{:?}: {} free, {} used",
                p.key.size,
                p.key.buffer_type,
                p.key.usage,
                p.free.len(),
                p.used.len()
            );
        }
        for leak in self.leaked_buffers() {
            let _ = writeln!(out, "  leaked: {} '{}' ({} B)", leak.id, leak.name, leak.size);
        }
        out
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// (free, used) counts of the pool with this exact signature.
    pub fn pool_occupancy(&self, key: &PoolKey) -> Option<(usize, usize)> {
        self.pools.get(key).map(|p| (p.free.len(), p.used.len()))
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    fn is_managed(&self, id: BufferId) -> bool {
        self.buffers.iter().any(|b| b.id() == id)
    }

    fn validate_range(&self, buffer: &GpuBuffer, offset: u64, len: u64) -> Result<()> {
        if !self.is_managed(buffer.id()) {
            return Err(Error::UnknownBuffer(buffer.name().to_string()));
        }
        match offset.checked_add(len) {
            Some(end) if end <= buffer.size() => Ok(()),
            _ => Err(Error::OutOfBounds {
                name: buffer.name().to_string(),
                offset,
                len,
                size: buffer.size(),
            }),
        }
    }

    fn destroy_native(&self, buffer: &GpuBuffer) -> Result<()> {
        let mapped = buffer.is_mapped();
        self.ctx.with(|b| {
            if mapped {
                b.unmap_buffer(buffer.id());
            }
            b.destroy_buffer(buffer.id());
        })?;
        buffer.set_mapped(false);
        Ok(())
    }

    fn update_stats(&mut self) {
        let allocated: u64 = self.buffers.iter().map(|b| b.size()).sum();
        let idle: u64 = self.pools.values().map(|p| p.free_bytes()).sum();
        let s = &mut self.stats;
        s.total_allocated = allocated;
        s.total_used = allocated.saturating_sub(idle);
        s.peak_usage = s.peak_usage.max(allocated);
        s.buffer_count = self.buffers.len();
        s.pool_count = self.pools.len();
        s.fragmentation_ratio = if allocated == 0 {
            0.0
        } else {
            1.0 - s.total_used as f64 / allocated as f64
        };
    }

    fn fail(&mut self, err: Error) -> Error {
        tracing::debug!("memory manager: {err}");
        self.last_error = Some(err.to_string());
        err
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if !self.buffers.is_empty() && self.ctx.is_owner_thread() {
            let _ = self.shutdown();
        }
    }
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BackendCapabilities, SoftwareBackend};

    fn manager_with(config: MemoryConfig) -> MemoryManager {
        let ctx = GpuContext::new(Box::new(SoftwareBackend::new()));
        let mut mm = MemoryManager::new(ctx, config);
        mm.initialize().unwrap();
        mm
    }

    fn manager() -> MemoryManager {
        manager_with(MemoryConfig::default())
    }

    fn native_allocs(mm: &MemoryManager) -> u64 {
        mm.context().with(|b| b.native_allocation_count()).unwrap()
    }

    const SSBO: BufferType = BufferType::ShaderStorage;
    const DYN: UsagePattern = UsagePattern::Dynamic;

    #[test]
    fn test_initialize_requires_capabilities() {
        let sw = SoftwareBackend::new().with_capabilities(BackendCapabilities {
            compute_shaders: true,
            storage_buffers: false,
            buffer_mapping: true,
            ..Default::default()
        });
        let mut mm = MemoryManager::new(GpuContext::new(Box::new(sw)), MemoryConfig::default());
        let err = mm.initialize().unwrap_err();
        assert!(err.is_capability());
        assert!(mm.last_error().unwrap().contains("storage buffers"));
        assert!(!mm.is_initialized());
    }

    #[test]
    fn test_default_pools_created() {
        let mm = manager();
        assert_eq!(mm.pool_count(), 3);
        assert_eq!(mm.buffer_count(), 0);
    }

    #[test]
    fn test_allocate_and_find() {
        let mut mm = manager();
        let buf = mm.allocate_buffer(256, SSBO, DYN, "scene").unwrap();
        assert_eq!(mm.stats().total_allocated, 256);
        assert_eq!(mm.stats().buffer_count, 1);
        assert_eq!(mm.find_buffer("scene").unwrap().id(), buf.id());
        assert!(mm.find_buffer("nope").is_none());
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut mm = manager();
        assert!(mm.allocate_buffer(0, SSBO, DYN, "z").is_err());
        assert_eq!(mm.stats().buffer_count, 0);
    }

    #[test]
    fn test_buffer_count_limit_has_no_side_effects() {
        let mut mm = manager_with(MemoryConfig { max_buffers: 2, ..Default::default() });
        mm.allocate_buffer(16, SSBO, DYN, "a").unwrap();
        mm.allocate_buffer(16, SSBO, DYN, "b").unwrap();
        let before = mm.stats().clone();
        let allocs = native_allocs(&mm);

        let err = mm.allocate_buffer(16, SSBO, DYN, "c").unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(mm.stats(), &before);
        assert_eq!(native_allocs(&mm), allocs);
        assert!(mm.find_buffer("c").is_none());
    }

    #[test]
    fn test_memory_budget_limit() {
        let mut mm = manager_with(MemoryConfig { max_memory_mb: 1, ..Default::default() });
        mm.allocate_buffer(768 << 10, SSBO, DYN, "big").unwrap();
        let err = mm.allocate_buffer(512 << 10, SSBO, DYN, "bigger").unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(mm.stats().total_allocated, 768 << 10);
        assert!(mm.last_error().unwrap().contains("budget"));
    }

    #[test]
    fn test_pool_reuse_without_native_allocation() {
        let mut mm = manager();
        let a = mm.allocate_from_pool(1000, SSBO, DYN, "a").unwrap();
        let allocs = native_allocs(&mm);
        let id = a.id();

        assert!(mm.release_to_pool(&a).unwrap());
        drop(a);
        let b = mm.allocate_from_pool(1000, SSBO, DYN, "b").unwrap();
        assert_eq!(b.id(), id);
        assert_eq!(native_allocs(&mm), allocs);
        assert_eq!(mm.buffer_count(), 1);
    }

    #[test]
    fn test_pool_best_fit() {
        let mut mm = manager();
        let small = mm.allocate_from_pool(4096, SSBO, DYN, "small").unwrap();
        let large = mm.allocate_from_pool(65536, SSBO, DYN, "large").unwrap();
        mm.release_to_pool(&small).unwrap();
        mm.release_to_pool(&large).unwrap();

        let got = mm.allocate_from_pool(2000, SSBO, DYN, "req").unwrap();
        assert_eq!(got.id(), small.id());
        // Different usage never matches.
        let other = mm.allocate_from_pool(2000, SSBO, UsagePattern::Static, "s").unwrap();
        assert_ne!(other.id(), large.id());
    }

    #[test]
    fn test_release_to_pool_updates_fragmentation() {
        let mut mm = manager();
        let a = mm.allocate_from_pool(1024, SSBO, DYN, "a").unwrap();
        mm.allocate_from_pool(1024, SSBO, DYN, "b").unwrap();
        assert_eq!(mm.stats().fragmentation_ratio, 0.0);
        mm.release_to_pool(&a).unwrap();
        assert!((mm.stats().fragmentation_ratio - 0.5).abs() < 1e-9);
        assert_eq!(mm.stats().total_used, 1024);
    }

    #[test]
    fn test_deallocate() {
        let mut mm = manager();
        let a = mm.allocate_from_pool(128, SSBO, DYN, "a").unwrap();
        mm.map_buffer(&a).unwrap();
        assert!(mm.deallocate_buffer(&a).unwrap());
        assert!(!a.is_mapped());
        assert!(!mm.deallocate_buffer(&a).unwrap());
        assert_eq!(mm.stats().total_allocated, 0);
        assert!(mm.find_buffer("a").is_none());
        let key = a.pool_key();
        assert_eq!(mm.pool_occupancy(&key), Some((0, 0)));
    }

    #[test]
    fn test_transfer_round_trip() {
        let mut mm = manager();
        let buf = mm.allocate_buffer(64, SSBO, DYN, "t").unwrap();
        let data: Vec<u8> = (0..32).collect();
        mm.transfer_to_gpu(&buf, &data, 16).unwrap();
        assert_eq!(mm.transfer_from_gpu(&buf, 16, 32).unwrap(), data);
        let t = &mm.stats().transfers;
        assert_eq!(t.transfer_count, 2);
        assert_eq!(t.total_bytes, 64);
    }

    #[test]
    fn test_transfer_out_of_bounds_is_recorded() {
        let mut mm = manager();
        let buf = mm.allocate_buffer(16, SSBO, DYN, "t").unwrap();
        let err = mm.transfer_to_gpu(&buf, &[0; 8], 12).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { offset: 12, len: 8, size: 16, .. }));
        assert_eq!(mm.stats().transfers.transfer_count, 1);
        assert_eq!(mm.stats().transfers.failed_transfers, 1);
    }

    #[test]
    fn test_defragment_prunes_dead_names() {
        let mut mm = manager();
        let a = mm.allocate_buffer(16, SSBO, DYN, "a").unwrap();
        mm.deallocate_buffer(&a).unwrap();
        drop(a);
        let b = mm.allocate_buffer(16, SSBO, DYN, "b").unwrap();
        drop(b);
        // "b" is still owned by the manager, so its weak stays alive.
        assert_eq!(mm.defragment(), 0);
        assert!(mm.find_buffer("b").is_some());
    }

    #[test]
    fn test_optimize_reclaims_and_trims() {
        let mut mm = manager_with(MemoryConfig { max_buffers: 8, ..Default::default() });
        let held = mm.allocate_from_pool(512, SSBO, DYN, "held").unwrap();
        for i in 0..4 {
            // Dropped right away: only the manager keeps them.
            mm.allocate_from_pool(512, SSBO, DYN, &format!("tmp{i}")).unwrap();
        }
        let opt = mm.optimize_memory_pools().unwrap();
        assert_eq!(opt.reclaimed, 4);
        // 4 free, quarter of 8 = 2 kept.
        assert_eq!(opt.trimmed, 2);
        assert_eq!(mm.buffer_count(), 3);
        assert_eq!(mm.pool_occupancy(&held.pool_key()), Some((2, 1)));
    }

    #[test]
    fn test_leaked_buffers() {
        let mut mm = manager();
        let kept = mm.allocate_buffer(32, SSBO, DYN, "kept").unwrap();
        mm.allocate_buffer(32, SSBO, DYN, "lost").unwrap();
        let pooled = mm.allocate_from_pool(32, SSBO, DYN, "pooled").unwrap();
        mm.release_to_pool(&pooled).unwrap();

        let leaks = mm.leaked_buffers();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].name, "lost");
        assert!(mm.memory_report().contains("leaked"));
        drop(kept);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut mm = manager();
        mm.allocate_buffer(32, SSBO, DYN, "a").unwrap();
        mm.allocate_from_pool(32, SSBO, DYN, "b").unwrap();
        mm.shutdown().unwrap();
        assert_eq!(mm.buffer_count(), 0);
        assert_eq!(mm.stats().total_allocated, 0);
        let live = mm
            .context()
            .with_backend(|sw: &mut SoftwareBackend| sw.live_buffer_count())
            .unwrap();
        assert_eq!(live, Some(0));
    }
}
