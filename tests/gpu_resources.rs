//! Memory, pipeline and selector behaviour against the software device.

use std::sync::Arc;

use hybrid_trace::config::{MemoryConfig, SelectorConfig};
use hybrid_trace::gpu::{
    BufferType, ComputePipeline, GpuContext, KernelInvocation, MemoryManager, ShaderSource, SoftwareBackend,
    UsagePattern, WorkGroupSize,
};
use hybrid_trace::prelude::*;
use hybrid_trace::selector::{MAX_THRESHOLD, MIN_THRESHOLD};

fn memory(config: MemoryConfig) -> MemoryManager {
    let mut m = MemoryManager::new(GpuContext::new(Box::new(SoftwareBackend::new())), config);
    m.initialize().unwrap();
    m
}

fn allocations(m: &MemoryManager) -> u64 {
    m.context().with(|b| b.native_allocation_count()).unwrap()
}

#[test]
fn test_pool_reuse_skips_native_allocation() {
    let mut m = memory(MemoryConfig::default());
    let a = m.allocate_from_pool(4096, BufferType::ShaderStorage, UsagePattern::Dynamic, "a").unwrap();
    let before = allocations(&m);
    assert!(m.release_to_pool(&a).unwrap());

    let b = m.allocate_from_pool(1000, BufferType::ShaderStorage, UsagePattern::Dynamic, "b").unwrap();
    assert_eq!(b.id(), a.id());
    assert_eq!(allocations(&m), before);
    assert!(m.release_to_pool(&b).unwrap());
    assert!(!m.release_to_pool(&b).unwrap());
}

#[test]
fn test_limits_leave_state_untouched() {
    let mut m = memory(MemoryConfig { max_buffers: 2, max_memory_mb: 1, ..MemoryConfig::default() });
    m.allocate_buffer(512 << 10, BufferType::ShaderStorage, UsagePattern::Static, "half").unwrap();
    let allocated = m.stats().total_allocated;

    let err = m
        .allocate_buffer(768 << 10, BufferType::ShaderStorage, UsagePattern::Static, "too-big")
        .unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    assert_eq!(m.stats().total_allocated, allocated);
    assert_eq!(m.buffer_count(), 1);
    assert!(m.find_buffer("too-big").is_none());

    m.allocate_buffer(1024, BufferType::Uniform, UsagePattern::Dynamic, "second").unwrap();
    let err = m.allocate_buffer(16, BufferType::Uniform, UsagePattern::Dynamic, "third").unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    assert_eq!(m.buffer_count(), 2);
}

#[test]
fn test_transfer_round_trip() {
    let mut m = memory(MemoryConfig::default());
    let buf = m.allocate_buffer(64, BufferType::ShaderStorage, UsagePattern::Stream, "io").unwrap();
    let data: Vec<u8> = (0..32).collect();
    m.transfer_to_gpu(&buf, &data, 16).unwrap();
    assert_eq!(m.transfer_from_gpu(&buf, 16, 32).unwrap(), data);
    assert!(matches!(m.transfer_to_gpu(&buf, &data, 48), Err(Error::OutOfBounds { .. })));
    assert_eq!(m.stats().transfers.transfer_count, 3);
    assert_eq!(m.stats().transfers.failed_transfers, 1);
}

fn compiled(latency: u32) -> ComputePipeline {
    let mut sw = SoftwareBackend::new().with_fence_latency(latency);
    sw.register_kernel("main", Arc::new(|_: &mut KernelInvocation<'_>| Ok(())));
    let mut p = ComputePipeline::new(GpuContext::new(Box::new(sw)));
    p.initialize().unwrap();
    p.compile_shader(&ShaderSource::new("noop", "@compute @workgroup_size(8, 8, 1)\nfn main() {}", "main"))
        .unwrap();
    p
}

fn pipeline(latency: u32) -> ComputePipeline {
    let mut p = compiled(latency);
    p.link_program(WorkGroupSize::new(8, 8, 1)).unwrap();
    p.use_program().unwrap();
    p
}

#[test]
fn test_single_async_dispatch_in_flight() {
    let mut p = pipeline(3);
    p.dispatch_async(4, 4, 1).unwrap();
    assert!(matches!(p.dispatch_async(4, 4, 1), Err(Error::AsyncInFlight { .. })));
    assert!(p.dispatch(4, 4, 1).is_err());

    let mut polls = 0;
    while !p.is_complete().unwrap() {
        polls += 1;
    }
    assert_eq!(polls, 3);
    assert!(p.take_async_failure().is_none());
    p.dispatch_async(4, 4, 1).unwrap();
}

#[test]
fn test_work_group_over_limit_rejected() {
    let mut p = compiled(0);
    let max = p.limits().max_work_group_size[0];
    assert!(matches!(
        p.link_program(WorkGroupSize::new(max + 1, 1, 1)),
        Err(Error::WorkGroupTooLarge { axis: 'x', .. })
    ));
    assert!(p.link_program(WorkGroupSize::new(8, 8, 1)).is_ok());
}

#[test]
fn test_selector_predictions_scale_with_work() {
    let selector = HybridSelector::new(&SelectorConfig::default());
    let small = SceneCharacteristics::new(64, 64, 4, 8);
    let large = SceneCharacteristics::new(1920, 1080, 64, 8);
    assert!(selector.predict_gpu_time(&large) > selector.predict_gpu_time(&small));
    assert!(selector.predict_cpu_time(&large) > selector.predict_cpu_time(&small));
}

#[test]
fn test_selector_threshold_stays_bounded() {
    let mut selector = HybridSelector::new(&SelectorConfig::default());
    selector.set_gpu_available(true, 1 << 30);
    let scene = SceneCharacteristics::new(640, 480, 16, 8);
    for _ in 0..200 {
        // GPU far slower than predicted: the threshold climbs.
        selector.update_performance_model(&scene, Some(1.0e6), Some(1.0));
    }
    assert!(selector.performance_threshold() <= MAX_THRESHOLD);
    for _ in 0..400 {
        selector.update_performance_model(&scene, Some(1.0e-3), Some(1.0e6));
    }
    assert!(selector.performance_threshold() >= MIN_THRESHOLD);
    assert_eq!(selector.total_decisions(), 600);
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("hybrid-trace.json");
    let mut cfg = EngineConfig::default();
    cfg.render.width = 640;
    cfg.render.backend = BackendKind::Software;
    cfg.scheduler.total_steps = 8;
    cfg.selector.mode = SelectionMode::PerformanceBased;
    cfg.save_to(&path).unwrap();

    let loaded = EngineConfig::from_file(&path).unwrap();
    assert_eq!(loaded, cfg);

    std::fs::write(&path, r#"{ "scheduler": { "total_steps": 0 } }"#).unwrap();
    assert!(EngineConfig::from_file(&path).is_err());
    assert_eq!(EngineConfig::load_or_default(&path), EngineConfig::default());
}
