//! End-to-end progressive rendering on the software device.

use std::cell::Cell;
use std::sync::atomic::AtomicBool;

use hybrid_trace::prelude::*;
use hybrid_trace::render::CpuRenderer;
use hybrid_trace::scheduler::SchedulerStatus;

const MAX_TICKS: usize = 10_000;

fn gpu_engine() -> HybridEngine {
    let mut cfg = EngineConfig::default();
    cfg.selector.mode = SelectionMode::AlwaysGpu;
    cfg.scheduler.initial_samples = 1;
    cfg.scheduler.total_steps = 4;
    cfg.scheduler.update_interval_ms = 0;
    HybridEngine::new(cfg, Box::new(SoftwareBackend::new())).unwrap()
}

fn settings() -> RenderSettings {
    RenderSettings::new(16, 12, 16).with_max_depth(4)
}

#[test]
fn test_progressive_reaches_target() {
    let mut engine = gpu_engine();
    let settings = settings();
    let camera = Camera::demo(settings.aspect());
    assert_eq!(engine.start_progressive(&Scene::demo(), &camera, &settings).unwrap(), Backend::Gpu);

    let mut frames: Vec<(u32, u32)> = Vec::new();
    let mut last = Vec::new();
    let mut sink = |px: &[f32], w: u32, h: u32, current: u32, target: u32| {
        assert_eq!((w, h), (16, 12));
        frames.push((current, target));
        last = px.to_vec();
    };
    let mut ticks = 0;
    while engine.scheduler().is_active() {
        engine.tick(&mut sink).unwrap();
        ticks += 1;
        assert!(ticks < MAX_TICKS, "progressive run did not finish");
    }

    assert_eq!(frames, vec![(4, 16), (7, 16), (10, 16), (16, 16)]);
    assert_eq!(engine.scheduler().status(), SchedulerStatus::Completed);
    assert_eq!(engine.scheduler().state().current_samples, 16);
    assert_eq!(last.len(), 16 * 12 * 4);

    // Accumulated passes must match a single CPU render of all samples.
    let stop = AtomicBool::new(false);
    let cpu = CpuRenderer::render(&Scene::demo(), &camera, &settings, &stop, None).unwrap();
    let max_diff = cpu.iter().zip(&last).map(|(a, b)| (a - b).abs()).fold(0.0f32, f32::max);
    assert!(max_diff < 1e-4, "max difference {max_diff}");
}

#[test]
fn test_cancel_then_restart() {
    let mut engine = gpu_engine();
    let settings = settings();
    let camera = Camera::demo(settings.aspect());
    engine.start_progressive(&Scene::demo(), &camera, &settings).unwrap();

    let presented = Cell::new(0u32);
    let mut sink = |_: &[f32], _: u32, _: u32, _: u32, _: u32| presented.set(presented.get() + 1);

    assert!(matches!(engine.tick(&mut sink).unwrap(), StepStatus::Dispatched { .. }));
    engine.cancel();
    assert!(!engine.scheduler().is_active());
    assert_eq!(engine.scheduler().status(), SchedulerStatus::Cancelled);

    let mut ticks = 0;
    while engine.scheduler().is_busy() {
        engine.tick(&mut sink).unwrap();
        ticks += 1;
        assert!(ticks < MAX_TICKS, "cancelled pass never drained");
    }
    assert_eq!(presented.get(), 0);

    assert_eq!(engine.start_progressive(&Scene::demo(), &camera, &settings).unwrap(), Backend::Gpu);
    while engine.scheduler().is_active() {
        engine.tick(&mut sink).unwrap();
        ticks += 1;
        assert!(ticks < MAX_TICKS, "restarted run did not finish");
    }
    assert_eq!(presented.get(), 4);
    assert_eq!(engine.scheduler().status(), SchedulerStatus::Completed);
}

#[test]
fn test_tick_never_waits_for_device() {
    let mut engine = gpu_engine();
    let settings = RenderSettings::new(8, 8, 4);
    engine
        .start_progressive(&Scene::demo(), &Camera::demo(1.0), &settings)
        .unwrap();
    let mut sink = |_: &[f32], _: u32, _: u32, _: u32, _: u32| {};

    // The software fence needs one extra poll, so the tick after a dispatch
    // must report waiting instead of blocking.
    assert!(matches!(engine.tick(&mut sink).unwrap(), StepStatus::Dispatched { start: 0, end: 2 }));
    assert_eq!(engine.tick(&mut sink).unwrap(), StepStatus::Waiting);
    assert!(engine.scheduler().is_busy());
}
