//! Non-blocking progressive GPU rendering.
//!
//! The scheduler is a plain state machine advanced by [`ProgressiveScheduler::step`]
//! once per main-loop iteration. Each step issues at most one GPU call
//! sequence and never waits: an outstanding pass is polled with a
//! zero-timeout check and the step returns immediately while it is pending.
//! All GPU work therefore happens on the thread that calls `step`, which must
//! own the graphics context.
//!
//! ```text
//! Idle ──start──> Active(dispatching) ──dispatch_async──> Active(awaiting)
//!                      ^                                      │ complete:
//!                      └──────── present, advance ────────────┘
//! Active ──steps or samples exhausted──> Completed
//! Active ──cancel──> Cancelled   (in-flight pass drained and discarded later)
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use crate::config::SchedulerConfig;
use crate::util::{Error, Result};

/// GPU work the scheduler can drive pass by pass.
///
/// A pass accumulates samples `[start, end)` on top of the samples already
/// accumulated; `start == 0` restarts accumulation.
pub trait ProgressiveTarget {
    /// Context valid, kernel built and a frame loaded.
    fn is_ready(&self) -> bool;
    fn dimensions(&self) -> (u32, u32);
    /// Issue the pass asynchronously.
    fn begin_pass(&mut self, start: u32, end: u32) -> Result<()>;
    /// Zero-timeout completion check.
    fn poll_pass(&mut self) -> Result<bool>;
    /// Read back the accumulated image of a completed pass (RGBA f32).
    fn finish_pass(&mut self) -> Result<Vec<f32>>;
    /// Drop the outstanding pass once the device is done with it.
    /// Returns false while it is still running.
    fn discard_pass(&mut self) -> Result<bool>;
}

/// Receives each completed progressive image.
pub trait FrameSink {
    fn present(&mut self, pixels: &[f32], width: u32, height: u32, current_samples: u32, target_samples: u32);
}

impl<F: FnMut(&[f32], u32, u32, u32, u32)> FrameSink for F {
    fn present(&mut self, pixels: &[f32], width: u32, height: u32, current: u32, target: u32) {
        self(pixels, width, height, current, target)
    }
}

/// Sink that drops every frame.
pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&mut self, _: &[f32], _: u32, _: u32, _: u32, _: u32) {}
}

/// Called once per completed step with `(width, height, current, target)`.
pub type ProgressCallback = Box<dyn FnMut(u32, u32, u32, u32)>;

/// Progress bookkeeping of one progressive run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressiveState {
    pub active: bool,
    pub current_step: u32,
    pub current_samples: u32,
    pub target_samples: u32,
    pub sample_increment: u32,
    pub total_steps: u32,
    pub update_interval: Duration,
    pub waiting_for_async_completion: bool,
    /// Samples held by the accumulation buffer
    pub accumulated: u32,
    /// End sample of the pass in flight
    pub pending_samples: u32,
}

impl ProgressiveState {
    fn new(initial: u32, target: u32, steps: u32, interval: Duration) -> Self {
        Self {
            active: true,
            current_step: 0,
            current_samples: initial,
            target_samples: target,
            sample_increment: ((target - initial) / steps).max(1),
            total_steps: steps,
            update_interval: interval,
            waiting_for_async_completion: false,
            accumulated: 0,
            pending_samples: 0,
        }
    }

    fn idle() -> Self {
        Self {
            active: false,
            current_step: 0,
            current_samples: 0,
            target_samples: 0,
            sample_increment: 0,
            total_steps: 0,
            update_interval: Duration::ZERO,
            waiting_for_async_completion: false,
            accumulated: 0,
            pending_samples: 0,
        }
    }

    /// True once every step ran or the target sample count is reached.
    pub fn is_exhausted(&self) -> bool {
        self.current_step >= self.total_steps || self.current_samples >= self.target_samples
    }

    /// End sample of the next pass; the last step always lands on the target.
    pub fn next_samples(&self) -> u32 {
        if self.current_step + 1 >= self.total_steps {
            self.target_samples
        } else {
            (self.current_samples + self.sample_increment).min(self.target_samples)
        }
    }

    /// Fraction of the target reached, in [0, 1].
    pub fn fraction(&self) -> f32 {
        if self.target_samples == 0 {
            return 0.0;
        }
        (self.current_samples as f32 / self.target_samples as f32).min(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Idle,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        })
    }
}

/// Outcome of one [`ProgressiveScheduler::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// No run active
    Idle,
    /// Pass still executing (or a cancelled pass still draining)
    Waiting,
    /// Too early for the next dispatch
    Throttled,
    /// A new pass was issued
    Dispatched { start: u32, end: u32 },
    /// A pass finished and its image was presented
    Presented { samples: u32 },
    /// The run reached its target
    Completed,
}

/// Counters over the scheduler's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_cancelled: u64,
    pub passes: u64,
    pub discarded_passes: u64,
    /// Dispatch to completion of the last pass
    pub last_pass: Duration,
}

pub struct ProgressiveScheduler {
    config: SchedulerConfig,
    state: ProgressiveState,
    status: SchedulerStatus,
    last_update: Option<Instant>,
    pass_started: Option<Instant>,
    /// A cancelled pass is still on the device
    discard_pending: bool,
    progress: Option<ProgressCallback>,
    stats: SchedulerStats,
}

impl ProgressiveScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: ProgressiveState::idle(),
            status: SchedulerStatus::Idle,
            last_update: None,
            pass_started: None,
            discard_pending: false,
            progress: None,
            stats: SchedulerStats::default(),
        }
    }

    /// Install the per-step progress callback.
    pub fn on_progress(&mut self, callback: impl FnMut(u32, u32, u32, u32) + 'static) {
        self.progress = Some(Box::new(callback));
    }

    /// Start a run with the configured sample range.
    pub fn start(&mut self, target: &dyn ProgressiveTarget) -> Result<()> {
        let c = self.config.clone();
        self.start_with(target, c.initial_samples, c.target_samples, c.total_steps, c.update_interval())
    }

    /// Start a run from `initial` to `target_samples` over `steps` passes.
    ///
    /// Starting while a run is active cancels it first. No GPU call is made
    /// here; the first pass is issued by the next [`step`](Self::step).
    pub fn start_with(
        &mut self,
        target: &dyn ProgressiveTarget,
        initial: u32,
        target_samples: u32,
        steps: u32,
        interval: Duration,
    ) -> Result<()> {
        if !target.is_ready() {
            return Err(Error::invalid_state("progressive target not ready (no kernel or scene)"));
        }
        if steps == 0 {
            return Err(Error::Config("progressive run needs at least one step".into()));
        }
        if target_samples == 0 || initial > target_samples {
            return Err(Error::Config(format!(
                "invalid sample range {initial} -> {target_samples}"
            )));
        }
        if self.state.active {
            self.cancel();
        }

        self.state = ProgressiveState::new(initial, target_samples, steps, interval);
        self.status = SchedulerStatus::Active;
        self.last_update = None;
        self.stats.runs_started += 1;
        tracing::info!(
            initial,
            target = target_samples,
            steps,
            increment = self.state.sample_increment,
            "progressive render started"
        );
        Ok(())
    }

    /// Stop the run. The pass in flight, if any, is left to finish on the
    /// device and discarded by a later step.
    pub fn cancel(&mut self) {
        if !self.state.active {
            return;
        }
        if self.state.waiting_for_async_completion {
            self.discard_pending = true;
        }
        self.state.active = false;
        self.state.waiting_for_async_completion = false;
        self.status = SchedulerStatus::Cancelled;
        self.stats.runs_cancelled += 1;
        tracing::info!(samples = self.state.current_samples, "progressive render cancelled");
    }

    /// Advance the run by at most one transition. Never blocks.
    pub fn step(&mut self, target: &mut dyn ProgressiveTarget, sink: &mut dyn FrameSink) -> Result<StepStatus> {
        if self.discard_pending {
            if !target.discard_pass()? {
                return Ok(StepStatus::Waiting);
            }
            self.discard_pending = false;
            self.stats.discarded_passes += 1;
        }
        if !self.state.active {
            return Ok(StepStatus::Idle);
        }

        if self.state.waiting_for_async_completion {
            let done = match target.poll_pass() {
                Ok(done) => done,
                Err(e) => return Err(self.abort(e)),
            };
            if !done {
                return Ok(StepStatus::Waiting);
            }
            let pixels = match target.finish_pass() {
                Ok(p) => p,
                Err(e) => return Err(self.abort(e)),
            };
            return Ok(self.finalize_pass(target, sink, &pixels));
        }

        if self.state.is_exhausted() {
            self.complete();
            return Ok(StepStatus::Completed);
        }

        if let Some(last) = self.last_update {
            if last.elapsed() < self.state.update_interval {
                return Ok(StepStatus::Throttled);
            }
        }

        let start = self.state.accumulated;
        let end = self.state.next_samples().max(start + 1);
        if let Err(e) = target.begin_pass(start, end) {
            return Err(self.abort(e));
        }
        self.state.waiting_for_async_completion = true;
        self.state.pending_samples = end;
        self.pass_started = Some(Instant::now());
        tracing::debug!(step = self.state.current_step, start, end, "progressive pass dispatched");
        Ok(StepStatus::Dispatched { start, end })
    }

    fn finalize_pass(&mut self, target: &dyn ProgressiveTarget, sink: &mut dyn FrameSink, pixels: &[f32]) -> StepStatus {
        let s = &mut self.state;
        s.waiting_for_async_completion = false;
        s.accumulated = s.pending_samples;
        s.current_samples = s.pending_samples.min(s.target_samples);
        s.current_step += 1;
        let (current, goal) = (s.current_samples, s.target_samples);

        self.stats.passes += 1;
        if let Some(t) = self.pass_started.take() {
            self.stats.last_pass = t.elapsed();
        }
        self.last_update = Some(Instant::now());

        let (w, h) = target.dimensions();
        sink.present(pixels, w, h, current, goal);
        if let Some(cb) = self.progress.as_mut() {
            cb(w, h, current, goal);
        }
        tracing::debug!(step = self.state.current_step, current, goal, "progressive pass presented");

        if self.state.is_exhausted() {
            self.complete();
            return StepStatus::Completed;
        }
        StepStatus::Presented { samples: current }
    }

    fn complete(&mut self) {
        self.state.active = false;
        self.state.waiting_for_async_completion = false;
        self.status = SchedulerStatus::Completed;
        self.stats.runs_completed += 1;
        tracing::info!(
            samples = self.state.current_samples,
            steps = self.state.current_step,
            "progressive render completed"
        );
    }

    fn abort(&mut self, err: Error) -> Error {
        tracing::error!("progressive render failed: {err}");
        self.state.active = false;
        self.state.waiting_for_async_completion = false;
        self.status = SchedulerStatus::Failed;
        err
    }

    pub fn is_active(&self) -> bool {
        self.state.active
    }

    /// True while the run waits on the device or a cancelled pass drains.
    pub fn is_busy(&self) -> bool {
        self.state.waiting_for_async_completion || self.discard_pending
    }

    pub fn state(&self) -> &ProgressiveState {
        &self.state
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Target completing each pass after `latency` polls.
    struct FakeTarget {
        latency: u32,
        polls: u32,
        pass: Option<(u32, u32)>,
        accumulated: u32,
        gpu_calls: u32,
        fail_next: bool,
    }

    impl FakeTarget {
        fn new(latency: u32) -> Self {
            Self { latency, polls: 0, pass: None, accumulated: 0, gpu_calls: 0, fail_next: false }
        }
    }

    impl ProgressiveTarget for FakeTarget {
        fn is_ready(&self) -> bool {
            true
        }
        fn dimensions(&self) -> (u32, u32) {
            (2, 1)
        }
        fn begin_pass(&mut self, start: u32, end: u32) -> Result<()> {
            self.gpu_calls += 1;
            if self.pass.is_some() {
                return Err(Error::AsyncInFlight { fence: 1 });
            }
            assert_eq!(start, self.accumulated);
            self.pass = Some((start, end));
            self.polls = 0;
            Ok(())
        }
        fn poll_pass(&mut self) -> Result<bool> {
            self.gpu_calls += 1;
            if std::mem::take(&mut self.fail_next) {
                self.pass = None;
                return Err(Error::Driver { code: 0x0505, operation: "async dispatch".into() });
            }
            self.polls += 1;
            Ok(self.polls > self.latency)
        }
        fn finish_pass(&mut self) -> Result<Vec<f32>> {
            let (_, end) = self.pass.take().ok_or_else(|| Error::invalid_state("no pass"))?;
            self.accumulated = end;
            Ok(vec![end as f32; 8])
        }
        fn discard_pass(&mut self) -> Result<bool> {
            if self.poll_pass()? {
                self.pass = None;
                return Ok(true);
            }
            Ok(false)
        }
    }

    fn run_to_end(sched: &mut ProgressiveScheduler, t: &mut FakeTarget, sink: &mut dyn FrameSink) -> Vec<StepStatus> {
        let mut out = Vec::new();
        for _ in 0..100 {
            let s = sched.step(t, sink).unwrap();
            out.push(s);
            if s == StepStatus::Completed {
                break;
            }
        }
        out
    }

    #[test]
    fn test_increment_and_pass_sizes() {
        let s = ProgressiveState::new(1, 16, 4, Duration::ZERO);
        assert_eq!(s.sample_increment, 3);
        let s = ProgressiveState::new(10, 12, 8, Duration::ZERO);
        assert_eq!(s.sample_increment, 1);
    }

    #[test]
    fn test_run_reaches_target() {
        let mut sched = ProgressiveScheduler::new(SchedulerConfig::default());
        let mut t = FakeTarget::new(2);
        let mut presented = Vec::new();
        let mut sink = |px: &[f32], w: u32, h: u32, cur: u32, goal: u32| {
            assert_eq!((w, h, px.len()), (2, 1, 8));
            presented.push((cur, goal));
        };
        sched.start_with(&t, 1, 16, 4, Duration::ZERO).unwrap();
        let steps = run_to_end(&mut sched, &mut t, &mut sink);

        assert_eq!(steps.last(), Some(&StepStatus::Completed));
        assert_eq!(presented, vec![(4, 16), (7, 16), (10, 16), (16, 16)]);
        assert_eq!(sched.status(), SchedulerStatus::Completed);
        assert_eq!(sched.state().current_samples, 16);
        assert_eq!(sched.state().current_step, 4);
        assert!(!sched.is_active());
        assert!(steps.contains(&StepStatus::Waiting));
    }

    #[test]
    fn test_waiting_makes_no_new_dispatch() {
        let mut sched = ProgressiveScheduler::new(SchedulerConfig::default());
        let mut t = FakeTarget::new(5);
        sched.start_with(&t, 1, 16, 4, Duration::ZERO).unwrap();
        assert_eq!(sched.step(&mut t, &mut NullSink).unwrap(), StepStatus::Dispatched { start: 0, end: 4 });
        for _ in 0..5 {
            assert_eq!(sched.step(&mut t, &mut NullSink).unwrap(), StepStatus::Waiting);
        }
        // Only polls since the dispatch.
        assert_eq!(t.gpu_calls, 6);
        assert!(t.pass.is_some());
    }

    #[test]
    fn test_throttle() {
        let mut sched = ProgressiveScheduler::new(SchedulerConfig::default());
        let mut t = FakeTarget::new(0);
        sched.start_with(&t, 1, 16, 4, Duration::from_secs(3600)).unwrap();
        assert!(matches!(sched.step(&mut t, &mut NullSink).unwrap(), StepStatus::Dispatched { .. }));
        assert_eq!(sched.step(&mut t, &mut NullSink).unwrap(), StepStatus::Presented { samples: 4 });
        assert_eq!(sched.step(&mut t, &mut NullSink).unwrap(), StepStatus::Throttled);
    }

    #[test]
    fn test_cancel_discards_in_flight() {
        let mut sched = ProgressiveScheduler::new(SchedulerConfig::default());
        let mut t = FakeTarget::new(3);
        sched.start_with(&t, 1, 16, 4, Duration::ZERO).unwrap();
        sched.step(&mut t, &mut NullSink).unwrap();
        let calls = t.gpu_calls;
        sched.cancel();
        assert_eq!(t.gpu_calls, calls);
        assert_eq!(sched.status(), SchedulerStatus::Cancelled);
        assert!(sched.is_busy());

        let mut presented = 0;
        let mut sink = |_: &[f32], _: u32, _: u32, _: u32, _: u32| presented += 1;
        let mut last = StepStatus::Waiting;
        for _ in 0..10 {
            last = sched.step(&mut t, &mut sink).unwrap();
        }
        assert_eq!(last, StepStatus::Idle);
        assert_eq!(presented, 0);
        assert!(t.pass.is_none());
        assert_eq!(sched.stats().discarded_passes, 1);
    }

    #[test]
    fn test_restart_after_cancel_waits_for_drain() {
        let mut sched = ProgressiveScheduler::new(SchedulerConfig::default());
        let mut t = FakeTarget::new(2);
        sched.start_with(&t, 1, 8, 2, Duration::ZERO).unwrap();
        sched.step(&mut t, &mut NullSink).unwrap();
        sched.start_with(&t, 1, 8, 2, Duration::ZERO).unwrap();
        // Drains the old pass before issuing a new one.
        let mut statuses = Vec::new();
        for _ in 0..20 {
            let s = sched.step(&mut t, &mut NullSink).unwrap();
            statuses.push(s);
            if s == StepStatus::Completed {
                break;
            }
        }
        assert_eq!(statuses[0], StepStatus::Waiting);
        assert_eq!(sched.state().current_samples, 8);
    }

    #[test]
    fn test_failure_aborts_run() {
        let mut sched = ProgressiveScheduler::new(SchedulerConfig::default());
        let mut t = FakeTarget::new(1);
        sched.start_with(&t, 1, 16, 4, Duration::ZERO).unwrap();
        sched.step(&mut t, &mut NullSink).unwrap();
        t.fail_next = true;
        let err = sched.step(&mut t, &mut NullSink).unwrap_err();
        assert!(matches!(err, Error::Driver { .. }));
        assert_eq!(sched.status(), SchedulerStatus::Failed);
        assert_eq!(sched.step(&mut t, &mut NullSink).unwrap(), StepStatus::Idle);
    }

    #[test]
    fn test_start_validation() {
        let mut sched = ProgressiveScheduler::new(SchedulerConfig::default());
        let t = FakeTarget::new(0);
        assert!(sched.start_with(&t, 1, 16, 0, Duration::ZERO).is_err());
        assert!(sched.start_with(&t, 20, 16, 4, Duration::ZERO).is_err());
        assert!(!sched.is_active());
    }
}
