//! GPU/CPU timing, speedup and regression tracking.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::backend::{GpuContext, QueryId};
use crate::config::MonitorConfig;
use crate::util::Result;

/// Trailing window used as the regression baseline.
const REGRESSION_WINDOW: usize = 5;

/// One frame's worth of timings plus derived metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMeasurement {
    /// Wall time of the GPU section, including transfers
    pub gpu_time_ms: f64,
    /// Device-side compute time from timestamp queries (0 when unavailable)
    pub gpu_compute_ms: f64,
    pub cpu_time_ms: f64,
    pub transfer_time_ms: f64,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub speedup: f64,
    /// compute / total, in [0, 1]
    pub gpu_utilization: f64,
    /// Transfer share of the GPU section, in percent
    pub transfer_overhead: f64,
    /// `speedup * (1 - overhead/100)`
    pub efficiency: f64,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl PerformanceMeasurement {
    /// Recompute speedup, utilization, overhead and efficiency from the raw timings.
    pub fn derive(&mut self) {
        self.speedup = if self.cpu_time_ms > 0.0 && self.gpu_time_ms > 0.0 {
            self.cpu_time_ms / self.gpu_time_ms
        } else {
            0.0
        };
        let total = self.gpu_time_ms;
        self.gpu_utilization = if total > 0.0 { (self.gpu_compute_ms / total).clamp(0.0, 1.0) } else { 0.0 };
        self.transfer_overhead = if total > 0.0 {
            (self.transfer_time_ms / total * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.efficiency = self.speedup * (1.0 - self.transfer_overhead / 100.0);
    }
}

struct ActiveTiming {
    wall: Instant,
    queries: Option<(QueryId, QueryId)>,
}

/// Collects timings and flags regressions against recent history.
pub struct PerformanceMonitor {
    ctx: GpuContext,
    config: MonitorConfig,
    current: PerformanceMeasurement,
    history: VecDeque<PerformanceMeasurement>,
    active: Option<ActiveTiming>,
    query_timeouts: u64,
}

impl PerformanceMonitor {
    pub fn new(ctx: GpuContext, config: MonitorConfig) -> Self {
        Self {
            ctx,
            config,
            current: PerformanceMeasurement::default(),
            history: VecDeque::new(),
            active: None,
            query_timeouts: 0,
        }
    }

    /// Start timing a GPU section. Uses a timestamp query pair when supported.
    pub fn start_gpu_timing(&mut self) -> Result<()> {
        self.ctx.check_thread()?;
        if let Some(stale) = self.active.take() {
            self.delete_queries(stale.queries)?;
        }
        let queries = if self.ctx.capabilities().timestamp_queries {
            self.ctx.with(|b| -> Result<(QueryId, QueryId)> {
                let start = b.create_timestamp_query()?;
                let end = match b.create_timestamp_query() {
                    Ok(q) => q,
                    Err(e) => {
                        b.delete_query(start);
                        return Err(e);
                    }
                };
                b.write_timestamp(start)?;
                Ok((start, end))
            })?
            .map_err(|e| tracing::debug!("timestamp queries unavailable: {e}"))
            .ok()
        } else {
            None
        };
        self.active = Some(ActiveTiming { wall: Instant::now(), queries });
        Ok(())
    }

    /// Finish the GPU section; returns the wall time in milliseconds.
    ///
    /// Query results are polled at most `max_query_polls` times. When they
    /// never arrive the compute time is recorded as zero.
    pub fn end_gpu_timing(&mut self) -> Result<f64> {
        self.ctx.check_thread()?;
        let Some(active) = self.active.take() else {
            tracing::warn!("end_gpu_timing without start_gpu_timing");
            return Ok(0.0);
        };

        let mut compute_ms = 0.0;
        if let Some((start, end)) = active.queries {
            let max_polls = self.config.max_query_polls.max(1);
            let result = self.ctx.with(|b| {
                if b.write_timestamp(end).is_err() {
                    return None;
                }
                let mut t0 = None;
                let mut t1 = None;
                for _ in 0..max_polls {
                    t0 = t0.or_else(|| b.timestamp_result(start));
                    t1 = t1.or_else(|| b.timestamp_result(end));
                    if t0.is_some() && t1.is_some() {
                        break;
                    }
                    std::thread::yield_now();
                }
                t0.zip(t1)
            })?;
            match result {
                Some((t0, t1)) => compute_ms = t1.saturating_sub(t0) as f64 / 1e6,
                None => {
                    self.query_timeouts += 1;
                    tracing::warn!(max_polls, "timestamp query results not available, GPU compute time set to 0");
                }
            }
            self.delete_queries(Some((start, end)))?;
        }

        let wall_ms = active.wall.elapsed().as_secs_f64() * 1000.0;
        self.current.gpu_time_ms = wall_ms;
        self.current.gpu_compute_ms = compute_ms;
        self.current.derive();
        Ok(wall_ms)
    }

    /// CPU render time for the same workload.
    pub fn record_cpu_time(&mut self, ms: f64) {
        self.current.cpu_time_ms = ms.max(0.0);
        self.current.derive();
    }

    /// Host/device transfer time within the GPU section.
    pub fn record_transfer_time(&mut self, ms: f64) {
        self.current.transfer_time_ms = ms.max(0.0);
        self.current.derive();
    }

    /// Directly set the GPU wall time (when measured outside the monitor).
    pub fn record_gpu_time(&mut self, ms: f64) {
        self.current.gpu_time_ms = ms.max(0.0);
        self.current.derive();
    }

    pub fn set_workload(&mut self, width: u32, height: u32, samples: u32) {
        self.current.width = width;
        self.current.height = height;
        self.current.samples = samples;
    }

    /// Push the current measurement into history and start a fresh one.
    pub fn commit(&mut self) -> PerformanceMeasurement {
        let mut m = std::mem::take(&mut self.current);
        m.derive();
        m.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.push(m.clone());
        m
    }

    /// Add a complete measurement to history.
    pub fn record_sample(&mut self, mut m: PerformanceMeasurement) {
        m.derive();
        self.push(m);
    }

    fn push(&mut self, m: PerformanceMeasurement) {
        self.history.push_back(m);
        while self.history.len() > self.config.history_size.max(1) {
            self.history.pop_front();
        }
    }

    /// Latest committed measurement compared with the average of up to five
    /// before it. Needs at least two samples.
    pub fn is_performance_regression(&self) -> bool {
        if self.history.len() < 2 {
            return false;
        }
        let n = self.history.len();
        let Some(latest) = self.history.back() else {
            return false;
        };
        let window: Vec<&PerformanceMeasurement> = self
            .history
            .iter()
            .take(n - 1)
            .rev()
            .take(REGRESSION_WINDOW)
            .collect();
        let count = window.len() as f64;
        let avg = |f: fn(&PerformanceMeasurement) -> f64| window.iter().map(|m| f(m)).sum::<f64>() / count;
        let avg_speedup = avg(|m| m.speedup);
        let avg_efficiency = avg(|m| m.efficiency);
        let avg_overhead = avg(|m| m.transfer_overhead);
        let t = self.config.regression_threshold;

        let speedup_drop = avg_speedup > 0.0 && latest.speedup < avg_speedup * (1.0 - t);
        let efficiency_drop = avg_efficiency > 0.0 && latest.efficiency < avg_efficiency * (1.0 - t);
        let overhead_rise = avg_overhead > 0.0 && latest.transfer_overhead > avg_overhead * (1.0 + t);
        let regressed = speedup_drop || efficiency_drop || overhead_rise;
        if regressed {
            tracing::warn!(
                speedup = latest.speedup,
                avg_speedup,
                efficiency = latest.efficiency,
                avg_efficiency,
                overhead = latest.transfer_overhead,
                avg_overhead,
                "performance regression"
            );
        }
        regressed
    }

    /// Mean speedup over history (0 when empty).
    pub fn average_speedup(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().map(|m| m.speedup).sum::<f64>() / self.history.len() as f64
    }

    pub fn current(&self) -> &PerformanceMeasurement {
        &self.current
    }

    pub fn latest(&self) -> Option<&PerformanceMeasurement> {
        self.history.back()
    }

    pub fn history(&self) -> impl Iterator<Item = &PerformanceMeasurement> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Times the query readback gave up.
    pub fn query_timeouts(&self) -> u64 {
        self.query_timeouts
    }

    pub fn reset(&mut self) {
        self.current = PerformanceMeasurement::default();
        self.history.clear();
        self.query_timeouts = 0;
    }

    pub fn performance_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Performance ({} samples):", self.history.len());
        if let Some(m) = self.history.back() {
            let _ = writeln!(
                out,
                "  last: {}x{} @ {} spp, gpu {:.2} ms (compute {:.2} ms), cpu {:.2} ms, transfer {:.2} ms",
                m.width, m.height, m.samples, m.gpu_time_ms, m.gpu_compute_ms, m.cpu_time_ms, m.transfer_time_ms
            );
            let _ = writeln!(
                out,
                "  speedup {:.2}x, utilization {:.0}%, overhead {:.1}%, efficiency {:.2}",
                m.speedup,
                m.gpu_utilization * 100.0,
                m.transfer_overhead,
                m.efficiency
            );
        }
        let _ = writeln!(out, "  average speedup: {:.2}x", self.average_speedup());
        let _ = writeln!(out, "  regression: {}", if self.is_performance_regression() { "yes" } else { "no" });
        if self.query_timeouts > 0 {
            let _ = writeln!(out, "  timestamp query timeouts: {}", self.query_timeouts);
        }
        out
    }

    fn delete_queries(&self, queries: Option<(QueryId, QueryId)>) -> Result<()> {
        if let Some((a, b)) = queries {
            self.ctx.with(|backend| {
                backend.delete_query(a);
                backend.delete_query(b);
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareBackend;

    fn monitor(sw: SoftwareBackend) -> PerformanceMonitor {
        PerformanceMonitor::new(GpuContext::new(Box::new(sw)), MonitorConfig::default())
    }

    fn sample(gpu: f64, cpu: f64, transfer: f64) -> PerformanceMeasurement {
        PerformanceMeasurement {
            gpu_time_ms: gpu,
            gpu_compute_ms: gpu - transfer,
            cpu_time_ms: cpu,
            transfer_time_ms: transfer,
            ..Default::default()
        }
    }

    #[test]
    fn test_derived_metrics() {
        let mut m = sample(10.0, 40.0, 2.0);
        m.derive();
        assert!((m.speedup - 4.0).abs() < 1e-9);
        assert!((m.gpu_utilization - 0.8).abs() < 1e-9);
        assert!((m.transfer_overhead - 20.0).abs() < 1e-9);
        assert!((m.efficiency - 3.2).abs() < 1e-9);

        let mut m = sample(0.0, 40.0, 0.0);
        m.derive();
        assert_eq!(m.speedup, 0.0);
        assert_eq!(m.gpu_utilization, 0.0);
    }

    #[test]
    fn test_gpu_timing_with_queries() {
        let mut mon = monitor(SoftwareBackend::new());
        mon.start_gpu_timing().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let wall = mon.end_gpu_timing().unwrap();
        assert!(wall >= 2.0);
        assert!(mon.current().gpu_compute_ms > 0.0);
        assert_eq!(mon.query_timeouts(), 0);
    }

    #[test]
    fn test_query_exhaustion_uses_zero() {
        let mut sw = SoftwareBackend::new();
        sw.faults_mut().queries_never_ready = true;
        let mut mon = PerformanceMonitor::new(
            GpuContext::new(Box::new(sw)),
            MonitorConfig { max_query_polls: 5, ..Default::default() },
        );
        mon.start_gpu_timing().unwrap();
        mon.end_gpu_timing().unwrap();
        assert_eq!(mon.current().gpu_compute_ms, 0.0);
        assert_eq!(mon.query_timeouts(), 1);
    }

    #[test]
    fn test_regression_needs_two_samples() {
        let mut mon = monitor(SoftwareBackend::new());
        assert!(!mon.is_performance_regression());
        mon.record_sample(sample(10.0, 40.0, 1.0));
        assert!(!mon.is_performance_regression());
    }

    #[test]
    fn test_regression_detection() {
        let mut mon = monitor(SoftwareBackend::new());
        for _ in 0..5 {
            mon.record_sample(sample(10.0, 40.0, 1.0));
        }
        mon.record_sample(sample(10.5, 40.0, 1.0));
        assert!(!mon.is_performance_regression());

        mon.record_sample(sample(20.0, 40.0, 1.0));
        assert!(mon.is_performance_regression());
    }

    #[test]
    fn test_history_bounded() {
        let mut mon = monitor(SoftwareBackend::new());
        for i in 0..150 {
            mon.record_sample(sample(10.0, i as f64, 0.0));
        }
        assert_eq!(mon.history_len(), 100);
        assert!(mon.average_speedup() > 0.0);
        assert!(mon.performance_report().contains("average speedup"));
    }

    #[test]
    fn test_commit_resets_current() {
        let mut mon = monitor(SoftwareBackend::new());
        mon.set_workload(64, 64, 4);
        mon.record_gpu_time(5.0);
        mon.record_cpu_time(20.0);
        let m = mon.commit();
        assert!((m.speedup - 4.0).abs() < 1e-9);
        assert_eq!(m.width, 64);
        assert_eq!(mon.current(), &PerformanceMeasurement::default());
        assert_eq!(mon.latest().unwrap().samples, 4);
    }
}
