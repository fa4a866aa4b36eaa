//! CPU vs GPU backend selection.
//!
//! A linear cost model predicts render time on each side from the scene's
//! resolution, sample count and complexity. Actual timings are fed back with
//! [`HybridSelector::update_performance_model`], which nudges the model and
//! tracks how often the decision turned out right.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::SelectorConfig;
use crate::util::Error;

/// Bounds of the speedup threshold.
pub const MIN_THRESHOLD: f64 = 1.2;
pub const MAX_THRESHOLD: f64 = 10.0;

/// Relative prediction error tolerated before the model is nudged.
const ERROR_TOLERANCE: f64 = 0.2;
/// Records required by [`HybridSelector::calibrate_performance_model`].
const MIN_CALIBRATION_RECORDS: usize = 5;
/// Bytes per pixel (RGBA f32 accumulation) and per primitive record.
const BYTES_PER_PIXEL: u64 = 16;
const BYTES_PER_PRIMITIVE: u64 = 48;

/// How the backend is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    AlwaysGpu,
    AlwaysCpu,
    /// GPU when the predicted speedup reaches the threshold
    PerformanceBased,
    /// Like `PerformanceBased` with a threshold that follows past accuracy
    #[default]
    Adaptive,
}

impl std::str::FromStr for SelectionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "gpu" | "always_gpu" => Ok(Self::AlwaysGpu),
            "cpu" | "always_cpu" => Ok(Self::AlwaysCpu),
            "performance" | "performance_based" => Ok(Self::PerformanceBased),
            "adaptive" | "auto" => Ok(Self::Adaptive),
            other => Err(Error::Config(format!("unknown selection mode '{other}'"))),
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AlwaysGpu => "always-gpu",
            Self::AlwaysCpu => "always-cpu",
            Self::PerformanceBased => "performance",
            Self::Adaptive => "adaptive",
        })
    }
}

/// Workload description used for prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SceneCharacteristics {
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub primitive_count: u32,
    /// Cost multiplier in [0.5, 5.0]
    pub complexity: f64,
    pub has_complex_materials: bool,
    pub has_volumetric_lighting: bool,
}

impl SceneCharacteristics {
    pub fn new(width: u32, height: u32, samples: u32, primitive_count: u32) -> Self {
        let mut s = Self {
            width,
            height,
            samples,
            primitive_count,
            complexity: 1.0,
            has_complex_materials: false,
            has_volumetric_lighting: false,
        };
        s.complexity = s.compute_complexity();
        s
    }

    pub fn with_complex_materials(mut self, yes: bool) -> Self {
        self.has_complex_materials = yes;
        self.complexity = self.compute_complexity();
        self
    }

    pub fn with_volumetric_lighting(mut self, yes: bool) -> Self {
        self.has_volumetric_lighting = yes;
        self.complexity = self.compute_complexity();
        self
    }

    pub fn pixels(&self) -> f64 {
        self.width as f64 * self.height as f64
    }

    /// 1.0 up to 100 primitives, linear above; x2 volumetric, x1.5 complex materials.
    pub fn compute_complexity(&self) -> f64 {
        let mut c = if self.primitive_count <= 100 {
            1.0
        } else {
            1.0 + (self.primitive_count - 100) as f64 / 500.0
        };
        if self.has_volumetric_lighting {
            c *= 2.0;
        }
        if self.has_complex_materials {
            c *= 1.5;
        }
        c.clamp(0.5, 5.0)
    }

    /// Device memory the GPU path needs for this scene.
    pub fn estimated_gpu_memory(&self) -> u64 {
        self.width as u64 * self.height as u64 * BYTES_PER_PIXEL + self.primitive_count as u64 * BYTES_PER_PRIMITIVE
    }
}

/// Linear time model, milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceModel {
    pub gpu_base: f64,
    pub gpu_pixel_factor: f64,
    pub gpu_sample_factor: f64,
    /// Per-pixel transfer cost
    pub transfer_cost: f64,
    pub setup_cost: f64,
    pub cpu_base: f64,
    pub cpu_pixel_factor: f64,
    pub cpu_sample_factor: f64,
}

impl Default for PerformanceModel {
    fn default() -> Self {
        Self {
            gpu_base: 2.0,
            gpu_pixel_factor: 1e-5,
            gpu_sample_factor: 2e-6,
            transfer_cost: 4e-6,
            setup_cost: 5.0,
            cpu_base: 0.5,
            cpu_pixel_factor: 1e-4,
            cpu_sample_factor: 5e-5,
        }
    }
}

impl PerformanceModel {
    pub fn predict_gpu(&self, s: &SceneCharacteristics) -> f64 {
        let px = s.pixels();
        (self.gpu_base
            + px * self.gpu_pixel_factor
            + px * s.samples as f64 * self.gpu_sample_factor
            + px * self.transfer_cost
            + self.setup_cost)
            * s.complexity
    }

    pub fn predict_cpu(&self, s: &SceneCharacteristics) -> f64 {
        let px = s.pixels();
        (self.cpu_base + px * self.cpu_pixel_factor + px * s.samples as f64 * self.cpu_sample_factor) * s.complexity
    }

    fn scale_gpu(&mut self, k: f64) {
        self.gpu_pixel_factor *= k;
        self.gpu_sample_factor *= k;
    }

    fn scale_cpu(&mut self, k: f64) {
        self.cpu_pixel_factor *= k;
        self.cpu_sample_factor *= k;
    }
}

/// One prediction and what actually happened.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceRecord {
    pub scene: SceneCharacteristics,
    pub predicted_gpu_ms: f64,
    pub predicted_cpu_ms: f64,
    pub actual_gpu_ms: Option<f64>,
    pub actual_cpu_ms: Option<f64>,
    pub timestamp: Instant,
}

/// Selected backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Backend {
    Gpu,
    Cpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gpu => "GPU",
            Self::Cpu => "CPU",
        })
    }
}

/// Selection result with the numbers behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub backend: Backend,
    pub predicted_gpu_ms: f64,
    pub predicted_cpu_ms: f64,
    pub predicted_speedup: f64,
    /// Threshold actually applied (after adaptive scaling)
    pub threshold: f64,
    pub reason: String,
}

/// Chooses CPU or GPU per render and learns from the outcome.
pub struct HybridSelector {
    mode: SelectionMode,
    model: PerformanceModel,
    threshold: f64,
    max_history: usize,
    gpu_available: bool,
    gpu_memory_budget: u64,
    records: VecDeque<PerformanceRecord>,
    total_decisions: u64,
    correct_decisions: u64,
    error_sum: f64,
    error_count: u64,
}

impl HybridSelector {
    pub fn new(config: &SelectorConfig) -> Self {
        Self {
            mode: config.mode,
            model: PerformanceModel::default(),
            threshold: config.performance_threshold.clamp(MIN_THRESHOLD, MAX_THRESHOLD),
            max_history: config.max_history.max(1),
            gpu_available: false,
            gpu_memory_budget: 0,
            records: VecDeque::new(),
            total_decisions: 0,
            correct_decisions: 0,
            error_sum: 0.0,
            error_count: 0,
        }
    }

    /// Whether a GPU exists and how much memory it may use.
    pub fn set_gpu_available(&mut self, available: bool, memory_budget: u64) {
        self.gpu_available = available;
        self.gpu_memory_budget = memory_budget;
    }

    pub fn is_gpu_available(&self) -> bool {
        self.gpu_available
    }

    pub fn set_mode(&mut self, mode: SelectionMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    pub fn performance_threshold(&self) -> f64 {
        self.threshold
    }

    pub fn set_performance_threshold(&mut self, t: f64) {
        self.threshold = t.clamp(MIN_THRESHOLD, MAX_THRESHOLD);
    }

    pub fn model(&self) -> &PerformanceModel {
        &self.model
    }

    pub fn predict_gpu_time(&self, scene: &SceneCharacteristics) -> f64 {
        self.model.predict_gpu(scene)
    }

    pub fn predict_cpu_time(&self, scene: &SceneCharacteristics) -> f64 {
        self.model.predict_cpu(scene)
    }

    pub fn should_use_gpu(&self, scene: &SceneCharacteristics) -> bool {
        self.decide(scene).backend == Backend::Gpu
    }

    /// Pick a backend and explain why.
    pub fn decide(&self, scene: &SceneCharacteristics) -> Decision {
        let gpu_ms = self.predict_gpu_time(scene);
        let cpu_ms = self.predict_cpu_time(scene);
        let speedup = if gpu_ms > 0.0 { cpu_ms / gpu_ms } else { 0.0 };
        let fits = scene.estimated_gpu_memory() <= self.gpu_memory_budget;

        let (threshold, backend, reason) = match self.mode {
            SelectionMode::AlwaysCpu => (self.threshold, Backend::Cpu, "mode is always-cpu".to_string()),
            _ if !self.gpu_available => (self.threshold, Backend::Cpu, "GPU unavailable".to_string()),
            _ if !fits => (
                self.threshold,
                Backend::Cpu,
                format!(
                    "scene needs {} bytes of GPU memory, budget is {}",
                    scene.estimated_gpu_memory(),
                    self.gpu_memory_budget
                ),
            ),
            SelectionMode::AlwaysGpu => (self.threshold, Backend::Gpu, "mode is always-gpu".to_string()),
            SelectionMode::PerformanceBased => {
                let t = self.threshold;
                pick(speedup, t)
            }
            SelectionMode::Adaptive => {
                let t = self.adaptive_threshold(scene);
                pick(speedup, t)
            }
        };

        Decision {
            backend,
            predicted_gpu_ms: gpu_ms,
            predicted_cpu_ms: cpu_ms,
            predicted_speedup: speedup,
            threshold,
            reason,
        }
    }

    /// Threshold scaled by the recent success rate and the scene complexity.
    pub fn adaptive_threshold(&self, scene: &SceneCharacteristics) -> f64 {
        let mut t = self.threshold;
        if let Some(rate) = self.success_rate() {
            if rate > 0.8 {
                t *= 0.9;
            } else if rate < 0.6 {
                t *= 1.1;
            }
        }
        t / (1.0 + (scene.complexity - 1.0) * 0.1)
    }

    /// Record actual timings and adjust the model.
    ///
    /// Either timing may be missing when only one backend ran.
    pub fn update_performance_model(
        &mut self,
        scene: &SceneCharacteristics,
        actual_gpu_ms: Option<f64>,
        actual_cpu_ms: Option<f64>,
    ) {
        let predicted_gpu = self.predict_gpu_time(scene);
        let predicted_cpu = self.predict_cpu_time(scene);
        self.records.push_back(PerformanceRecord {
            scene: *scene,
            predicted_gpu_ms: predicted_gpu,
            predicted_cpu_ms: predicted_cpu,
            actual_gpu_ms,
            actual_cpu_ms,
            timestamp: Instant::now(),
        });
        while self.records.len() > self.max_history {
            self.records.pop_front();
        }

        let gpu = actual_gpu_ms.filter(|v| *v > 0.0);
        let cpu = actual_cpu_ms.filter(|v| *v > 0.0);
        if let Some(actual) = gpu {
            self.track_error(actual, predicted_gpu);
            if let Some(k) = correction(actual, predicted_gpu) {
                self.model.scale_gpu(k);
            }
        }
        if let Some(actual) = cpu {
            self.track_error(actual, predicted_cpu);
            if let Some(k) = correction(actual, predicted_cpu) {
                self.model.scale_cpu(k);
            }
        }
        if gpu.is_none() && cpu.is_none() {
            return;
        }

        let predicted_speedup = predicted_cpu / predicted_gpu;
        let actual_speedup = cpu.unwrap_or(predicted_cpu) / gpu.unwrap_or(predicted_gpu);
        let correct = (predicted_speedup >= self.threshold) == (actual_speedup >= self.threshold);
        self.total_decisions += 1;
        if correct {
            self.correct_decisions += 1;
        } else if actual_speedup < predicted_speedup {
            // GPU was chosen too eagerly.
            self.threshold = (self.threshold * 1.05).clamp(MIN_THRESHOLD, MAX_THRESHOLD);
        } else {
            self.threshold = (self.threshold * 0.95).clamp(MIN_THRESHOLD, MAX_THRESHOLD);
        }
        tracing::debug!(
            predicted_speedup,
            actual_speedup,
            correct,
            threshold = self.threshold,
            "selector model updated"
        );
    }

    /// Refit the pixel/sample factors to the recorded history.
    ///
    /// Needs at least five records; returns false (no-op) otherwise.
    pub fn calibrate_performance_model(&mut self) -> bool {
        if self.records.len() < MIN_CALIBRATION_RECORDS {
            return false;
        }
        let ratio = |pairs: Vec<(f64, f64)>| -> Option<f64> {
            if pairs.is_empty() {
                return None;
            }
            let sum: f64 = pairs.iter().map(|(actual, predicted)| actual / predicted).sum();
            Some((sum / pairs.len() as f64).clamp(0.25, 4.0))
        };
        let gpu_pairs: Vec<(f64, f64)> = self
            .records
            .iter()
            .filter_map(|r| r.actual_gpu_ms.filter(|v| *v > 0.0).map(|a| (a, self.model.predict_gpu(&r.scene))))
            .collect();
        let cpu_pairs: Vec<(f64, f64)> = self
            .records
            .iter()
            .filter_map(|r| r.actual_cpu_ms.filter(|v| *v > 0.0).map(|a| (a, self.model.predict_cpu(&r.scene))))
            .collect();
        if let Some(k) = ratio(gpu_pairs) {
            self.model.scale_gpu(k);
        }
        if let Some(k) = ratio(cpu_pairs) {
            self.model.scale_cpu(k);
        }
        tracing::debug!(records = self.records.len(), "selector model calibrated");
        true
    }

    /// `correct / total` decisions, `None` before any feedback.
    pub fn success_rate(&self) -> Option<f64> {
        (self.total_decisions > 0).then(|| self.correct_decisions as f64 / self.total_decisions as f64)
    }

    /// `1 - mean relative prediction error`, clamped to [0, 1].
    pub fn prediction_accuracy(&self) -> Option<f64> {
        (self.error_count > 0).then(|| (1.0 - self.error_sum / self.error_count as f64).clamp(0.0, 1.0))
    }

    pub fn total_decisions(&self) -> u64 {
        self.total_decisions
    }

    pub fn correct_decisions(&self) -> u64 {
        self.correct_decisions
    }

    pub fn records(&self) -> impl Iterator<Item = &PerformanceRecord> {
        self.records.iter()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Forget decisions and records; the model itself is kept.
    pub fn reset_statistics(&mut self) {
        self.records.clear();
        self.total_decisions = 0;
        self.correct_decisions = 0;
        self.error_sum = 0.0;
        self.error_count = 0;
    }

    fn track_error(&mut self, actual: f64, predicted: f64) {
        if predicted > 0.0 {
            self.error_sum += ((actual - predicted) / predicted).abs();
            self.error_count += 1;
        }
    }
}

fn pick(speedup: f64, threshold: f64) -> (f64, Backend, String) {
    if speedup >= threshold {
        (threshold, Backend::Gpu, format!("predicted speedup {speedup:.2}x >= {threshold:.2}x"))
    } else {
        (threshold, Backend::Cpu, format!("predicted speedup {speedup:.2}x < {threshold:.2}x"))
    }
}

/// Damped multiplier `ratio * 0.1 + 0.9` when the error exceeds the tolerance.
fn correction(actual: f64, predicted: f64) -> Option<f64> {
    if predicted <= 0.0 {
        return None;
    }
    let ratio = actual / predicted;
    ((ratio - 1.0).abs() > ERROR_TOLERANCE).then(|| (ratio * 0.1 + 0.9).clamp(0.5, 2.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(mode: SelectionMode) -> HybridSelector {
        let mut s = HybridSelector::new(&SelectorConfig { mode, ..Default::default() });
        s.set_gpu_available(true, 512 << 20);
        s
    }

    fn scene(w: u32, h: u32, spp: u32) -> SceneCharacteristics {
        SceneCharacteristics::new(w, h, spp, 10)
    }

    #[test]
    fn test_complexity() {
        assert_eq!(SceneCharacteristics::new(1, 1, 1, 50).complexity, 1.0);
        assert!((SceneCharacteristics::new(1, 1, 1, 600).complexity - 2.0).abs() < 1e-9);
        let c = SceneCharacteristics::new(1, 1, 1, 50).with_volumetric_lighting(true).with_complex_materials(true);
        assert!((c.complexity - 3.0).abs() < 1e-9);
        let c = SceneCharacteristics::new(1, 1, 1, 100_000).with_volumetric_lighting(true);
        assert_eq!(c.complexity, 5.0);
    }

    #[test]
    fn test_prediction_monotonic() {
        let s = selector(SelectionMode::Adaptive);
        let small = scene(64, 64, 4);
        for bigger in [scene(128, 64, 4), scene(64, 64, 16), SceneCharacteristics::new(64, 64, 4, 1000)] {
            assert!(s.predict_gpu_time(&bigger) > s.predict_gpu_time(&small));
            assert!(s.predict_cpu_time(&bigger) > s.predict_cpu_time(&small));
        }
    }

    #[test]
    fn test_modes() {
        let big = scene(1920, 1080, 64);
        let tiny = scene(8, 8, 1);
        assert!(selector(SelectionMode::AlwaysGpu).should_use_gpu(&tiny));
        assert!(!selector(SelectionMode::AlwaysCpu).should_use_gpu(&big));
        assert!(selector(SelectionMode::PerformanceBased).should_use_gpu(&big));
        assert!(!selector(SelectionMode::PerformanceBased).should_use_gpu(&tiny));
    }

    #[test]
    fn test_gpu_unavailable_falls_back() {
        let mut s = selector(SelectionMode::AlwaysGpu);
        s.set_gpu_available(false, 0);
        let d = s.decide(&scene(1920, 1080, 64));
        assert_eq!(d.backend, Backend::Cpu);
        assert!(d.reason.contains("unavailable"));
    }

    #[test]
    fn test_memory_budget_respected() {
        let mut s = selector(SelectionMode::AlwaysGpu);
        s.set_gpu_available(true, 1024);
        assert!(!s.should_use_gpu(&scene(64, 64, 1)));
    }

    #[test]
    fn test_model_learns_from_feedback() {
        let mut s = selector(SelectionMode::Adaptive);
        let sc = scene(256, 256, 16);
        let before = s.predict_gpu_time(&sc);
        s.update_performance_model(&sc, Some(before * 3.0), None);
        assert!(s.predict_gpu_time(&sc) > before);

        // Within tolerance: unchanged.
        let now = s.predict_gpu_time(&sc);
        s.update_performance_model(&sc, Some(now * 1.1), None);
        assert_eq!(s.predict_gpu_time(&sc), now);
        assert_eq!(s.record_count(), 2);
    }

    #[test]
    fn test_threshold_stays_bounded() {
        let mut s = selector(SelectionMode::Adaptive);
        let sc = scene(512, 512, 32);
        for _ in 0..500 {
            let g = s.predict_gpu_time(&sc);
            let c = s.predict_cpu_time(&sc);
            // GPU keeps losing badly.
            s.update_performance_model(&sc, Some(c * 10.0), Some(g));
            assert!((MIN_THRESHOLD..=MAX_THRESHOLD).contains(&s.performance_threshold()));
        }
        for _ in 0..500 {
            s.update_performance_model(&sc, Some(1.0), Some(10_000.0));
            assert!((MIN_THRESHOLD..=MAX_THRESHOLD).contains(&s.performance_threshold()));
        }
    }

    #[test]
    fn test_adaptive_threshold_follows_success() {
        let mut s = selector(SelectionMode::Adaptive);
        let sc = scene(256, 256, 8);
        let base = s.adaptive_threshold(&sc);
        for _ in 0..10 {
            let g = s.predict_gpu_time(&sc);
            let c = s.predict_cpu_time(&sc);
            s.update_performance_model(&sc, Some(g), Some(c));
        }
        assert_eq!(s.success_rate(), Some(1.0));
        assert!(s.adaptive_threshold(&sc) < base);
    }

    #[test]
    fn test_calibration_needs_five_records() {
        let mut s = selector(SelectionMode::Adaptive);
        let sc = scene(128, 128, 4);
        for _ in 0..4 {
            s.update_performance_model(&sc, None, None);
        }
        assert!(!s.calibrate_performance_model());
        s.update_performance_model(&sc, None, None);
        assert!(s.calibrate_performance_model());
    }

    #[test]
    fn test_history_bounded_and_reset() {
        let mut s = HybridSelector::new(&SelectorConfig { max_history: 3, ..Default::default() });
        let sc = scene(16, 16, 1);
        for _ in 0..10 {
            s.update_performance_model(&sc, Some(1.0), Some(1.0));
        }
        assert_eq!(s.record_count(), 3);
        assert!(s.prediction_accuracy().is_some());
        s.reset_statistics();
        assert_eq!(s.record_count(), 0);
        assert_eq!(s.success_rate(), None);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("always-gpu".parse::<SelectionMode>().unwrap(), SelectionMode::AlwaysGpu);
        assert_eq!("Performance".parse::<SelectionMode>().unwrap(), SelectionMode::PerformanceBased);
        assert!("sometimes".parse::<SelectionMode>().is_err());
    }
}
