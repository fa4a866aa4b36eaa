//! Persistent engine configuration.
//!
//! Stored as pretty JSON at `<config_dir>/hybrid-trace/config.json`. Every
//! field has a default, so partial files are fine and missing/broken files
//! fall back to defaults with a warning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::selector::SelectionMode;
use crate::util::{Error, Result};

/// Default cap on live buffers per memory manager.
pub const MAX_BUFFER_COUNT: usize = 1024;
/// Default GPU memory budget in MiB.
pub const MAX_MEMORY_MB: u64 = 512;

/// Overrides the backend selection (`auto|software|null|wgpu`).
pub const ENV_BACKEND: &str = "HYBRID_TRACE_BACKEND";
/// Overrides the selector mode (`adaptive|performance|gpu|cpu`).
pub const ENV_MODE: &str = "HYBRID_TRACE_MODE";

/// Which GPU backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Native device when compiled in and present, else the null backend (CPU-only)
    #[default]
    Auto,
    Software,
    Null,
    Wgpu,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "software" | "sw" => Ok(Self::Software),
            "null" | "none" | "cpu" => Ok(Self::Null),
            "wgpu" | "gpu" => Ok(Self::Wgpu),
            other => Err(Error::Config(format!("unknown backend '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_buffers: usize,
    pub max_memory_mb: u64,
    /// Buffer sizes pre-registered as pools by `initialize()`
    pub default_pool_sizes: Vec<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_buffers: MAX_BUFFER_COUNT,
            max_memory_mb: MAX_MEMORY_MB,
            default_pool_sizes: vec![4 << 10, 64 << 10, 1 << 20],
        }
    }
}

impl MemoryConfig {
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub initial_samples: u32,
    pub target_samples: u32,
    pub total_steps: u32,
    /// Minimum time between two dispatches
    pub update_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { initial_samples: 1, target_samples: 16, total_steps: 4, update_interval_ms: 16 }
    }
}

impl SchedulerConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub mode: SelectionMode,
    /// Minimum predicted speedup before the GPU is chosen
    pub performance_threshold: f64,
    /// Performance records kept for learning
    pub max_history: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self { mode: SelectionMode::Adaptive, performance_threshold: 1.5, max_history: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Timestamp query readback attempts before giving up
    pub max_query_polls: u32,
    pub history_size: usize,
    /// Relative degradation counted as a regression
    pub regression_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { max_query_polls: 1000, history_size: 100, regression_threshold: 0.15 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Adjust thread-group size from observed throughput
    pub adaptive: bool,
    pub history_size: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { adaptive: true, history_size: 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub max_depth: u32,
    pub backend: BackendKind,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self { width: 320, height: 240, samples: 16, max_depth: 8, backend: BackendKind::Auto }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub memory: MemoryConfig,
    pub scheduler: SchedulerConfig,
    pub selector: SelectorConfig,
    pub monitor: MonitorConfig,
    pub optimizer: OptimizerConfig,
    pub render: RenderConfig,
}

impl EngineConfig {
    /// Per-user config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("hybrid-trace");
            p.push("config.json");
            p
        })
    }

    /// Load from the per-user location, then apply environment overrides.
    pub fn load() -> Self {
        let mut cfg = match Self::default_path() {
            Some(p) if p.exists() => Self::load_or_default(&p),
            _ => Self::default(),
        };
        cfg.apply_env();
        cfg
    }

    /// Load from `path`, falling back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(path = %path.display(), "using default config: {e}");
                Self::default()
            }
        }
    }

    /// Strict load: I/O, parse and validation errors are returned.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write pretty JSON to the per-user location.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::default_path().ok_or_else(|| Error::Config("no config directory".into()))?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Apply `HYBRID_TRACE_BACKEND` / `HYBRID_TRACE_MODE`. Bad values are logged and ignored.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var(ENV_BACKEND) {
            match v.parse() {
                Ok(kind) => self.render.backend = kind,
                Err(e) => tracing::warn!("{ENV_BACKEND}: {e}"),
            }
        }
        if let Ok(v) = std::env::var(ENV_MODE) {
            match v.parse() {
                Ok(mode) => self.selector.mode = mode,
                Err(e) => tracing::warn!("{ENV_MODE}: {e}"),
            }
        }
    }

    /// Reject values that cannot work; clamp the ones that merely drift.
    pub fn validate(&mut self) -> Result<()> {
        if self.memory.max_buffers == 0 {
            return Err(Error::Config("memory.max_buffers must be > 0".into()));
        }
        if self.memory.max_memory_mb == 0 {
            return Err(Error::Config("memory.max_memory_mb must be > 0".into()));
        }
        if self.scheduler.total_steps == 0 {
            return Err(Error::Config("scheduler.total_steps must be > 0".into()));
        }
        if self.scheduler.target_samples == 0 {
            return Err(Error::Config("scheduler.target_samples must be > 0".into()));
        }
        if self.render.width == 0 || self.render.height == 0 {
            return Err(Error::Config("render size must be non-zero".into()));
        }
        self.memory.default_pool_sizes.retain(|&s| s > 0);
        self.scheduler.initial_samples = self.scheduler.initial_samples.clamp(1, self.scheduler.target_samples);
        self.selector.performance_threshold = self.selector.performance_threshold.clamp(1.2, 10.0);
        self.selector.max_history = self.selector.max_history.max(1);
        self.monitor.max_query_polls = self.monitor.max_query_polls.max(1);
        self.monitor.history_size = self.monitor.history_size.clamp(1, 100);
        self.monitor.regression_threshold = self.monitor.regression_threshold.clamp(0.01, 1.0);
        self.optimizer.history_size = self.optimizer.history_size.clamp(1, 20);
        self.render.samples = self.render.samples.max(1);
        self.render.max_depth = self.render.max_depth.max(1);
        Ok(())
    }
}
