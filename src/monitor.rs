//! Resource monitor: samples process memory and CPU and classifies the
//! reading against warning and critical thresholds.
//!
//! The last `history` samples are kept for averages and a memory trend,
//! which the status surface reports alongside the latest reading.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, System};
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Relative change between history halves treated as a trend.
const TREND_THRESHOLD: f64 = 0.05;

/// Sampling cadence, thresholds and stats retention.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Samples retained for averages and trend.
    pub history: usize,
    pub memory_warning_mb: f64,
    pub memory_critical_mb: f64,
    pub cpu_warning_pct: f64,
    pub cpu_critical_pct: f64,
    /// How long ingestion stays paused after a warning-level sample.
    pub warning_cooldown: Duration,
    pub stats_retention_days: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            history: 30,
            memory_warning_mb: 400.0,
            memory_critical_mb: 450.0,
            cpu_warning_pct: 85.0,
            cpu_critical_pct: 95.0,
            warning_cooldown: Duration::from_secs(30),
            stats_retention_days: 7,
        }
    }
}

/// Point-in-time resource reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSample {
    pub fn new(memory_mb: f64, cpu_percent: f64) -> Self {
        Self {
            memory_mb,
            cpu_percent,
            taken_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceAverages {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

/// Monitor view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSummary {
    pub latest: Option<ResourceSample>,
    pub averages: Option<ResourceAverages>,
    pub memory_trend: Trend,
    pub samples: usize,
}

/// Source of resource readings.
pub trait ResourceProbe: Send + Sync {
    /// Current reading, or `None` if the process could not be inspected.
    fn sample(&self) -> Option<ResourceSample>;
}

/// Reads this process's RSS and CPU usage via `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        let mut system = System::new();
        if let Some(pid) = pid {
            // Prime CPU accounting; the first reading is always 0%.
            system.refresh_process(pid);
        }
        Self {
            system: Mutex::new(system),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> Option<ResourceSample> {
        let pid = self.pid?;
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !system.refresh_process(pid) {
            return None;
        }
        let process = system.process(pid)?;
        Some(ResourceSample::new(
            process.memory() as f64 / BYTES_PER_MB,
            f64::from(process.cpu_usage()),
        ))
    }
}

pub struct ResourceMonitor {
    probe: Box<dyn ResourceProbe>,
    config: MonitorConfig,
    history: Mutex<VecDeque<ResourceSample>>,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn ResourceProbe>, config: MonitorConfig) -> Self {
        Self {
            probe,
            history: Mutex::new(VecDeque::with_capacity(config.history)),
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<ResourceSample>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a reading, record it and classify it.
    pub fn check(&self) -> Option<(ResourceSample, PressureLevel)> {
        let sample = self.probe.sample()?;
        {
            let mut history = self.history();
            if history.len() >= self.config.history.max(1) {
                history.pop_front();
            }
            history.push_back(sample);
        }
        let level = self.classify(&sample);
        debug!(
            memory_mb = sample.memory_mb,
            cpu_percent = sample.cpu_percent,
            ?level,
            "Resource sample"
        );
        Some((sample, level))
    }

    /// Pressure level of a reading; the worse of memory and CPU.
    pub fn classify(&self, sample: &ResourceSample) -> PressureLevel {
        let memory = level_for(
            sample.memory_mb,
            self.config.memory_warning_mb,
            self.config.memory_critical_mb,
        );
        let cpu = level_for(
            sample.cpu_percent,
            self.config.cpu_warning_pct,
            self.config.cpu_critical_pct,
        );
        memory.max(cpu)
    }

    pub fn latest(&self) -> Option<ResourceSample> {
        self.history().back().copied()
    }

    pub fn averages(&self) -> Option<ResourceAverages> {
        let history = self.history();
        if history.is_empty() {
            return None;
        }
        let n = history.len() as f64;
        Some(ResourceAverages {
            memory_mb: history.iter().map(|s| s.memory_mb).sum::<f64>() / n,
            cpu_percent: history.iter().map(|s| s.cpu_percent).sum::<f64>() / n,
        })
    }

    /// Memory trend: mean of the newer half of the history against the
    /// older half.
    pub fn memory_trend(&self) -> Trend {
        let history = self.history();
        if history.len() < 4 {
            return Trend::Stable;
        }
        let memory: Vec<f64> = history.iter().map(|s| s.memory_mb).collect();
        drop(history);

        let half = memory.len() / 2;
        let older = memory[..half].iter().sum::<f64>() / half as f64;
        let newer = memory[memory.len() - half..].iter().sum::<f64>() / half as f64;

        if older <= 0.0 {
            return Trend::Stable;
        }
        let change = (newer - older) / older;
        if change > TREND_THRESHOLD {
            Trend::Rising
        } else if change < -TREND_THRESHOLD {
            Trend::Falling
        } else {
            Trend::Stable
        }
    }

    pub fn summary(&self) -> ResourceSummary {
        ResourceSummary {
            latest: self.latest(),
            averages: self.averages(),
            memory_trend: self.memory_trend(),
            samples: self.history().len(),
        }
    }
}

fn level_for(value: f64, warning: f64, critical: f64) -> PressureLevel {
    if value >= critical {
        PressureLevel::Critical
    } else if value >= warning {
        PressureLevel::Warning
    } else {
        PressureLevel::Normal
    }
}
