//! Engine configuration and its validation rules.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_MAX_QUEUE_SIZE: usize = 20;
const DEFAULT_MAX_CONCURRENT: usize = 2;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_DRAWING_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MEMORY_WARNING: f64 = 0.70;
const DEFAULT_MEMORY_CRITICAL: f64 = 0.85;
const DEFAULT_WORKER_RESTART_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_WORKER_MAX_MEMORY_MB: u32 = 512;
const DEFAULT_WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Where drawing jobs execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    #[default]
    InProcess,
    /// Reserved for an out-of-process renderer; not executable yet.
    WorkerProcess,
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineMode::InProcess => f.write_str("in_process"),
            EngineMode::WorkerProcess => f.write_str("worker_process"),
        }
    }
}

/// Reserved settings for [`EngineMode::WorkerProcess`]. Validated, otherwise unused.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub restart_interval: Duration,
    pub max_memory_mb: u32,
    pub idle_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            restart_interval: DEFAULT_WORKER_RESTART_INTERVAL,
            max_memory_mb: DEFAULT_WORKER_MAX_MEMORY_MB,
            idle_timeout: DEFAULT_WORKER_IDLE_TIMEOUT,
        }
    }
}

/// Limits and thresholds consumed by the drawing engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Jobs allowed to draw at the same time.
    pub max_concurrent: usize,
    /// Jobs allowed to wait for a drawing slot before submissions are rejected.
    pub max_queue_size: usize,
    /// Quiet period after which the monitor releases cached resources.
    pub idle_timeout: Duration,
    /// Period of the cleanup monitor tick.
    pub cleanup_interval: Duration,
    /// Deadline for a single drawing job.
    pub drawing_timeout: Duration,
    pub memory_warning_threshold: f64,
    /// Validated, but only logged when crossed.
    pub memory_critical_threshold: f64,
    /// Denominator of the memory usage ratio; total system memory when unset.
    /// Read once when the engine is built.
    pub memory_budget_mb: Option<u64>,
    pub mode: EngineMode,
    pub worker: WorkerSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            drawing_timeout: DEFAULT_DRAWING_TIMEOUT,
            memory_warning_threshold: DEFAULT_MEMORY_WARNING,
            memory_critical_threshold: DEFAULT_MEMORY_CRITICAL,
            memory_budget_mb: None,
            mode: EngineMode::InProcess,
            worker: WorkerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid engine configuration `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::new("max_queue_size", "must be greater than zero"));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::new("max_concurrent", "must be greater than zero"));
        }
        if self.max_concurrent > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ConfigError::new("max_concurrent", "exceeds supported permit count"));
        }
        non_zero_duration(self.idle_timeout, "idle_timeout")?;
        non_zero_duration(self.cleanup_interval, "cleanup_interval")?;
        non_zero_duration(self.drawing_timeout, "drawing_timeout")?;
        unit_ratio(self.memory_warning_threshold, "memory_warning_threshold")?;
        unit_ratio(self.memory_critical_threshold, "memory_critical_threshold")?;
        if self.memory_warning_threshold >= self.memory_critical_threshold {
            return Err(ConfigError::new(
                "memory_warning_threshold",
                format!(
                    "must be below memory_critical_threshold ({} >= {})",
                    self.memory_warning_threshold, self.memory_critical_threshold
                ),
            ));
        }
        if self.memory_budget_mb == Some(0) {
            return Err(ConfigError::new("memory_budget_mb", "must be greater than zero"));
        }
        non_zero_duration(self.worker.restart_interval, "worker.restart_interval")?;
        if self.worker.max_memory_mb == 0 {
            return Err(ConfigError::new("worker.max_memory_mb", "must be greater than zero"));
        }
        non_zero_duration(self.worker.idle_timeout, "worker.idle_timeout")?;
        Ok(())
    }
}

fn non_zero_duration(value: Duration, field: &'static str) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::new(field, "must be greater than zero"));
    }
    Ok(())
}

fn unit_ratio(value: f64, field: &'static str) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::new(field, format!("must be within 0.0..=1.0, got {value}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn rejects_zero_limits() {
        let config = EngineConfig {
            max_queue_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "max_queue_size");

        let config = EngineConfig {
            drawing_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "drawing_timeout");

        let config = EngineConfig {
            memory_budget_mb: Some(0),
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "memory_budget_mb");
    }

    #[test]
    fn warning_must_be_below_critical() {
        let config = EngineConfig {
            memory_warning_threshold: 0.9,
            memory_critical_threshold: 0.9,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "memory_warning_threshold");
    }

    #[test]
    fn thresholds_must_be_ratios() {
        let config = EngineConfig {
            memory_critical_threshold: 1.5,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "memory_critical_threshold");

        let config = EngineConfig {
            memory_warning_threshold: f64::NAN,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "memory_warning_threshold");
    }

    #[test]
    fn worker_settings_are_checked_even_in_process() {
        let config = EngineConfig {
            worker: WorkerSettings {
                max_memory_mb: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "worker.max_memory_mb");
    }
}
