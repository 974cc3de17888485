use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use super::engine::{EngineStatus, RenderEngine};

/// Memory pressure band crossed on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    Warning,
    Critical,
}

impl PressureLevel {
    fn as_str(self) -> &'static str {
        match self {
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorTick {
    pub cleaned: bool,
    pub pressure: Option<PressureLevel>,
    pub status: EngineStatus,
}

/// Periodic idle cleanup and memory pressure reporting.
///
/// The period is the engine's `cleanup_interval`, re-read before every wait
/// so a reload changes the cadence from the next tick on.
pub struct CleanupMonitor {
    engine: Arc<RenderEngine>,
}

/// Owner of a running monitor task. Dropping it leaves the task running.
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl CleanupMonitor {
    pub fn new(engine: Arc<RenderEngine>) -> Self {
        Self { engine }
    }

    pub fn spawn(self) -> MonitorHandle {
        let period = self.engine.config().cleanup_interval;
        info!(
            target = "render::monitor",
            period_ms = period.as_millis() as u64,
            "Cleanup monitor started"
        );

        let task = tokio::spawn(async move {
            loop {
                sleep(self.engine.config().cleanup_interval).await;
                self.tick().await;
            }
        });
        MonitorHandle { task }
    }

    pub async fn tick(&self) -> MonitorTick {
        let cleaned = self.engine.is_idle_timeout();
        if cleaned {
            debug!(target = "render::monitor", "Engine idle; running cleanup");
            self.engine.perform_cleanup().await;
        }

        let status = self.engine.status();
        let config = self.engine.config();
        gauge!("feedcard_memory_usage_ratio").set(status.memory_usage);

        let pressure = if status.memory_usage >= config.memory_critical_threshold {
            Some(PressureLevel::Critical)
        } else if status.memory_usage >= config.memory_warning_threshold {
            Some(PressureLevel::Warning)
        } else {
            None
        };

        match pressure {
            Some(PressureLevel::Critical) => error!(
                target = "render::monitor",
                memory_usage = status.memory_usage,
                threshold = config.memory_critical_threshold,
                native_live_bytes = status.native_live_bytes,
                "Memory usage above critical threshold"
            ),
            Some(PressureLevel::Warning) => warn!(
                target = "render::monitor",
                memory_usage = status.memory_usage,
                threshold = config.memory_warning_threshold,
                native_live_bytes = status.native_live_bytes,
                "Memory usage above warning threshold"
            ),
            None => {}
        }
        if let Some(level) = pressure {
            counter!("feedcard_memory_pressure_total", "level" => level.as_str()).increment(1);
        }

        if status.queue.pending_count > 0 || status.queue.active_count > 0 {
            debug!(
                target = "render::monitor",
                pending = status.queue.pending_count,
                active = status.queue.active_count,
                full = status.queue.is_full,
                "Drawing queue busy"
            );
        }

        MonitorTick {
            cleaned,
            pressure,
            status,
        }
    }
}

impl MonitorHandle {
    pub fn stop(self) {
        self.task.abort();
        info!(target = "render::monitor", "Cleanup monitor stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
