use std::sync::Mutex;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::util::lock::mutex_lock;

/// Source of the memory pressure figure reported by the engine.
pub trait MemorySampler: Send + Sync {
    /// Fraction of memory in use, clamped to `0.0..=1.0`.
    fn memory_usage(&self) -> f64;
}

/// Resident size of this process against a memory budget.
///
/// Without a budget the denominator is total system memory. Falls back to
/// system-wide usage when the process cannot be inspected.
pub struct SystemMemorySampler {
    system: Mutex<System>,
    pid: Option<Pid>,
    budget_bytes: Option<u64>,
}

impl SystemMemorySampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
            budget_bytes: None,
        }
    }

    /// Measure against `budget_bytes` instead of total system memory.
    pub fn with_budget(mut self, budget_bytes: Option<u64>) -> Self {
        self.budget_bytes = budget_bytes.filter(|bytes| *bytes > 0);
        self
    }
}

/// `used` over the budget when one is set, otherwise over `total`.
fn usage_ratio(used: u64, total: u64, budget: Option<u64>) -> f64 {
    let denominator = budget.filter(|bytes| *bytes > 0).unwrap_or(total);
    if denominator == 0 {
        return 0.0;
    }
    (used as f64 / denominator as f64).clamp(0.0, 1.0)
}

impl Default for SystemMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SystemMemorySampler {
    fn memory_usage(&self) -> f64 {
        let mut system = mutex_lock(&self.system, "infra::memory", "memory_usage");
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 && self.budget_bytes.is_none() {
            return 0.0;
        }

        let used = match self.pid {
            Some(pid) => {
                system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    true,
                    ProcessRefreshKind::nothing().with_memory(),
                );
                system
                    .process(pid)
                    .map(|process| process.memory())
                    .unwrap_or_else(|| system.used_memory())
            }
            None => system.used_memory(),
        };

        usage_ratio(used, total, self.budget_bytes)
    }
}
