use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Warnings tolerated before a run gives up and reports itself incomplete.
pub const MAX_MEMORY_WARNINGS: u32 = 5;
pub const DEFAULT_THRESHOLD_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl MemoryUsage {
    pub fn fraction(&self) -> f64 {
        if self.limit_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.limit_bytes as f64
        }
    }
}

/// Source of process memory figures.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> Option<MemoryUsage>;
}

/// Resident memory of this process against a configured limit, or total system
/// memory when no limit is set.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    limit_bytes: Option<u64>,
}

impl SysinfoProbe {
    pub fn new(limit_mb: Option<u64>) -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            warn!("Unable to determine current pid, memory checks disabled");
        }
        Self {
            system: Mutex::new(System::new()),
            pid,
            limit_bytes: limit_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
        }
    }
}

impl MemoryProbe for SysinfoProbe {
    fn sample(&self) -> Option<MemoryUsage> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        if system.refresh_processes(ProcessesToUpdate::Some(&[pid])) == 0 {
            return None;
        }
        let used_bytes = system.process(pid)?.memory();
        let limit_bytes = match self.limit_bytes {
            Some(limit) => limit,
            None => {
                system.refresh_memory();
                system.total_memory()
            }
        };
        Some(MemoryUsage {
            used_bytes,
            limit_bytes,
        })
    }
}

/// Whether a process with this id is still running.
pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid])) > 0 && system.process(pid).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    Ok,
    /// Over threshold; callers should shrink their working set.
    Warning,
    /// Too many warnings; callers should stop and report incomplete.
    Abort,
}

/// Counts threshold crossings for one run.
pub struct MemoryGuard {
    probe: Arc<dyn MemoryProbe>,
    threshold: f64,
    max_warnings: u32,
    warnings: u32,
}

impl MemoryGuard {
    pub fn new(probe: Arc<dyn MemoryProbe>, threshold: f64) -> Self {
        Self {
            probe,
            threshold: threshold.clamp(0.05, 1.0),
            max_warnings: MAX_MEMORY_WARNINGS,
            warnings: 0,
        }
    }

    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    pub fn reset(&mut self) {
        self.warnings = 0;
    }

    pub fn check(&mut self) -> MemoryStatus {
        let Some(usage) = self.probe.sample() else {
            return MemoryStatus::Ok;
        };

        if usage.fraction() <= self.threshold {
            return MemoryStatus::Ok;
        }

        self.warnings += 1;
        debug!(
            "Memory at {:.1}% of limit (threshold {:.1}%), warning {}",
            usage.fraction() * 100.0,
            self.threshold * 100.0,
            self.warnings
        );

        if self.warnings > self.max_warnings {
            MemoryStatus::Abort
        } else {
            MemoryStatus::Warning
        }
    }
}

/// Probe returning scripted fractions of a fixed 1 GiB limit. The last value
/// repeats once the script runs out.
pub struct FixedProbe {
    fractions: Mutex<Vec<f64>>,
}

impl FixedProbe {
    const LIMIT: u64 = 1024 * 1024 * 1024;

    pub fn new(fractions: Vec<f64>) -> Self {
        let mut fractions = fractions;
        fractions.reverse();
        Self {
            fractions: Mutex::new(fractions),
        }
    }

    pub fn constant(fraction: f64) -> Self {
        Self::new(vec![fraction])
    }
}

impl MemoryProbe for FixedProbe {
    fn sample(&self) -> Option<MemoryUsage> {
        let mut fractions = self.fractions.lock().ok()?;
        let fraction = if fractions.len() > 1 {
            fractions.pop()?
        } else {
            *fractions.last()?
        };
        Some(MemoryUsage {
            used_bytes: (Self::LIMIT as f64 * fraction) as u64,
            limit_bytes: Self::LIMIT,
        })
    }
}
