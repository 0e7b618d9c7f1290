//! Process resource pressure and admission control.
//!
//! The monitor samples memory and CPU through a [`ResourceProbe`] and counts
//! in-flight requests via [`ConnectionGuard`]s. The batch dispatcher halves
//! its worker budget while the monitor reports constrained.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::config::ResourceThresholds;

/// One reading of process resource usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    /// Resident memory of this process in bytes
    pub memory_bytes: u64,
    /// Resident memory as a share of total system memory
    pub memory_percent: f32,
    /// CPU usage of this process, normalised to all cores
    pub cpu_percent: f32,
}

/// Current resource estimates including in-flight connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub memory_bytes: u64,
    pub memory_percent: f32,
    pub cpu_percent: f32,
    pub active_connections: usize,
    pub constrained: bool,
}

/// Source of resource samples
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Probe reading this process through `sysinfo`
pub struct SystemProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    cores: usize,
}

impl SystemProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("Cannot resolve current pid, process sampling disabled: {}", e);
                None
            }
        };
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            system: Mutex::new(System::new()),
            pid,
            cores,
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock();
        system.refresh_memory();

        let Some(pid) = self.pid else {
            return ResourceSample::default();
        };

        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory().with_cpu(),
        );

        let total = system.total_memory();
        match system.process(pid) {
            Some(process) => {
                let memory_bytes = process.memory();
                let memory_percent = if total == 0 {
                    0.0
                } else {
                    (memory_bytes as f64 / total as f64 * 100.0) as f32
                };
                ResourceSample {
                    memory_bytes,
                    memory_percent,
                    cpu_percent: process.cpu_usage() / self.cores as f32,
                }
            }
            None => ResourceSample::default(),
        }
    }
}

/// Fixed readings, for hosts that do their own sampling and for tests
#[derive(Debug, Default)]
pub struct StaticProbe {
    sample: Mutex<ResourceSample>,
}

impl StaticProbe {
    pub fn new(sample: ResourceSample) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    /// Replace the reading returned by subsequent samples
    pub fn set(&self, sample: ResourceSample) {
        *self.sample.lock() = sample;
    }
}

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> ResourceSample {
        *self.sample.lock()
    }
}

/// Marks one in-flight request until dropped
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Admission control over process resources
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    thresholds: ResourceThresholds,
    connections: Arc<AtomicUsize>,
}

impl ResourceMonitor {
    /// Monitor this process through `sysinfo`
    pub fn new(thresholds: ResourceThresholds) -> Self {
        Self::with_probe(thresholds, Arc::new(SystemProbe::new()))
    }

    pub fn with_probe(thresholds: ResourceThresholds, probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            probe,
            thresholds,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn thresholds(&self) -> &ResourceThresholds {
        &self.thresholds
    }

    /// Register an in-flight request; it counts until the guard is dropped
    pub fn connection(&self) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            counter: self.connections.clone(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Sample current usage and evaluate it against the thresholds
    pub fn snapshot(&self) -> ResourceSnapshot {
        let sample = self.probe.sample();
        let active_connections = self.active_connections();
        let constrained = sample.memory_percent >= self.thresholds.memory_percent
            || sample.cpu_percent >= self.thresholds.cpu_percent
            || active_connections >= self.thresholds.max_connections;

        ResourceSnapshot {
            memory_bytes: sample.memory_bytes,
            memory_percent: sample.memory_percent,
            cpu_percent: sample.cpu_percent,
            active_connections,
            constrained,
        }
    }

    pub fn is_constrained(&self) -> bool {
        self.snapshot().constrained
    }

    /// Workers that may run concurrently given current pressure
    pub fn allowed_workers(&self, max_workers: usize) -> usize {
        if self.is_constrained() {
            (max_workers / 2).max(1)
        } else {
            max_workers.max(1)
        }
    }
}
