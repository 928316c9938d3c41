//! # Resource Observation
//!
//! Pure observation utilities with no control authority: a memory probe seam
//! over `sysinfo`, and a per-category tracker for wall time and memory
//! deltas. The admission controller consumes the probe; the coordinator
//! feeds the tracker and renders its aggregates into the run summary.

use crate::types::{ResourceDelta, SizeCategory, TaskResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use sysinfo::System;

/// Seam for memory observation so tests can inject deterministic values.
pub trait MemoryProbe: Send + Sync {
    /// Bytes of system memory currently available for new work.
    fn available_bytes(&self) -> u64;
    /// Resident set size of this process, in bytes.
    fn process_rss_bytes(&self) -> u64;
}

/// Production probe backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn available_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.available_memory()
    }

    fn process_rss_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        let Ok(pid) = sysinfo::get_current_pid() else {
            return 0;
        };
        system.refresh_process(pid);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Aggregated timing and memory statistics for one size category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryStats {
    pub count: u64,
    pub total_wall_ms: u64,
    pub min_wall_ms: u64,
    pub max_wall_ms: u64,
    pub total_rss_delta_bytes: i64,
}

impl CategoryStats {
    fn record(&mut self, delta: ResourceDelta) {
        if self.count == 0 {
            self.min_wall_ms = delta.wall_time_ms;
            self.max_wall_ms = delta.wall_time_ms;
        } else {
            self.min_wall_ms = self.min_wall_ms.min(delta.wall_time_ms);
            self.max_wall_ms = self.max_wall_ms.max(delta.wall_time_ms);
        }
        self.count += 1;
        self.total_wall_ms += delta.wall_time_ms;
        self.total_rss_delta_bytes += delta.rss_delta_bytes;
    }

    pub fn mean_wall_ms(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_wall_ms / self.count
        }
    }
}

/// Records per-task resource usage, keyed by size category.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    stats: BTreeMap<&'static str, CategoryStats>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: &TaskResult) {
        self.stats
            .entry(result.category.name())
            .or_default()
            .record(result.resources);
    }

    pub fn category(&self, category: SizeCategory) -> Option<&CategoryStats> {
        self.stats.get(category.name())
    }

    /// Snapshot of all per-category aggregates for the run summary.
    pub fn snapshot(&self) -> BTreeMap<String, CategoryStats> {
        self.stats
            .iter()
            .map(|(name, stats)| ((*name).to_string(), stats.clone()))
            .collect()
    }
}
