//! Collector state shared between the sampling loop and the exporters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Usage and energy counters of one workload.
///
/// Energy values are millijoules. `bytes_read`/`bytes_written` hold the
/// cumulative `io.stat` reading while a cycle is being drained and the
/// per-cycle delta once attribution ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageCounters {
    pub cpu_time: f64,
    pub cpu_cycles: u64,
    pub cpu_instructions: u64,
    pub cache_misses: u64,
    pub resident_memory: f64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub core_energy_mj: u64,
    pub dram_energy_mj: u64,
    pub other_energy_mj: u64,
    pub gpu_energy_mj: u64,
}

impl UsageCounters {
    /// Adds the accumulated dimensions and attributed energy of `current` to `self`.
    ///
    /// I/O counters are not summed: the aggregate tracks the last cumulative
    /// reading instead. Resident memory is a gauge and is never accumulated.
    /// Integer counters saturate instead of wrapping.
    pub fn accumulate(&mut self, current: &UsageCounters) {
        self.cpu_time += current.cpu_time;
        self.cpu_cycles = self.cpu_cycles.saturating_add(current.cpu_cycles);
        self.cpu_instructions = self
            .cpu_instructions
            .saturating_add(current.cpu_instructions);
        self.cache_misses = self.cache_misses.saturating_add(current.cache_misses);
        self.core_energy_mj = self.core_energy_mj.saturating_add(current.core_energy_mj);
        self.dram_energy_mj = self.dram_energy_mj.saturating_add(current.dram_energy_mj);
        self.other_energy_mj = self.other_energy_mj.saturating_add(current.other_energy_mj);
        self.gpu_energy_mj = self.gpu_energy_mj.saturating_add(current.gpu_energy_mj);
    }
}

/// Identity of the process that first introduced a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadIdentity {
    pub cgroup_id: u64,
    pub pid: u64,
    pub command: String,
    pub namespace: String,
    pub name: String,
}

impl WorkloadIdentity {
    /// `"<namespace>/<name>"`, the key of resident memory samples.
    pub fn memory_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkloadEnergyRecord {
    pub identity: WorkloadIdentity,
    pub current: UsageCounters,
    pub aggregate: UsageCounters,
    /// Average frequency of the CPUs the workload ran on during the last cycle, kHz.
    pub avg_cpu_freq: f64,
    /// Largest number of block devices seen in the workload's `io.stat`.
    pub disks: usize,
    pub last_seen_cycle: u64,
}

impl WorkloadEnergyRecord {
    pub fn new(identity: WorkloadIdentity, cycle: u64) -> Self {
        Self {
            identity,
            last_seen_cycle: cycle,
            ..Default::default()
        }
    }

    pub fn reset_current(&mut self) {
        self.current = UsageCounters::default();
        self.avg_cpu_freq = 0.0;
    }
}

/// Whole-device view of one cycle. Replaced at the end of every cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DeviceEnergySample {
    pub cpu_time: f64,
    pub cpu_cycles: u64,
    pub cpu_instructions: u64,
    pub cache_misses: u64,
    pub device_memory: f64,
    pub core_energy_mj: f64,
    pub dram_energy_mj: f64,
    pub other_energy_mj: f64,
    pub gpu_energy_mj: f64,
}

/// Power domain readings that persist between cycles.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnergyDomainState {
    /// Last cumulative core reading, `None` until the first successful read.
    pub last_core_mj: Option<u64>,
    pub last_dram_mj: Option<u64>,
    /// GPU energy of the current cycle by pid, mJ.
    pub gpu_energy: HashMap<u32, f64>,
    /// Frequency of each logical CPU during the current cycle, kHz.
    pub cpu_frequency: HashMap<u32, u64>,
}

/// Everything the collector owns between cycles.
#[derive(Debug, Default)]
pub struct CollectorState {
    pub workloads: HashMap<String, WorkloadEnergyRecord>,
    pub domains: EnergyDomainState,
    pub device: DeviceEnergySample,
    /// Number of cycles that reached attribution.
    pub cycle: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

pub type SharedState = Arc<RwLock<CollectorState>>;

pub fn new_shared_state() -> SharedState {
    Arc::new(RwLock::new(CollectorState::default()))
}

impl CollectorState {
    pub fn reset_current(&mut self) {
        for record in self.workloads.values_mut() {
            record.reset_current();
        }
    }

    /// Removes workloads not seen for `reap_after_cycles` cycles. Returns the
    /// number of removed records. `0` keeps every record forever.
    pub fn reap_stale(&mut self, reap_after_cycles: u64) -> usize {
        if reap_after_cycles == 0 {
            return 0;
        }
        let cycle = self.cycle;
        let before = self.workloads.len();
        self.workloads
            .retain(|_, record| cycle.saturating_sub(record.last_seen_cycle) < reap_after_cycles);
        before - self.workloads.len()
    }

    /// Record of a workload, created on first sighting with the identity built by `identity`.
    pub fn workload_entry(
        &mut self,
        name: &str,
        identity: impl FnOnce() -> WorkloadIdentity,
    ) -> &mut WorkloadEnergyRecord {
        let cycle = self.cycle;
        let record = self
            .workloads
            .entry(name.to_string())
            .or_insert_with(|| WorkloadEnergyRecord::new(identity(), cycle));
        record.last_seen_cycle = cycle;
        record
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let mut workloads: Vec<WorkloadEnergyRecord> = self.workloads.values().cloned().collect();
        workloads.sort_by(|a, b| a.identity.name.cmp(&b.identity.name));
        StateSnapshot {
            cycle: self.cycle,
            last_cycle_at: self.last_cycle_at,
            device: self.device,
            workloads,
        }
    }
}

/// Point-in-time copy of the state served by the API.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub cycle: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub device: DeviceEnergySample,
    pub workloads: Vec<WorkloadEnergyRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> WorkloadIdentity {
        WorkloadIdentity {
            cgroup_id: 1,
            pid: 10,
            command: "cmd".to_string(),
            namespace: "ns".to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn entry_is_created_once_and_marked_seen() {
        let mut state = CollectorState::default();
        state.cycle = 3;
        state.workload_entry("a", || identity("a")).current.cpu_cycles = 5;

        state.cycle = 7;
        let record = state.workload_entry("a", || identity("a"));
        assert_eq!(record.current.cpu_cycles, 5);
        assert_eq!(record.last_seen_cycle, 7);
        assert_eq!(state.workloads.len(), 1);
    }

    #[test]
    fn reset_keeps_aggregate() {
        let mut state = CollectorState::default();
        let record = state.workload_entry("a", || identity("a"));
        record.current.core_energy_mj = 4;
        record.aggregate.core_energy_mj = 9;
        record.avg_cpu_freq = 1200.0;

        state.reset_current();
        let record = &state.workloads["a"];
        assert_eq!(record.current, UsageCounters::default());
        assert_eq!(record.aggregate.core_energy_mj, 9);
        assert_eq!(record.avg_cpu_freq, 0.0);
    }

    #[test]
    fn reaps_only_stale_records() {
        let mut state = CollectorState::default();
        state.cycle = 1;
        state.workload_entry("old", || identity("old"));
        state.cycle = 50;
        state.workload_entry("fresh", || identity("fresh"));

        state.cycle = 101;
        assert_eq!(state.reap_stale(0), 0);
        assert_eq!(state.reap_stale(100), 1);
        assert!(state.workloads.contains_key("fresh"));
        assert!(!state.workloads.contains_key("old"));
    }

    #[test]
    fn accumulate_skips_io() {
        let mut aggregate = UsageCounters {
            bytes_read: 100,
            ..Default::default()
        };
        let current = UsageCounters {
            cpu_time: 1.5,
            cache_misses: 2,
            bytes_read: 50,
            ..Default::default()
        };
        aggregate.accumulate(&current);
        assert_eq!(aggregate.cpu_time, 1.5);
        assert_eq!(aggregate.cache_misses, 2);
        assert_eq!(aggregate.bytes_read, 100);
    }

    #[test]
    fn accumulate_saturates_long_lived_counters() {
        let mut aggregate = UsageCounters {
            cpu_cycles: u64::MAX - 1,
            core_energy_mj: u64::MAX,
            ..Default::default()
        };
        let current = UsageCounters {
            cpu_cycles: 10,
            core_energy_mj: 5,
            gpu_energy_mj: 3,
            ..Default::default()
        };
        aggregate.accumulate(&current);
        assert_eq!(aggregate.cpu_cycles, u64::MAX);
        assert_eq!(aggregate.core_energy_mj, u64::MAX);
        assert_eq!(aggregate.gpu_energy_mj, 3);
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let mut state = CollectorState::default();
        state.workload_entry("b", || identity("b"));
        state.workload_entry("a", || identity("a"));
        let names: Vec<_> = state
            .snapshot()
            .workloads
            .into_iter()
            .map(|w| w.identity.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
