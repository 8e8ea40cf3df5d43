//! Splits the energy measured for a cycle across workloads.
//!
//! Core energy follows CPU usage (time, cycles, instructions), DRAM energy
//! follows cache misses and resident memory, and the energy no domain sensor
//! accounts for ("other") is shared evenly. GPU energy is matched by pid while
//! the counter table is drained and is only carried into the aggregate here.

use std::collections::HashMap;
use tracing::debug;

use crate::config::ModelCoefficients;
use crate::metrics::memory::MemorySnapshot;
use crate::store::WorkloadEnergyRecord;

/// Energy measured per domain during one cycle, mJ.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyDeltas {
    pub core_mj: f64,
    pub dram_mj: f64,
    pub other_mj: f64,
    pub gpu_mj: f64,
}

/// Usage of all workloads during one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleTotals {
    pub cpu_time: f64,
    pub cpu_cycles: u64,
    pub cpu_instructions: u64,
    pub cache_misses: u64,
}

/// Share of `value` in `total`, weighted. Zero unless the workload used the resource.
fn share(value: f64, total: f64, weight: f64) -> f64 {
    if value > 0.0 && total > 0.0 {
        value / total * weight
    } else {
        0.0
    }
}

/// Attributes `deltas` to every workload and folds the cycle into the aggregates.
///
/// Never fails: missing memory samples or an empty workload set simply leave
/// the affected terms at zero.
pub fn attribute(
    workloads: &mut HashMap<String, WorkloadEnergyRecord>,
    totals: &CycleTotals,
    deltas: &EnergyDeltas,
    memory: &MemorySnapshot,
    model: &ModelCoefficients,
) {
    let other_per_workload = if workloads.is_empty() {
        0.0
    } else {
        deltas.other_mj / workloads.len() as f64
    };

    for (name, record) in workloads.iter_mut() {
        let current = &mut record.current;

        let core_share = share(current.cpu_time, totals.cpu_time, model.cpu_time)
            + share(
                current.cpu_cycles as f64,
                totals.cpu_cycles as f64,
                model.cpu_cycles,
            )
            + share(
                current.cpu_instructions as f64,
                totals.cpu_instructions as f64,
                model.cpu_instructions,
            );
        current.core_energy_mj = (deltas.core_mj * core_share) as u64;

        let mut dram_share = share(
            current.cache_misses as f64,
            totals.cache_misses as f64,
            model.cache_misses,
        );
        if let Some(&resident) = memory.per_workload.get(&record.identity.memory_key()) {
            current.resident_memory = resident;
            if memory.device_memory > 0.0 {
                dram_share += resident / memory.device_memory * model.memory_usage;
            }
        }
        current.dram_energy_mj = (deltas.dram_mj * dram_share) as u64;

        current.other_energy_mj = other_per_workload as u64;

        record.aggregate.accumulate(current);

        // Staged values are cumulative readings. A reading below the previous
        // one (counter reset, cgroup recreated) is left as is.
        if current.bytes_read >= record.aggregate.bytes_read {
            let cumulative = current.bytes_read;
            current.bytes_read = cumulative - record.aggregate.bytes_read;
            record.aggregate.bytes_read = cumulative;
        }
        if current.bytes_written >= record.aggregate.bytes_written {
            let cumulative = current.bytes_written;
            current.bytes_written = cumulative - record.aggregate.bytes_written;
            record.aggregate.bytes_written = cumulative;
        }

        if current.core_energy_mj > 0 {
            debug!(
                workload = %name,
                namespace = %record.identity.namespace,
                pid = record.identity.pid,
                command = %record.identity.command,
                core_mj = current.core_energy_mj,
                core_total_mj = record.aggregate.core_energy_mj,
                dram_mj = current.dram_energy_mj,
                other_mj = current.other_energy_mj,
                gpu_mj = current.gpu_energy_mj,
                cpu_time = current.cpu_time,
                cpu_cycles = current.cpu_cycles,
                cache_misses = current.cache_misses,
                bytes_read = current.bytes_read,
                bytes_written = current.bytes_written,
                avg_cpu_freq_mhz = record.avg_cpu_freq / 1000.0,
                "workload energy"
            );
        }
    }
}
