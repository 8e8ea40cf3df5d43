//! Sampling loop: reads the power domains, drains the per-process counter
//! table and hands the cycle to the attribution engine.

use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::attribution::{attribute, CycleTotals, EnergyDeltas};
use crate::config::{Config, ModelCoefficients};
use crate::metrics::ebpf::CounterTable;
use crate::metrics::io::IoStatReader;
use crate::metrics::memory::MemoryReader;
use crate::metrics::power::PowerDomainReader;
use crate::metrics::raw_sample::{RawProcessSample, CPU_VECTOR_SIZE};
use crate::resolver::{WorkloadResolver, UNKNOWN_NAMESPACE};
use crate::store::{DeviceEnergySample, SharedState, WorkloadIdentity};
use crate::{CollectorStats, StatusCallback};

/// Cycles between two statistics log lines.
const STATS_LOG_INTERVAL: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorPhase {
    Idle,
    Sampling,
    Attributing,
}

/// Why a cycle ended before attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Core or DRAM energy could not be read.
    SensorFailure,
    /// First successful reading, stored as the baseline.
    WarmUp,
    /// Neither core nor DRAM energy changed since the previous cycle.
    StalledSensor,
    DeviceEnergyFailure,
    MemoryFailure,
    /// The counter table could not be read; its entries are kept for the next cycle.
    TableReadFailure,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::SensorFailure => "sensor_failure",
            SkipReason::WarmUp => "warm_up",
            SkipReason::StalledSensor => "stalled_sensor",
            SkipReason::DeviceEnergyFailure => "device_energy_failure",
            SkipReason::MemoryFailure => "memory_failure",
            SkipReason::TableReadFailure => "table_read_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Attributed {
        /// Number of workload records after the cycle.
        workloads: usize,
        /// Counter records that were accounted to a workload.
        records: usize,
    },
    Skipped(SkipReason),
}

/// Host collaborators of the collector.
pub struct CollectorSources {
    pub power: Box<dyn PowerDomainReader>,
    pub table: Box<dyn CounterTable>,
    pub resolver: Arc<dyn WorkloadResolver>,
    pub io: Arc<dyn IoStatReader>,
    pub memory: Arc<dyn MemoryReader>,
}

pub struct EnergyCollector {
    power: Box<dyn PowerDomainReader>,
    table: Box<dyn CounterTable>,
    resolver: Arc<dyn WorkloadResolver>,
    io: Arc<dyn IoStatReader>,
    memory: Arc<dyn MemoryReader>,
    model: ModelCoefficients,
    enable_cpu_freq: bool,
    reap_after_cycles: u64,
    sample_period: Duration,
    state: SharedState,
    stats: Arc<RwLock<CollectorStats>>,
    phase: CollectorPhase,
    on_status_update: Option<StatusCallback>,
}

impl EnergyCollector {
    pub fn new(config: &Config, sources: CollectorSources, state: SharedState) -> Self {
        Self {
            power: sources.power,
            table: sources.table,
            resolver: sources.resolver,
            io: sources.io,
            memory: sources.memory,
            model: config.model,
            enable_cpu_freq: config.enable_cpu_freq,
            reap_after_cycles: config.reap_after_cycles,
            sample_period: Duration::from_millis(config.sample_period_ms),
            state,
            stats: Arc::new(RwLock::new(CollectorStats::new())),
            phase: CollectorPhase::Idle,
            on_status_update: None,
        }
    }

    /// Callback invoked with a status line every few cycles (systemd `STATUS=`).
    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.on_status_update = Some(callback);
        self
    }

    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    pub fn stats(&self) -> Arc<RwLock<CollectorStats>> {
        Arc::clone(&self.stats)
    }

    pub fn phase(&self) -> CollectorPhase {
        self.phase
    }

    /// Establishes baselines: cumulative core/DRAM readings, and the first
    /// read of the reset-on-read GPU and device sensors.
    ///
    /// Failures are logged; the first cycle then acts as warm-up.
    pub async fn initialize(&mut self) {
        let core = self.power.read_core_energy();
        let dram = self.power.read_dram_energy();
        match (core, dram) {
            (Ok(core), Ok(dram)) => {
                let mut state = self.state.write().await;
                state.domains.last_core_mj = Some(core);
                state.domains.last_dram_mj = Some(dram);
                debug!("energy baseline: core {core} mJ, dram {dram} mJ");
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("failed to read energy baseline, first cycle will warm up: {e:#}");
            }
        }

        if let Err(e) = self.power.read_gpu_energy_per_process() {
            debug!("GPU energy unavailable: {e:#}");
        }
        if let Err(e) = self.power.read_device_energy() {
            debug!("device energy unavailable: {e:#}");
        }
    }

    /// Runs one sampling cycle.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.phase = CollectorPhase::Sampling;
        let outcome = self.sample_and_attribute().await;
        self.phase = CollectorPhase::Idle;
        if let CycleOutcome::Skipped(reason) = &outcome {
            debug!("cycle skipped: {}", reason.as_str());
        }
        outcome
    }

    async fn sample_and_attribute(&mut self) -> CycleOutcome {
        let core = match self.power.read_core_energy() {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to read core energy: {e:#}");
                return CycleOutcome::Skipped(SkipReason::SensorFailure);
            }
        };
        let dram = match self.power.read_dram_energy() {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to read dram energy: {e:#}");
                return CycleOutcome::Skipped(SkipReason::SensorFailure);
            }
        };

        let (last_core, last_dram) = {
            let state = self.state.read().await;
            (state.domains.last_core_mj, state.domains.last_dram_mj)
        };
        let (Some(last_core), Some(last_dram)) = (last_core, last_dram) else {
            let mut state = self.state.write().await;
            state.domains.last_core_mj = Some(core);
            state.domains.last_dram_mj = Some(dram);
            info!("energy baseline established: core {core} mJ, dram {dram} mJ");
            return CycleOutcome::Skipped(SkipReason::WarmUp);
        };

        let went_backwards = core < last_core || dram < last_dram;
        if went_backwards {
            warn!(
                "energy counter went backwards: core {core} (was {last_core}), dram {dram} (was {last_dram})"
            );
        }
        let core_delta = core.saturating_sub(last_core) as f64;
        let dram_delta = dram.saturating_sub(last_dram) as f64;
        if core_delta == 0.0 && dram_delta == 0.0 {
            warn!("power reading not changed, skipping cycle");
            if went_backwards {
                let mut state = self.state.write().await;
                state.domains.last_core_mj = Some(core);
                state.domains.last_dram_mj = Some(dram);
            }
            return CycleOutcome::Skipped(SkipReason::StalledSensor);
        }

        // Device and GPU sensors reset on read, so they come after every
        // reader whose failure skips the cycle without side effects.
        let memory = match self.memory.read_memory() {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to read memory usage: {e:#}");
                return CycleOutcome::Skipped(SkipReason::MemoryFailure);
            }
        };
        let entries = match self.table.entries() {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to read counter table: {e:#}");
                return CycleOutcome::Skipped(SkipReason::TableReadFailure);
            }
        };
        let device_energy = match self.power.read_device_energy() {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to read device energy: {e:#}");
                return CycleOutcome::Skipped(SkipReason::DeviceEnergyFailure);
            }
        };
        let gpu_energy = self.power.read_gpu_energy_per_process().unwrap_or_else(|e| {
            warn!("failed to read GPU energy, assuming none: {e:#}");
            HashMap::new()
        });
        let cpu_frequency = if self.enable_cpu_freq {
            self.power.read_core_frequencies().unwrap_or_else(|e| {
                warn!("failed to read CPU frequencies: {e:#}");
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        let device_total: f64 = device_energy.values().sum();
        let gpu_delta: f64 = gpu_energy.values().sum();
        let mut other_delta = 0.0;
        if device_total > 0.0 {
            other_delta = device_total - core_delta - dram_delta - gpu_delta;
            if other_delta < 0.0 {
                warn!(
                    "device energy {device_total:.2} mJ is below core+dram+gpu {:.2} mJ, other energy set to 0",
                    core_delta + dram_delta + gpu_delta
                );
                other_delta = 0.0;
            }
        }

        let mut guard = self.state.write().await;
        let state = &mut *guard;
        self.phase = CollectorPhase::Attributing;

        state.domains.last_core_mj = Some(core);
        state.domains.last_dram_mj = Some(dram);
        state.domains.gpu_energy = gpu_energy;
        state.domains.cpu_frequency = cpu_frequency;
        state.cycle += 1;

        let reaped = state.reap_stale(self.reap_after_cycles);
        if reaped > 0 {
            debug!("removed {reaped} stale workloads");
        }
        state.reset_current();

        let mut totals = CycleTotals::default();
        let mut io_read = 0u64;
        let mut io_written = 0u64;
        let mut io_cgroups = HashSet::new();
        let mut gpu_pids = HashSet::new();
        let mut accounted = 0usize;

        for raw in &entries {
            let sample = match RawProcessSample::decode(raw) {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("failed to decode counter record: {e}");
                    continue;
                }
            };
            let name = match self.resolver.resolve(sample.cgroup_id) {
                Ok(name) => name,
                Err(e) => {
                    warn!("failed to resolve workload of cgroup {}: {e:#}", sample.cgroup_id);
                    continue;
                }
            };

            let (avg_freq, cpu_time) = if self.enable_cpu_freq {
                average_frequency(&state.domains.cpu_frequency, &sample.cpu_time)
            } else {
                (0.0, sample.process_run_time as f64)
            };
            // Keeps the accumulated values small.
            let cpu_time = cpu_time / 1000.0;

            let gpu_energy = u32::try_from(sample.pid)
                .ok()
                .and_then(|pid| state.domains.gpu_energy.get(&pid).map(|&e| (pid, e)))
                .filter(|(pid, _)| gpu_pids.insert(*pid))
                .map(|(_, e)| e as u64)
                .unwrap_or(0);

            let resolver = &self.resolver;
            let record = state.workload_entry(&name, || {
                let namespace = resolver.resolve_namespace(sample.cgroup_id).unwrap_or_else(|e| {
                    warn!("failed to find namespace of cgroup {}: {e:#}", sample.cgroup_id);
                    UNKNOWN_NAMESPACE.to_string()
                });
                WorkloadIdentity {
                    cgroup_id: sample.cgroup_id,
                    pid: sample.pid,
                    command: sample.command.clone(),
                    namespace,
                    name: name.clone(),
                }
            });

            let current = &mut record.current;
            current.cpu_time += cpu_time;
            current.cpu_cycles = current.cpu_cycles.saturating_add(sample.cpu_cycles);
            current.cpu_instructions = current
                .cpu_instructions
                .saturating_add(sample.cpu_instructions);
            current.cache_misses = current.cache_misses.saturating_add(sample.cache_misses);
            current.gpu_energy_mj = current.gpu_energy_mj.saturating_add(gpu_energy);
            record.avg_cpu_freq = avg_freq;
            totals.cpu_time += cpu_time;
            totals.cpu_cycles = totals.cpu_cycles.saturating_add(sample.cpu_cycles);
            totals.cpu_instructions = totals
                .cpu_instructions
                .saturating_add(sample.cpu_instructions);
            totals.cache_misses = totals.cache_misses.saturating_add(sample.cache_misses);

            // The first record of a cgroup carries its I/O.
            if !io_cgroups.contains(&sample.cgroup_id) {
                match self.io.read_cgroup_io(sample.cgroup_id) {
                    Ok(io) => {
                        io_cgroups.insert(sample.cgroup_id);
                        record.disks = record.disks.max(io.disks);
                        record.current.bytes_read =
                            record.current.bytes_read.saturating_add(io.read_bytes);
                        record.current.bytes_written =
                            record.current.bytes_written.saturating_add(io.write_bytes);
                        io_read = io_read.saturating_add(io.read_bytes);
                        io_written = io_written.saturating_add(io.write_bytes);
                    }
                    Err(e) => debug!("no io.stat for cgroup {}: {e:#}", sample.cgroup_id),
                }
            }

            accounted += 1;
        }

        if let Err(e) = self.table.clear() {
            warn!("failed to clear counter table: {e:#}");
        }

        match self.io.read_host_io() {
            Ok(host) if host.read_bytes > io_read && host.write_bytes > io_written => {
                let (name, namespace) = self.resolver.system_workload();
                let record = state.workload_entry(&name, || WorkloadIdentity {
                    namespace,
                    name: name.clone(),
                    ..Default::default()
                });
                record.disks = host.disks;
                record.current.bytes_read = host.read_bytes - io_read;
                record.current.bytes_written = host.write_bytes - io_written;
            }
            Ok(host) => warn!(
                "host I/O (read {}, write {}) should exceed workload I/O (read {io_read}, write {io_written})",
                host.read_bytes, host.write_bytes
            ),
            Err(e) => warn!("failed to read host I/O: {e:#}"),
        }

        info!(
            core_mj = core_delta,
            dram_mj = dram_delta,
            other_mj = other_delta,
            gpu_mj = gpu_delta,
            cpu_time = totals.cpu_time,
            cpu_cycles = totals.cpu_cycles,
            cpu_instructions = totals.cpu_instructions,
            cache_misses = totals.cache_misses,
            device_memory = memory.device_memory,
            "energy cycle {}",
            state.cycle
        );

        state.device = DeviceEnergySample {
            cpu_time: totals.cpu_time,
            cpu_cycles: totals.cpu_cycles,
            cpu_instructions: totals.cpu_instructions,
            cache_misses: totals.cache_misses,
            device_memory: memory.device_memory,
            core_energy_mj: core_delta,
            dram_energy_mj: dram_delta,
            other_energy_mj: other_delta,
            gpu_energy_mj: gpu_delta,
        };

        let deltas = EnergyDeltas {
            core_mj: core_delta,
            dram_mj: dram_delta,
            other_mj: other_delta,
            gpu_mj: gpu_delta,
        };
        attribute(&mut state.workloads, &totals, &deltas, &memory, &self.model);
        state.last_cycle_at = Some(Utc::now());

        CycleOutcome::Attributed {
            workloads: state.workloads.len(),
            records: accounted,
        }
    }

    /// Runs cycles every sample period until `shutdown_rx` turns `true` or
    /// its sender is dropped.
    pub async fn run(&mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.sample_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the first cycle needs a full period.
        ticker.tick().await;

        info!(
            "energy collector started, sample period {}ms",
            self.sample_period.as_millis()
        );

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let started = Instant::now();
            let outcome = self.run_cycle().await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let mut stats = self.stats.write().await;
            match outcome {
                CycleOutcome::Attributed { workloads, .. } => {
                    stats.record_attributed_cycle(elapsed_ms, workloads)
                }
                CycleOutcome::Skipped(reason) => stats.record_skipped_cycle(reason),
            }

            if stats.total_cycles() % STATS_LOG_INTERVAL == 0 {
                stats.log_stats();
                if let Some(ref status_callback) = self.on_status_update {
                    status_callback(&format!(
                        "Running: {} cycles ({} attributed), {} workloads",
                        stats.total_cycles(),
                        stats.attributed_cycles(),
                        stats.last_workload_count()
                    ));
                }
            }
        }

        info!("energy collector stopped");
        self.stats.read().await.log_stats();
        Ok(())
    }
}

/// Frequency-weighted CPU time of a process.
///
/// Returns `(average frequency in kHz, total resident time)` over the CPUs
/// with a known frequency on which the process was resident.
pub fn average_frequency(
    frequencies: &HashMap<u32, u64>,
    cpu_time: &[u16; CPU_VECTOR_SIZE],
) -> (f64, f64) {
    let mut weighted = 0.0;
    let mut total = 0.0;
    for (&cpu, &freq) in frequencies {
        let Some(&time) = cpu_time.get(cpu as usize) else {
            continue;
        };
        if time != 0 {
            weighted += freq as f64 * time as f64;
            total += time as f64;
        }
    }
    if total == 0.0 {
        return (0.0, 0.0);
    }
    (weighted / total, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_frequency_weights_by_residency() {
        let mut cpu_time = [0u16; CPU_VECTOR_SIZE];
        cpu_time[0] = 1;
        cpu_time[1] = 3;
        cpu_time[5] = 7;
        let frequencies = HashMap::from([(0u32, 1_000_000u64), (1, 2_000_000), (200, 3_000_000)]);

        let (avg, total) = average_frequency(&frequencies, &cpu_time);
        assert_eq!(total, 4.0);
        assert_eq!(avg, 1_750_000.0);
    }

    #[test]
    fn average_frequency_without_residency_is_zero() {
        let frequencies = HashMap::from([(0u32, 1_000_000u64)]);
        assert_eq!(
            average_frequency(&frequencies, &[0u16; CPU_VECTOR_SIZE]),
            (0.0, 0.0)
        );
    }

    #[test]
    fn skip_reason_names() {
        assert_eq!(SkipReason::StalledSensor.as_str(), "stalled_sensor");
        assert_eq!(SkipReason::WarmUp.as_str(), "warm_up");
        assert_eq!(SkipReason::TableReadFailure.as_str(), "table_read_failure");
    }
}
