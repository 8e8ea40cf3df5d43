//! Per-process GPU energy from DRM.
//!
//! Card energy comes from the card's hwmon: `energy1_input` (µJ, cumulative)
//! when present, otherwise `power1_average` (µW) integrated over the time
//! between reads. The energy is split across processes by how much engine
//! time each of them accumulated, taken from the `drm-engine-*` keys of
//! `/proc/<pid>/fdinfo/*`.
//!
//! Readings are reset on read: every call returns the energy since the
//! previous call. The first call only establishes baselines.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

/// DRM backed GPU energy reader.
#[derive(Debug)]
pub struct DrmGpuEnergy {
    drm_root: PathBuf,
    proc_root: PathBuf,
    last_read: Option<Instant>,
    last_energy_uj: HashMap<PathBuf, u64>,
    last_engine_ns: HashMap<u32, u64>,
}

impl DrmGpuEnergy {
    pub fn new(drm_root: impl AsRef<Path>, proc_root: impl AsRef<Path>) -> Self {
        Self {
            drm_root: drm_root.as_ref().to_path_buf(),
            proc_root: proc_root.as_ref().to_path_buf(),
            last_read: None,
            last_energy_uj: HashMap::new(),
            last_engine_ns: HashMap::new(),
        }
    }

    /// GPU energy per pid in mJ since the previous call.
    pub fn read_energy_per_process(&mut self) -> Result<HashMap<u32, f64>> {
        let now = Instant::now();
        let elapsed_secs = self
            .last_read
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_read = Some(now);

        let card_energy_mj = self.read_card_energy_mj(elapsed_secs)?;
        let engine_ns = self.read_engine_time()?;

        let mut deltas = HashMap::new();
        for (&pid, &ns) in &engine_ns {
            if let Some(&last) = self.last_engine_ns.get(&pid) {
                if ns > last {
                    deltas.insert(pid, ns - last);
                }
            }
        }
        self.last_engine_ns = engine_ns;

        Ok(split_by_engine_time(card_energy_mj, &deltas))
    }

    fn read_card_energy_mj(&mut self, elapsed_secs: f64) -> Result<f64> {
        let pattern = format!("{}/card*/device/hwmon/hwmon*", self.drm_root.display());
        let mut total_mj = 0.0;
        for hwmon in glob::glob(&pattern)
            .with_context(|| format!("invalid DRM glob pattern {pattern}"))?
            .filter_map(|entry| entry.ok())
        {
            let energy_path = hwmon.join("energy1_input");
            if let Ok(raw) = fs::read_to_string(&energy_path) {
                let Ok(uj) = raw.trim().parse::<u64>() else {
                    continue;
                };
                if let Some(last) = self.last_energy_uj.insert(energy_path, uj) {
                    total_mj += uj.saturating_sub(last) as f64 / 1000.0;
                }
                continue;
            }

            if let Ok(raw) = fs::read_to_string(hwmon.join("power1_average")) {
                if let Ok(uw) = raw.trim().parse::<u64>() {
                    total_mj += uw as f64 * elapsed_secs / 1000.0;
                }
            }
        }
        Ok(total_mj)
    }

    /// Total engine busy time per pid, counting each DRM client once.
    fn read_engine_time(&self) -> Result<HashMap<u32, u64>> {
        let processes = procfs::process::all_processes_with_root(&self.proc_root)
            .with_context(|| format!("failed to list processes in {}", self.proc_root.display()))?;

        let mut engine_ns = HashMap::new();
        for process in processes.filter_map(|p| p.ok()) {
            let pid = process.pid();
            let Ok(pid) = u32::try_from(pid) else {
                continue;
            };
            let fdinfo_dir = self.proc_root.join(pid.to_string()).join("fdinfo");
            let Ok(entries) = fs::read_dir(&fdinfo_dir) else {
                continue;
            };

            let mut seen_clients = HashSet::new();
            let mut total = 0u64;
            for entry in entries.filter_map(|e| e.ok()) {
                let Ok(content) = fs::read_to_string(entry.path()) else {
                    continue;
                };
                if let Some(usage) = parse_drm_fdinfo(&content) {
                    if seen_clients.insert(usage.client_id) {
                        total += usage.engine_ns;
                    }
                }
            }
            if !seen_clients.is_empty() {
                engine_ns.insert(pid, total);
            }
        }
        debug!("{} processes hold DRM clients", engine_ns.len());
        Ok(engine_ns)
    }
}

/// Engine usage of one DRM client as reported in fdinfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmClientUsage {
    pub client_id: u64,
    pub engine_ns: u64,
}

/// Parses the DRM keys of one fdinfo file. Non-DRM descriptors yield `None`.
pub fn parse_drm_fdinfo(content: &str) -> Option<DrmClientUsage> {
    let mut client_id = None;
    let mut engine_ns = 0u64;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if key == "drm-client-id" {
            client_id = value.parse::<u64>().ok();
        } else if key.starts_with("drm-engine-") && !key.starts_with("drm-engine-capacity-") {
            if let Some(ns) = value.strip_suffix("ns").and_then(|v| v.trim().parse::<u64>().ok()) {
                engine_ns += ns;
            }
        }
    }
    client_id.map(|client_id| DrmClientUsage {
        client_id,
        engine_ns,
    })
}

/// Splits `energy_mj` proportionally to each pid's engine time delta.
pub fn split_by_engine_time(energy_mj: f64, deltas: &HashMap<u32, u64>) -> HashMap<u32, f64> {
    let total: u64 = deltas.values().sum();
    if total == 0 || energy_mj <= 0.0 {
        return HashMap::new();
    }
    deltas
        .iter()
        .filter(|(_, &ns)| ns > 0)
        .map(|(&pid, &ns)| (pid, energy_mj * ns as f64 / total as f64))
        .collect()
}
