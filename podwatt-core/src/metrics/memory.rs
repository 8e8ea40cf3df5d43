//! Resident memory metrics.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Resident memory per workload and for the whole device, in bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySnapshot {
    /// Keyed by `"<namespace>/<workload>"`.
    pub per_workload: HashMap<String, f64>,
    pub device_memory: f64,
}

/// Source of resident memory metrics.
pub trait MemoryReader: Send + Sync {
    fn read_memory(&self) -> Result<MemorySnapshot>;
}

/// Used memory (`MemTotal - MemAvailable`) in bytes from `/proc/meminfo`.
pub fn parse_used_memory(contents: &str) -> Result<u64> {
    let mut values: HashMap<&str, u64> = HashMap::new();
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let key = match parts.next() {
            Some(k) => k.trim_end_matches(':'),
            None => continue,
        };
        let value = match parts.next() {
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("invalid value of '{key}' in meminfo"))?,
            None => continue,
        };
        values.insert(key, value);
    }

    let take = |name: &str| -> Result<u64> {
        values
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("meminfo has no '{name}' field"))
    };
    let total_kb = take("MemTotal")?;
    let available_kb = take("MemAvailable")?;
    Ok(total_kb.saturating_sub(available_kb) * 1024)
}

pub fn read_used_memory(proc_root: &Path) -> Result<u64> {
    let path = proc_root.join("meminfo");
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_used_memory(&content)
}

/// `memory.current` of a cgroup, bytes.
pub fn read_cgroup_memory(cgroup_path: &Path) -> Result<u64> {
    let path = cgroup_path.join("memory.current");
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    content
        .trim()
        .parse::<u64>()
        .with_context(|| format!("invalid memory.current in {}", path.display()))
}
