//! Block I/O byte counters.
//!
//! Per-cgroup counters come from cgroup v2 `io.stat`, whole-host counters from
//! `/proc/diskstats`. Both are cumulative.

use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Cumulative I/O counters of a cgroup or of the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct IoStat {
    pub read_bytes: u64,
    pub write_bytes: u64,
    /// Number of block devices contributing to the counters.
    pub disks: usize,
}

/// Source of cumulative I/O counters.
pub trait IoStatReader: Send + Sync {
    fn read_cgroup_io(&self, cgroup_id: u64) -> Result<IoStat>;
    fn read_host_io(&self) -> Result<IoStat>;
}

/// Parses a cgroup v2 `io.stat` file.
///
/// ```text
/// 8:0 rbytes=1459200 wbytes=314773504 rios=192 wios=353 dbytes=0 dios=0
/// ```
pub fn parse_io_stat(content: &str) -> IoStat {
    let mut stat = IoStat::default();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        if fields.next().is_none() {
            continue;
        }
        stat.disks += 1;
        for field in fields {
            if let Some(v) = field.strip_prefix("rbytes=") {
                stat.read_bytes += v.parse::<u64>().unwrap_or(0);
            } else if let Some(v) = field.strip_prefix("wbytes=") {
                stat.write_bytes += v.parse::<u64>().unwrap_or(0);
            }
        }
    }
    stat
}

/// Reads `io.stat` of the cgroup at `cgroup_path`.
pub fn read_io_stat(cgroup_path: &Path) -> Result<IoStat> {
    let path = cgroup_path.join("io.stat");
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_io_stat(&content))
}

/// Sums whole-disk counters of `/proc/diskstats`.
///
/// Virtual devices (`loop`, `ram`, `dm-`) and partitions are skipped so that
/// bytes are not counted twice.
pub fn parse_diskstats(content: &str) -> Result<IoStat> {
    const SECTOR_SIZE: u64 = 512;

    let mut devices = Vec::new();
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }
        let name = parts[2];
        if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("dm-") {
            continue;
        }
        let sectors_read = parts[5]
            .parse::<u64>()
            .map_err(|e| anyhow!("invalid sectors read for {name}: {e}"))?;
        let sectors_written = parts[9]
            .parse::<u64>()
            .map_err(|e| anyhow!("invalid sectors written for {name}: {e}"))?;
        devices.push((name, sectors_read, sectors_written));
    }

    let names: HashSet<&str> = devices.iter().map(|(name, _, _)| *name).collect();
    let mut stat = IoStat::default();
    for (name, sectors_read, sectors_written) in &devices {
        if is_partition(name, &names) {
            continue;
        }
        stat.read_bytes += sectors_read * SECTOR_SIZE;
        stat.write_bytes += sectors_written * SECTOR_SIZE;
        stat.disks += 1;
    }
    Ok(stat)
}

/// Reads host-wide counters from `<proc_root>/diskstats`.
pub fn read_host_diskstats(proc_root: &Path) -> Result<IoStat> {
    let path = proc_root.join("diskstats");
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_diskstats(&content)
}

/// `sda1` is a partition of `sda`, `nvme0n1p2` of `nvme0n1`.
fn is_partition(name: &str, names: &HashSet<&str>) -> bool {
    if !name.ends_with(|c: char| c.is_ascii_digit()) {
        return false;
    }
    let base = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if base.is_empty() {
        return false;
    }
    names.contains(base) || base.strip_suffix('p').is_some_and(|b| names.contains(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_stat_sums_all_devices() {
        let content = "8:0 rbytes=1000 wbytes=2000 rios=1 wios=2 dbytes=0 dios=0\n\
                       259:0 rbytes=30 wbytes=40 rios=1 wios=1 dbytes=0 dios=0\n";
        assert_eq!(
            parse_io_stat(content),
            IoStat {
                read_bytes: 1030,
                write_bytes: 2040,
                disks: 2
            }
        );
    }

    #[test]
    fn empty_io_stat_is_zero() {
        assert_eq!(parse_io_stat(""), IoStat::default());
    }

    #[test]
    fn diskstats_skips_partitions_and_virtual_devices() {
        let content = "\
   8       0 sda 100 0 10 0 50 0 20 0 0 0 0
   8       1 sda1 90 0 9 0 45 0 18 0 0 0 0
 259       0 nvme0n1 10 0 4 0 10 0 2 0 0 0 0
 259       1 nvme0n1p1 10 0 4 0 10 0 2 0 0 0 0
   7       0 loop0 5 0 100 0 0 0 0 0 0 0 0
 253       0 dm-0 5 0 100 0 0 0 100 0 0 0 0
";
        let stat = parse_diskstats(content).expect("diskstats");
        assert_eq!(stat.disks, 2);
        assert_eq!(stat.read_bytes, (10 + 4) * 512);
        assert_eq!(stat.write_bytes, (20 + 2) * 512);
    }

    #[test]
    fn nvme_namespace_is_not_a_partition() {
        let names: HashSet<&str> = ["nvme0n1"].into_iter().collect();
        assert!(!is_partition("nvme0n1", &names));
    }
}
