//! RAPL energy counters from the powercap framework.
//!
//! Zones live under `/sys/class/powercap` as `intel-rapl:<pkg>` with
//! sub-zones `intel-rapl:<pkg>:<n>`. Each zone exposes `name`, `energy_uj`
//! and `max_energy_range_uj`. The raw counter wraps at
//! `max_energy_range_uj`; [`RaplReader`] unwraps it so the values handed to the
//! collector never decrease.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const ZONE_PREFIX: &str = "intel-rapl:";

#[derive(Debug)]
struct ZoneCounter {
    path: PathBuf,
    max_range_uj: u64,
    last_raw_uj: Option<u64>,
    total_uj: u64,
}

impl ZoneCounter {
    fn new(path: PathBuf) -> Self {
        let max_range_uj = read_u64(&path.join("max_energy_range_uj")).unwrap_or(0);
        Self {
            path,
            max_range_uj,
            last_raw_uj: None,
            total_uj: 0,
        }
    }

    fn read(&mut self) -> Result<u64> {
        let raw = read_u64(&self.path.join("energy_uj"))?;
        match self.last_raw_uj {
            None => self.total_uj = raw,
            Some(last) if raw >= last => self.total_uj += raw - last,
            Some(last) if self.max_range_uj > last => {
                debug!("RAPL counter wrapped at {}", self.path.display());
                self.total_uj += self.max_range_uj - last + raw;
            }
            Some(last) => {
                warn!(
                    "RAPL counter at {} went backwards ({} -> {}) without a usable max range",
                    self.path.display(),
                    last,
                    raw
                );
                self.total_uj += raw;
            }
        }
        self.last_raw_uj = Some(raw);
        Ok(self.total_uj)
    }
}

/// Reader of cumulative core and DRAM energy.
#[derive(Debug)]
pub struct RaplReader {
    root: PathBuf,
    core: Vec<ZoneCounter>,
    dram: Vec<ZoneCounter>,
    discovered: bool,
}

impl RaplReader {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            core: Vec::new(),
            dram: Vec::new(),
            discovered: false,
        }
    }

    /// Cumulative core energy in mJ.
    ///
    /// Packages without a `core` sub-zone contribute their package counter.
    pub fn read_core_energy(&mut self) -> Result<u64> {
        self.discover()?;
        if self.core.is_empty() {
            return Err(anyhow!(
                "no RAPL package zones found under {}",
                self.root.display()
            ));
        }
        sum_mj(&mut self.core)
    }

    /// Cumulative DRAM energy in mJ, 0 when the platform has no DRAM zone.
    pub fn read_dram_energy(&mut self) -> Result<u64> {
        self.discover()?;
        sum_mj(&mut self.dram)
    }

    fn discover(&mut self) -> Result<()> {
        if self.discovered {
            return Ok(());
        }

        let pattern = format!("{}/{}*", self.root.display(), ZONE_PREFIX);
        let mut packages: Vec<PathBuf> = glob::glob(&pattern)
            .with_context(|| format!("invalid RAPL glob pattern {pattern}"))?
            .filter_map(|entry| entry.ok())
            .filter(|path| zone_depth(path) == Some(1))
            .collect();
        packages.sort();

        self.core.clear();
        self.dram.clear();
        for package in packages {
            let name = read_zone_name(&package);
            if name == "dram" {
                self.dram.push(ZoneCounter::new(package));
                continue;
            }
            if !name.starts_with("package") {
                debug!("skipping RAPL zone {} ({})", package.display(), name);
                continue;
            }

            let mut core_zone = None;
            let sub_pattern = format!("{}/{}*", package.display(), ZONE_PREFIX);
            if let Ok(subzones) = glob::glob(&sub_pattern) {
                for sub in subzones.filter_map(|entry| entry.ok()) {
                    match read_zone_name(&sub).as_str() {
                        "core" => core_zone = Some(sub),
                        "dram" => self.dram.push(ZoneCounter::new(sub)),
                        _ => {}
                    }
                }
            }
            self.core
                .push(ZoneCounter::new(core_zone.unwrap_or(package)));
        }

        debug!(
            "discovered {} core and {} dram RAPL zones under {}",
            self.core.len(),
            self.dram.len(),
            self.root.display()
        );
        // Retried on the next read until a package zone shows up.
        self.discovered = !self.core.is_empty();
        Ok(())
    }
}

fn sum_mj(zones: &mut [ZoneCounter]) -> Result<u64> {
    let mut total_uj = 0u64;
    for zone in zones.iter_mut() {
        total_uj += zone.read()?;
    }
    Ok(total_uj / 1000)
}

/// `intel-rapl:0` → 1, `intel-rapl:0:1` → 2.
fn zone_depth(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(ZONE_PREFIX)?;
    Some(rest.split(':').count())
}

fn read_zone_name(path: &Path) -> String {
    fs::read_to_string(path.join("name"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn read_u64(path: &Path) -> Result<u64> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    content
        .trim()
        .parse::<u64>()
        .with_context(|| format!("invalid counter value in {}: {:?}", path.display(), content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_zone(dir: &Path, name: &str, energy_uj: u64, max_uj: u64) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("name"), format!("{name}\n")).unwrap();
        fs::write(dir.join("energy_uj"), format!("{energy_uj}\n")).unwrap();
        fs::write(dir.join("max_energy_range_uj"), format!("{max_uj}\n")).unwrap();
    }

    #[test]
    fn core_uses_core_subzone_and_dram_subzone() {
        let tmp = TempDir::new().unwrap();
        let pkg = tmp.path().join("intel-rapl:0");
        write_zone(&pkg, "package-0", 50_000_000, 262_143_328_850);
        write_zone(&pkg.join("intel-rapl:0:0"), "core", 20_000_000, 262_143_328_850);
        write_zone(&pkg.join("intel-rapl:0:1"), "dram", 3_000_000, 262_143_328_850);

        let mut reader = RaplReader::new(tmp.path());
        assert_eq!(reader.read_core_energy().unwrap(), 20_000);
        assert_eq!(reader.read_dram_energy().unwrap(), 3_000);
    }

    #[test]
    fn package_counter_used_when_core_subzone_missing() {
        let tmp = TempDir::new().unwrap();
        write_zone(&tmp.path().join("intel-rapl:0"), "package-0", 7_000_000, 1 << 32);

        let mut reader = RaplReader::new(tmp.path());
        assert_eq!(reader.read_core_energy().unwrap(), 7_000);
        assert_eq!(reader.read_dram_energy().unwrap(), 0);
    }

    #[test]
    fn wrapped_counter_stays_monotonic() {
        let tmp = TempDir::new().unwrap();
        let pkg = tmp.path().join("intel-rapl:0");
        write_zone(&pkg, "package-0", 9_000_000, 10_000_000);

        let mut reader = RaplReader::new(tmp.path());
        assert_eq!(reader.read_core_energy().unwrap(), 9_000);

        fs::write(pkg.join("energy_uj"), "1000000\n").unwrap();
        // 1_000_000 left before the wrap plus 1_000_000 after it
        assert_eq!(reader.read_core_energy().unwrap(), 11_000);
    }

    #[test]
    fn missing_zones_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut reader = RaplReader::new(tmp.path());
        assert!(reader.read_core_energy().is_err());
    }

    #[test]
    fn zones_appearing_later_are_discovered() {
        let tmp = TempDir::new().unwrap();
        let mut reader = RaplReader::new(tmp.path());
        assert!(reader.read_core_energy().is_err());

        let pkg = tmp.path().join("intel-rapl:0");
        write_zone(&pkg, "package-0", 5_000_000, 1 << 32);
        write_zone(&pkg.join("intel-rapl:0:1"), "dram", 2_000_000, 1 << 32);
        assert_eq!(reader.read_core_energy().unwrap(), 5_000);
        assert_eq!(reader.read_dram_energy().unwrap(), 2_000);
    }

    #[test]
    fn zone_depth_counts_indices() {
        assert_eq!(zone_depth(Path::new("/x/intel-rapl:0")), Some(1));
        assert_eq!(zone_depth(Path::new("/x/intel-rapl:0:2")), Some(2));
        assert_eq!(zone_depth(Path::new("/x/intel-rapl")), None);
    }
}
