//! Whole-machine power meter and CPU frequency readers.
//!
//! ACPI power meters are exposed by the `acpi_power_meter` hwmon driver
//! (`name` is `power_meter`) with `power<N>_average` in microwatts. The
//! meter reports power, so energy is integrated over the time between two
//! reads. Frequencies come from cpufreq `scaling_cur_freq` in kHz.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

const POWER_METER_NAME: &str = "power_meter";

/// Integrates ACPI power meter readings into energy and reads CPU frequencies.
#[derive(Debug)]
pub struct AcpiPowerMeter {
    hwmon_root: PathBuf,
    cpu_root: PathBuf,
    last_read: Option<Instant>,
}

impl AcpiPowerMeter {
    pub fn new(hwmon_root: impl AsRef<Path>, cpu_root: impl AsRef<Path>) -> Self {
        Self {
            hwmon_root: hwmon_root.as_ref().to_path_buf(),
            cpu_root: cpu_root.as_ref().to_path_buf(),
            last_read: None,
        }
    }

    /// Energy in mJ observed by each sensor since the previous call.
    ///
    /// The first call only starts the integration window and reports zero for
    /// every sensor. A host without power meters yields an empty map.
    pub fn read_energy_by_sensor(&mut self) -> Result<HashMap<String, f64>> {
        self.read_energy_by_sensor_at(Instant::now())
    }

    fn read_energy_by_sensor_at(&mut self, now: Instant) -> Result<HashMap<String, f64>> {
        let elapsed_secs = self
            .last_read
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_read = Some(now);

        let mut energy = HashMap::new();
        for (sensor, power_uw) in self.read_power_uw()? {
            // µW · s = µJ
            energy.insert(sensor, power_uw as f64 * elapsed_secs / 1000.0);
        }
        Ok(energy)
    }

    fn read_power_uw(&self) -> Result<Vec<(String, u64)>> {
        let pattern = format!("{}/hwmon*", self.hwmon_root.display());
        let mut readings = Vec::new();
        for hwmon in glob::glob(&pattern)
            .with_context(|| format!("invalid hwmon glob pattern {pattern}"))?
            .filter_map(|entry| entry.ok())
        {
            let name = fs::read_to_string(hwmon.join("name")).unwrap_or_default();
            if name.trim() != POWER_METER_NAME {
                continue;
            }
            let hwmon_name = hwmon
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let inputs = format!("{}/power*_average", hwmon.display());
            for input in glob::glob(&inputs)
                .with_context(|| format!("invalid power glob pattern {inputs}"))?
                .filter_map(|entry| entry.ok())
            {
                let raw = fs::read_to_string(&input)
                    .with_context(|| format!("failed to read {}", input.display()))?;
                let power_uw = raw.trim().parse::<u64>().with_context(|| {
                    format!("invalid power value in {}: {:?}", input.display(), raw)
                })?;
                let input_name = input
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                readings.push((format!("{hwmon_name}/{input_name}"), power_uw));
            }
        }
        Ok(readings)
    }

    /// Current frequency of every logical CPU with cpufreq support, kHz.
    pub fn read_core_frequencies(&self) -> Result<HashMap<u32, u64>> {
        let pattern = format!("{}/cpu[0-9]*/cpufreq/scaling_cur_freq", self.cpu_root.display());
        let mut frequencies = HashMap::new();
        for path in glob::glob(&pattern)
            .with_context(|| format!("invalid cpufreq glob pattern {pattern}"))?
            .filter_map(|entry| entry.ok())
        {
            let Some(cpu) = cpu_index(&path) else {
                continue;
            };
            match fs::read_to_string(&path) {
                Ok(raw) => {
                    if let Ok(khz) = raw.trim().parse::<u64>() {
                        frequencies.insert(cpu, khz);
                    }
                }
                // CPUs can go offline between glob and read.
                Err(e) => debug!("failed to read {}: {}", path.display(), e),
            }
        }
        Ok(frequencies)
    }
}

/// `.../cpu12/cpufreq/scaling_cur_freq` → 12.
fn cpu_index(path: &Path) -> Option<u32> {
    let cpu_dir = path.parent()?.parent()?.file_name()?.to_str()?;
    cpu_dir.strip_prefix("cpu")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn first_read_reports_zero_then_integrates_power() {
        let tmp = TempDir::new().unwrap();
        let hwmon = tmp.path().join("hwmon3");
        fs::create_dir_all(&hwmon).unwrap();
        fs::write(hwmon.join("name"), "power_meter\n").unwrap();
        fs::write(hwmon.join("power1_average"), "100000000\n").unwrap(); // 100 W

        let other = tmp.path().join("hwmon0");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("name"), "coretemp\n").unwrap();
        fs::write(other.join("power1_average"), "5\n").unwrap();

        let mut meter = AcpiPowerMeter::new(tmp.path(), tmp.path());
        let start = Instant::now();
        let first = meter.read_energy_by_sensor_at(start).unwrap();
        assert_eq!(first.get("hwmon3/power1_average"), Some(&0.0));
        assert_eq!(first.len(), 1);

        let second = meter
            .read_energy_by_sensor_at(start + Duration::from_secs(3))
            .unwrap();
        // 100 W for 3 s = 300 J
        let energy = second["hwmon3/power1_average"];
        assert!((energy - 300_000.0).abs() < 1e-6);
    }

    #[test]
    fn host_without_power_meter_yields_empty_map() {
        let tmp = TempDir::new().unwrap();
        let mut meter = AcpiPowerMeter::new(tmp.path(), tmp.path());
        assert!(meter.read_energy_by_sensor().unwrap().is_empty());
    }

    #[test]
    fn reads_scaling_cur_freq_per_cpu() {
        let tmp = TempDir::new().unwrap();
        for (cpu, khz) in [(0, 2_400_000u64), (3, 3_100_000)] {
            let dir = tmp.path().join(format!("cpu{cpu}/cpufreq"));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("scaling_cur_freq"), format!("{khz}\n")).unwrap();
        }
        fs::create_dir_all(tmp.path().join("cpufreq")).unwrap();

        let meter = AcpiPowerMeter::new(tmp.path(), tmp.path());
        let freqs = meter.read_core_frequencies().unwrap();
        assert_eq!(freqs.len(), 2);
        assert_eq!(freqs[&0], 2_400_000);
        assert_eq!(freqs[&3], 3_100_000);
    }
}
