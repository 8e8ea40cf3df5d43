//! Power domain readers consumed by the collector.
//!
//! All energies are in millijoules. Core and DRAM readings are cumulative and
//! monotonically increasing; GPU readings are reset on read; device readings
//! are the energy each whole-machine sensor observed since the previous read.

use anyhow::Result;
use std::collections::HashMap;

use crate::config::Paths;
use crate::metrics::acpi::AcpiPowerMeter;
use crate::metrics::gpu::DrmGpuEnergy;
use crate::metrics::rapl::RaplReader;

/// Energy and frequency sources sampled once per cycle.
pub trait PowerDomainReader: Send {
    /// Cumulative CPU core energy, mJ.
    fn read_core_energy(&mut self) -> Result<u64>;

    /// Cumulative DRAM energy, mJ.
    fn read_dram_energy(&mut self) -> Result<u64>;

    /// GPU energy per pid since the previous call, mJ.
    fn read_gpu_energy_per_process(&mut self) -> Result<HashMap<u32, f64>>;

    /// Whole-machine energy by sensor name since the previous call, mJ.
    fn read_device_energy(&mut self) -> Result<HashMap<String, f64>>;

    /// Current frequency of each logical CPU, kHz.
    fn read_core_frequencies(&mut self) -> Result<HashMap<u32, u64>>;
}

/// Host readers backed by powercap, hwmon, cpufreq and DRM.
pub struct SysfsPowerDomains {
    rapl: RaplReader,
    acpi: AcpiPowerMeter,
    gpu: DrmGpuEnergy,
}

impl SysfsPowerDomains {
    pub fn new(paths: &Paths) -> Self {
        Self {
            rapl: RaplReader::new(&paths.powercap_root),
            acpi: AcpiPowerMeter::new(&paths.hwmon_root, &paths.cpu_root),
            gpu: DrmGpuEnergy::new(&paths.drm_root, &paths.proc_root),
        }
    }
}

impl PowerDomainReader for SysfsPowerDomains {
    fn read_core_energy(&mut self) -> Result<u64> {
        self.rapl.read_core_energy()
    }

    fn read_dram_energy(&mut self) -> Result<u64> {
        self.rapl.read_dram_energy()
    }

    fn read_gpu_energy_per_process(&mut self) -> Result<HashMap<u32, f64>> {
        self.gpu.read_energy_per_process()
    }

    fn read_device_energy(&mut self) -> Result<HashMap<String, f64>> {
        self.acpi.read_energy_by_sensor()
    }

    fn read_core_frequencies(&mut self) -> Result<HashMap<u32, u64>> {
        self.acpi.read_core_frequencies()
    }
}
