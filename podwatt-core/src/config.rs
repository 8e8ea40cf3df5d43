use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Период цикла сбора, мс.
    #[serde(default = "default_sample_period_ms")]
    pub sample_period_ms: u64,

    /// Взвешивать CPU time по частоте логических CPU.
    #[serde(default)]
    pub enable_cpu_freq: bool,

    /// Сколько циклов workload может не появляться, прежде чем его запись
    /// будет удалена. 0 отключает удаление.
    #[serde(default = "default_reap_after_cycles")]
    pub reap_after_cycles: u64,

    #[serde(default)]
    pub model: ModelCoefficients,

    #[serde(default)]
    pub paths: Paths,

    #[serde(default)]
    pub api: ApiConfig,
}

fn default_sample_period_ms() -> u64 {
    3000
}

fn default_reap_after_cycles() -> u64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_period_ms: default_sample_period_ms(),
            enable_cpu_freq: false,
            reap_after_cycles: default_reap_after_cycles(),
            model: ModelCoefficients::default(),
            paths: Paths::default(),
            api: ApiConfig::default(),
        }
    }
}

/// Веса модели распределения энергии.
///
/// Энергия ядер делится по `cpu_time`, `cpu_cycles`, `cpu_instructions`,
/// энергия DRAM по `cache_misses` и `memory_usage`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct ModelCoefficients {
    pub cpu_time: f64,
    pub cpu_cycles: f64,
    pub cpu_instructions: f64,
    pub cache_misses: f64,
    pub memory_usage: f64,
}

impl Default for ModelCoefficients {
    fn default() -> Self {
        Self {
            cpu_time: 1.0,
            cpu_cycles: 0.0,
            cpu_instructions: 0.0,
            cache_misses: 1.0,
            memory_usage: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Paths {
    pub cgroup_root: PathBuf,
    pub powercap_root: PathBuf,
    pub hwmon_root: PathBuf,
    pub cpu_root: PathBuf,
    pub drm_root: PathBuf,
    pub proc_root: PathBuf,
    /// Путь к закреплённой в bpffs таблице счётчиков.
    pub bpf_map: Option<PathBuf>,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            powercap_root: PathBuf::from("/sys/class/powercap"),
            hwmon_root: PathBuf::from("/sys/class/hwmon"),
            cpu_root: PathBuf::from("/sys/devices/system/cpu"),
            drm_root: PathBuf::from("/sys/class/drm"),
            proc_root: PathBuf::from("/proc"),
            bpf_map: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ApiConfig {
    /// Адрес HTTP API. Без адреса сервер не запускается.
    pub listen_addr: Option<SocketAddr>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {path}"))?;
        Self::from_yaml(&data).with_context(|| format!("invalid config at {path}"))
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config =
            serde_yaml::from_str(data).context("failed to parse YAML config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.sample_period_ms >= 100,
            "sample_period_ms must be >= 100 ms (got {})",
            self.sample_period_ms
        );
        ensure!(
            self.sample_period_ms <= 60000,
            "sample_period_ms must be <= 60000 ms (1 minute) (got {})",
            self.sample_period_ms
        );

        self.model.validate()?;
        self.paths.validate()?;

        Ok(())
    }
}

impl ModelCoefficients {
    fn validate(&self) -> Result<()> {
        let weights = [
            ("cpu_time", self.cpu_time),
            ("cpu_cycles", self.cpu_cycles),
            ("cpu_instructions", self.cpu_instructions),
            ("cache_misses", self.cache_misses),
            ("memory_usage", self.memory_usage),
        ];

        for (name, value) in weights {
            ensure!(
                (0.0..=1.0).contains(&value),
                "model.{name} must be in the [0, 1] range (got {value})"
            );
        }

        Ok(())
    }
}

impl Paths {
    fn validate(&self) -> Result<()> {
        let roots = [
            ("cgroup_root", &self.cgroup_root),
            ("powercap_root", &self.powercap_root),
            ("hwmon_root", &self.hwmon_root),
            ("cpu_root", &self.cpu_root),
            ("drm_root", &self.drm_root),
            ("proc_root", &self.proc_root),
        ];

        for (name, path) in roots {
            ensure!(
                !path.as_os_str().is_empty(),
                "paths.{name} must not be empty"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = Config::from_yaml("{}").expect("defaults");
        assert_eq!(cfg.sample_period_ms, 3000);
        assert!(!cfg.enable_cpu_freq);
        assert_eq!(cfg.reap_after_cycles, 100);
        assert_eq!(cfg.model, ModelCoefficients::default());
        assert_eq!(cfg.paths.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert!(cfg.api.listen_addr.is_none());
    }

    #[test]
    fn load_reads_file() {
        let mut file = NamedTempFile::new().expect("tempfile");
        write!(
            file,
            "sample_period_ms: 1000\n\
             enable_cpu_freq: true\n\
             reap_after_cycles: 0\n\
             model:\n  cpu_time: 0.5\n  cpu_cycles: 0.5\n\
             paths:\n  bpf_map: /sys/fs/bpf/podwatt/processes\n\
             api:\n  listen_addr: 127.0.0.1:9102\n"
        )
        .expect("write config");

        let cfg = Config::load(file.path().to_str().unwrap()).expect("config");
        assert_eq!(cfg.sample_period_ms, 1000);
        assert!(cfg.enable_cpu_freq);
        assert_eq!(cfg.reap_after_cycles, 0);
        assert_eq!(cfg.model.cpu_time, 0.5);
        assert_eq!(cfg.model.cpu_cycles, 0.5);
        assert_eq!(cfg.model.cache_misses, 1.0);
        assert_eq!(
            cfg.paths.bpf_map,
            Some(PathBuf::from("/sys/fs/bpf/podwatt/processes"))
        );
        assert_eq!(cfg.paths.proc_root, PathBuf::from("/proc"));
        assert_eq!(
            cfg.api.listen_addr,
            Some("127.0.0.1:9102".parse().unwrap())
        );
    }

    #[test]
    fn rejects_out_of_range_period() {
        assert!(Config::from_yaml("sample_period_ms: 10").is_err());
        assert!(Config::from_yaml("sample_period_ms: 120000").is_err());
    }

    #[test]
    fn rejects_weight_outside_unit_range() {
        let err = Config::from_yaml("model:\n  cpu_cycles: 1.5\n").unwrap_err();
        assert!(format!("{err:#}").contains("model.cpu_cycles"));
    }

    #[test]
    fn rejects_empty_path() {
        assert!(Config::from_yaml("paths:\n  proc_root: \"\"\n").is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load("/nonexistent/podwatt.yml").is_err());
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../configs/podwatt.yml");
        let cfg = Config::load(path).expect("example config");
        assert_eq!(cfg.model, ModelCoefficients::default());
        assert_eq!(
            cfg.api.listen_addr,
            Some("127.0.0.1:9102".parse().expect("addr"))
        );
        assert!(cfg.paths.bpf_map.is_none());
    }
}
