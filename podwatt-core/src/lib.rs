pub mod api;
pub mod attribution;
pub mod collector;
pub mod config;
pub mod metrics;
pub mod resolver;
pub mod store;
pub mod utils;

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::ApiServer;
use crate::collector::{CollectorSources, EnergyCollector, SkipReason};
use crate::config::Config;
use crate::metrics::ebpf::{CounterTable, InMemoryCounterTable};
use crate::metrics::power::SysfsPowerDomains;
use crate::metrics::raw_sample::CPU_VECTOR_SIZE;
use crate::resolver::CgroupWorkloads;
use crate::store::{new_shared_state, StateSnapshot};
use crate::utils::cgroups::is_cgroup_v2_available;

/// Callback функция для уведомления о готовности демона (например, для systemd notify).
pub type ReadyCallback = Box<dyn Fn() + Send + Sync>;

/// Callback функция для обновления статуса демона (например, для systemd notify).
pub type StatusCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Статистика работы коллектора.
///
/// Считает циклы (дошедшие до распределения энергии и пропущенные, с
/// причинами пропуска) и время выполнения. Логируется каждые 10 циклов.
///
/// ```
/// use podwatt_core::CollectorStats;
/// use podwatt_core::collector::SkipReason;
///
/// let mut stats = CollectorStats::new();
/// stats.record_attributed_cycle(100, 3);
/// stats.record_attributed_cycle(200, 4);
/// stats.record_skipped_cycle(SkipReason::StalledSensor);
///
/// assert_eq!(stats.total_cycles(), 3);
/// assert_eq!(stats.average_cycle_duration_ms(), 150.0);
/// ```
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CollectorStats {
    /// Общее количество циклов
    total_cycles: u64,
    /// Циклы, в которых энергия была распределена
    attributed_cycles: u64,
    /// Пропущенные циклы
    skipped_cycles: u64,
    /// Пропущенные циклы по причинам
    skip_reasons: BTreeMap<String, u64>,
    /// Суммарное время распределённых циклов (мс)
    total_duration_ms: u64,
    /// Максимальное время одного цикла (мс)
    max_cycle_duration_ms: u64,
    /// Количество workloads после последнего цикла
    last_workload_count: usize,
}

impl CollectorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attributed_cycle(&mut self, duration_ms: u64, workloads: usize) {
        self.total_cycles += 1;
        self.attributed_cycles += 1;
        self.total_duration_ms += duration_ms;
        self.max_cycle_duration_ms = self.max_cycle_duration_ms.max(duration_ms);
        self.last_workload_count = workloads;
    }

    pub fn record_skipped_cycle(&mut self, reason: SkipReason) {
        self.total_cycles += 1;
        self.skipped_cycles += 1;
        *self
            .skip_reasons
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn attributed_cycles(&self) -> u64 {
        self.attributed_cycles
    }

    pub fn skipped_cycles(&self) -> u64 {
        self.skipped_cycles
    }

    pub fn skip_reasons(&self) -> impl Iterator<Item = (&str, u64)> {
        self.skip_reasons.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn last_workload_count(&self) -> usize {
        self.last_workload_count
    }

    /// Среднее время распределённого цикла (мс), 0.0 если таких циклов не было.
    pub fn average_cycle_duration_ms(&self) -> f64 {
        if self.attributed_cycles > 0 {
            self.total_duration_ms as f64 / self.attributed_cycles as f64
        } else {
            0.0
        }
    }

    pub fn log_stats(&self) {
        info!(
            "Collector stats: {} total cycles ({} attributed, {} skipped), \
             avg cycle: {:.2}ms, max cycle: {}ms, workloads: {}",
            self.total_cycles,
            self.attributed_cycles,
            self.skipped_cycles,
            self.average_cycle_duration_ms(),
            self.max_cycle_duration_ms,
            self.last_workload_count
        );
        if !self.skip_reasons.is_empty() {
            debug!("Skipped cycles by reason: {:?}", self.skip_reasons);
        }
    }
}

/// Открывает таблицу счётчиков процессов.
///
/// Без `paths.bpf_map` (или без feature `ebpf`) используется пустая таблица в
/// памяти: энергия тогда распределяется только между workloads, найденными
/// по I/O хоста.
fn open_counter_table(config: &Config) -> Result<Box<dyn CounterTable>> {
    match &config.paths.bpf_map {
        #[cfg(feature = "ebpf")]
        Some(path) => {
            info!("Opening pinned BPF map at {}", path.display());
            Ok(Box::new(crate::metrics::ebpf::PinnedMapTable::open(path)?))
        }
        #[cfg(not(feature = "ebpf"))]
        Some(path) => {
            warn!(
                "bpf_map {} is configured but eBPF support is not compiled in, \
                 per-process counters are disabled",
                path.display()
            );
            Ok(Box::new(InMemoryCounterTable::new()))
        }
        None => {
            warn!("No BPF map configured, per-process counters are disabled");
            Ok(Box::new(InMemoryCounterTable::new()))
        }
    }
}

/// Собирает коллектор с читателями sysfs/procfs хоста.
pub fn build_collector(config: &Config) -> Result<EnergyCollector> {
    if !is_cgroup_v2_available(&config.paths.cgroup_root) {
        warn!("Workload resolution needs cgroup v2, records will be dropped");
    }
    if config.enable_cpu_freq && num_cpus::get() > CPU_VECTOR_SIZE {
        warn!(
            "{} CPUs online, only the first {} are tracked for frequency accounting",
            num_cpus::get(),
            CPU_VECTOR_SIZE
        );
    }

    let workloads = Arc::new(CgroupWorkloads::new(
        &config.paths.cgroup_root,
        &config.paths.proc_root,
    ));
    let sources = CollectorSources {
        power: Box::new(SysfsPowerDomains::new(&config.paths)),
        table: open_counter_table(config)?,
        resolver: workloads.clone(),
        io: workloads.clone(),
        memory: workloads,
    };
    Ok(EnergyCollector::new(config, sources, new_shared_state()))
}

/// Выполняет один цикл сбора и возвращает состояние после него.
///
/// Первый цикл после старта только фиксирует базовые значения, поэтому
/// перед измерением выдерживается один период.
pub async fn run_once(config: Config) -> Result<StateSnapshot> {
    let mut collector = build_collector(&config)?;
    collector.initialize().await;
    tokio::time::sleep(Duration::from_millis(config.sample_period_ms)).await;
    let outcome = collector.run_cycle().await;
    info!("Single cycle finished: {:?}", outcome);
    let state = collector.state();
    let snapshot = state.read().await.snapshot();
    Ok(snapshot)
}

/// Главный цикл демона: периодический сбор и распределение энергии.
///
/// Демон работает до тех пор, пока в `shutdown_rx` не придёт `true`.
///
/// ```no_run
/// use podwatt_core::{config::Config, run_daemon};
/// use tokio::sync::watch;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = Config::load("configs/podwatt.yml")?;
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
///
/// let daemon_handle = tokio::spawn(async move {
///     run_daemon(config, shutdown_rx, None, None).await
/// });
///
/// shutdown_tx.send(true)?;
/// daemon_handle.await??;
/// # Ok(())
/// # }
/// ```
pub async fn run_daemon(
    config: Config,
    shutdown_rx: watch::Receiver<bool>,
    on_ready: Option<ReadyCallback>,
    on_status_update: Option<StatusCallback>,
) -> Result<()> {
    info!("Initializing podwatt daemon");

    let collector = build_collector(&config)?;
    let mut collector = match on_status_update {
        Some(callback) => collector.with_status_callback(callback),
        None => collector,
    };
    collector.initialize().await;

    let api_server_handle = match config.api.listen_addr {
        Some(addr) => {
            let server = ApiServer::with_stats(addr, collector.state(), collector.stats());
            match server.start().await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Failed to start API server: {:#}. Continuing without API.", e);
                    None
                }
            }
        }
        None => {
            debug!("API server disabled (api.listen_addr not configured)");
            None
        }
    };

    info!("podwatt daemon started, entering main loop");
    if let Some(ref callback) = on_ready {
        callback();
    }

    let result = collector.run(shutdown_rx).await;

    if let Some(handle) = api_server_handle {
        info!("Stopping API server");
        if let Err(e) = handle.shutdown().await {
            warn!("Failed to stop API server: {:#}", e);
        }
    }

    info!("podwatt daemon stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_count_skip_reasons() {
        let mut stats = CollectorStats::new();
        stats.record_skipped_cycle(SkipReason::WarmUp);
        stats.record_skipped_cycle(SkipReason::StalledSensor);
        stats.record_skipped_cycle(SkipReason::StalledSensor);

        assert_eq!(stats.total_cycles(), 3);
        assert_eq!(stats.skipped_cycles(), 3);
        assert_eq!(stats.attributed_cycles(), 0);
        assert_eq!(stats.average_cycle_duration_ms(), 0.0);
        let reasons: Vec<_> = stats.skip_reasons().collect();
        assert_eq!(reasons, vec![("stalled_sensor", 2), ("warm_up", 1)]);
    }

    #[test]
    fn stats_track_max_duration_and_workloads() {
        let mut stats = CollectorStats::new();
        stats.record_attributed_cycle(30, 2);
        stats.record_attributed_cycle(10, 5);
        assert_eq!(stats.max_cycle_duration_ms, 30);
        assert_eq!(stats.last_workload_count(), 5);
        assert_eq!(stats.average_cycle_duration_ms(), 20.0);
    }
}
