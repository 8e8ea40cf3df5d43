//! Cgroup id → workload resolution and the per-cgroup host readers built on it.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::metrics::io::{read_host_diskstats, read_io_stat, IoStat, IoStatReader};
use crate::metrics::memory::{read_cgroup_memory, read_used_memory, MemoryReader, MemorySnapshot};
use crate::utils::cgroups::{classify_cgroup_path, CgroupIndex, SYSTEM_NAMESPACE, SYSTEM_WORKLOAD};

/// Namespace recorded when a cgroup's namespace cannot be determined.
pub const UNKNOWN_NAMESPACE: &str = "unknown";

/// Minimum time between two walks of the cgroup hierarchy.
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Maps cgroup ids reported by the probe to workloads.
pub trait WorkloadResolver: Send + Sync {
    /// Workload name of a cgroup. Records whose name cannot be resolved are dropped.
    fn resolve(&self, cgroup_id: u64) -> Result<String>;

    /// Namespace of a cgroup's workload.
    fn resolve_namespace(&self, cgroup_id: u64) -> Result<String>;

    /// `(name, namespace)` of the synthetic workload that owns host activity.
    fn system_workload(&self) -> (String, String) {
        (SYSTEM_WORKLOAD.to_string(), SYSTEM_NAMESPACE.to_string())
    }
}

/// Cgroup v2 backed resolver, I/O reader and memory reader.
///
/// One instance is shared by the collector behind all three traits so that
/// the hierarchy is indexed once.
pub struct CgroupWorkloads {
    proc_root: PathBuf,
    index: Mutex<CgroupIndex>,
    last_refresh: Mutex<Option<Instant>>,
}

impl CgroupWorkloads {
    pub fn new(cgroup_root: impl AsRef<Path>, proc_root: impl AsRef<Path>) -> Self {
        Self {
            proc_root: proc_root.as_ref().to_path_buf(),
            index: Mutex::new(CgroupIndex::new(cgroup_root)),
            last_refresh: Mutex::new(None),
        }
    }

    /// Walks the hierarchy unless it was walked less than a second ago.
    fn refresh_if_due(&self) -> Result<()> {
        let mut last_refresh = self
            .last_refresh
            .lock()
            .map_err(|_| anyhow!("cgroup refresh lock poisoned"))?;
        if last_refresh.is_some_and(|at| at.elapsed() < REFRESH_INTERVAL) {
            return Ok(());
        }
        let mut index = self
            .index
            .lock()
            .map_err(|_| anyhow!("cgroup index lock poisoned"))?;
        index.refresh()?;
        *last_refresh = Some(Instant::now());
        Ok(())
    }

    fn with_index<T>(&self, f: impl FnOnce(&CgroupIndex) -> T) -> Result<T> {
        let index = self
            .index
            .lock()
            .map_err(|_| anyhow!("cgroup index lock poisoned"))?;
        Ok(f(&index))
    }

    /// Relative path of a cgroup, refreshing the index once on a miss.
    fn lookup(&self, cgroup_id: u64) -> Result<PathBuf> {
        let get = |index: &CgroupIndex| index.get(cgroup_id).map(Path::to_path_buf);
        if let Some(path) = self.with_index(get)? {
            return Ok(path);
        }
        self.refresh_if_due()?;
        self.with_index(get)?
            .ok_or_else(|| anyhow!("cgroup {cgroup_id} not found"))
    }

    fn absolute(&self, cgroup_id: u64) -> Result<PathBuf> {
        let relative = self.lookup(cgroup_id)?;
        self.with_index(|index| index.root().join(relative))
    }
}

impl WorkloadResolver for CgroupWorkloads {
    fn resolve(&self, cgroup_id: u64) -> Result<String> {
        let path = self.lookup(cgroup_id)?;
        Ok(classify_cgroup_path(&path).name)
    }

    fn resolve_namespace(&self, cgroup_id: u64) -> Result<String> {
        let path = self.lookup(cgroup_id)?;
        classify_cgroup_path(&path)
            .namespace
            .ok_or_else(|| anyhow!("cgroup {} carries no namespace", path.display()))
    }
}

impl IoStatReader for CgroupWorkloads {
    fn read_cgroup_io(&self, cgroup_id: u64) -> Result<IoStat> {
        read_io_stat(&self.absolute(cgroup_id)?)
    }

    fn read_host_io(&self) -> Result<IoStat> {
        read_host_diskstats(&self.proc_root)
    }
}

impl MemoryReader for CgroupWorkloads {
    fn read_memory(&self) -> Result<MemorySnapshot> {
        let device_memory = read_used_memory(&self.proc_root)? as f64;

        self.refresh_if_due()?;
        let index = self
            .index
            .lock()
            .map_err(|_| anyhow!("cgroup index lock poisoned"))?;

        // Shallowest cgroup of a workload holds the memory of all its children.
        let mut roots: HashMap<String, (usize, PathBuf)> = HashMap::new();
        for (_, relative) in index.iter() {
            let workload = classify_cgroup_path(relative);
            if workload.is_system() {
                continue;
            }
            let key = format!(
                "{}/{}",
                workload.namespace.as_deref().unwrap_or(UNKNOWN_NAMESPACE),
                workload.name
            );
            let depth = relative.components().count();
            match roots.get(&key) {
                Some((known, _)) if *known <= depth => {}
                _ => {
                    roots.insert(key, (depth, index.root().join(relative)));
                }
            }
        }
        drop(index);

        let mut per_workload = HashMap::with_capacity(roots.len());
        for (key, (_, path)) in roots {
            match read_cgroup_memory(&path) {
                Ok(bytes) => {
                    per_workload.insert(key, bytes as f64);
                }
                Err(e) => debug!("no memory usage for {key}: {e:#}"),
            }
        }

        if per_workload.is_empty() {
            warn!("no per-workload memory usage found");
        }

        Ok(MemorySnapshot {
            per_workload,
            device_memory,
        })
    }
}
