//! Access to the kernel counter table.
//!
//! The kernel-side probe accumulates one record per process into a BPF hash
//! map. Every cycle the collector reads all entries and then deletes them, so
//! the next cycle only sees what happened since. There are no partial drains
//! and no cursor is kept across cycles.
//!
//! Two implementations are provided:
//!
//! - [`InMemoryCounterTable`] keeps encoded records in memory. It is used in
//!   tests and when the daemon is built without eBPF support.
//! - `PinnedMapTable` (feature `ebpf`) opens a map pinned in bpffs with
//!   `libbpf-rs`.

use anyhow::Result;
use std::collections::BTreeMap;

use crate::metrics::raw_sample::RawProcessSample;

/// A drainable key → fixed-layout value table.
pub trait CounterTable: Send {
    /// Returns the raw values of every entry currently in the table. A failed
    /// read must leave the table untouched.
    fn entries(&mut self) -> Result<Vec<Vec<u8>>>;

    /// Deletes every entry.
    fn clear(&mut self) -> Result<()>;
}

/// Counter table held in memory, keyed by pid.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCounterTable {
    entries: BTreeMap<u64, Vec<u8>>,
}

impl InMemoryCounterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an encoded sample, replacing any previous entry for its pid.
    pub fn insert_sample(&mut self, sample: &RawProcessSample) {
        self.entries.insert(sample.pid, sample.encode());
    }

    /// Stores an arbitrary raw value.
    pub fn insert_raw(&mut self, key: u64, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CounterTable for InMemoryCounterTable {
    fn entries(&mut self) -> Result<Vec<Vec<u8>>> {
        Ok(self.entries.values().cloned().collect())
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(feature = "ebpf")]
pub use pinned::PinnedMapTable;

#[cfg(feature = "ebpf")]
mod pinned {
    use super::CounterTable;
    use anyhow::{Context, Result};
    use libbpf_rs::{MapCore, MapFlags, MapHandle};
    use std::path::{Path, PathBuf};
    use tracing::warn;

    /// BPF hash map pinned in bpffs by the loader of the probe.
    pub struct PinnedMapTable {
        path: PathBuf,
        map: MapHandle,
    }

    impl PinnedMapTable {
        pub fn open(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref().to_path_buf();
            let map = MapHandle::from_pinned_path(&path)
                .with_context(|| format!("failed to open pinned BPF map {}", path.display()))?;
            Ok(Self { path, map })
        }
    }

    impl CounterTable for PinnedMapTable {
        fn entries(&mut self) -> Result<Vec<Vec<u8>>> {
            let mut values = Vec::new();
            for key in self.map.keys() {
                // The entry may be removed by the kernel between keys() and lookup().
                let value = self
                    .map
                    .lookup(&key, MapFlags::ANY)
                    .with_context(|| format!("failed to look up key in {}", self.path.display()))?;
                if let Some(value) = value {
                    values.push(value);
                }
            }
            Ok(values)
        }

        fn clear(&mut self) -> Result<()> {
            let keys: Vec<Vec<u8>> = self.map.keys().collect();
            for key in keys {
                if let Err(e) = self.map.delete(&key) {
                    warn!("failed to delete key from {}: {}", self.path.display(), e);
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_then_clear_drains_table() {
        let mut table = InMemoryCounterTable::new();
        table.insert_sample(&RawProcessSample {
            pid: 1,
            ..Default::default()
        });
        table.insert_sample(&RawProcessSample {
            pid: 2,
            ..Default::default()
        });

        assert_eq!(table.entries().expect("entries").len(), 2);
        table.clear().expect("clear");
        assert!(table.is_empty());
        assert!(table.entries().expect("entries").is_empty());
    }

    #[test]
    fn insert_sample_replaces_entry_for_same_pid() {
        let mut table = InMemoryCounterTable::new();
        table.insert_sample(&RawProcessSample {
            pid: 7,
            cpu_cycles: 1,
            ..Default::default()
        });
        table.insert_sample(&RawProcessSample {
            pid: 7,
            cpu_cycles: 2,
            ..Default::default()
        });

        let entries = table.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        let decoded = RawProcessSample::decode(&entries[0]).expect("decode");
        assert_eq!(decoded.cpu_cycles, 2);
    }
}
