//! Cgroup v2 helpers: id → path index and workload naming.
//!
//! The kernel identifies a cgroup by the inode number of its directory in the
//! cgroup v2 hierarchy, which is what the probe records as `cgroup_id`.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Name of the synthetic workload that owns host processes and unattributed I/O.
pub const SYSTEM_WORKLOAD: &str = "system_processes";

/// Namespace of [`SYSTEM_WORKLOAD`] and of systemd services.
pub const SYSTEM_NAMESPACE: &str = "system";

/// Check whether `root` is a cgroup v2 mount.
pub fn is_cgroup_v2_available(root: &Path) -> bool {
    if root.join("cgroup.controllers").exists() {
        debug!("cgroups v2 is available at: {}", root.display());
        true
    } else {
        warn!("cgroups v2 not found at {}", root.display());
        false
    }
}

/// Inode number of a cgroup directory.
pub fn cgroup_id(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to stat cgroup {}", path.display()))?;
    Ok(metadata.ino())
}

/// Mapping from cgroup id to the cgroup path relative to the hierarchy root.
#[derive(Debug, Default)]
pub struct CgroupIndex {
    root: PathBuf,
    by_id: HashMap<u64, PathBuf>,
}

impl CgroupIndex {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            by_id: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rebuilds the index by walking the whole hierarchy.
    pub fn refresh(&mut self) -> Result<()> {
        let mut by_id = HashMap::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let id = match cgroup_id(&dir) {
                Ok(id) => id,
                // Cgroups disappear while we walk.
                Err(_) if dir != self.root => continue,
                Err(e) => return Err(e),
            };
            let relative = dir.strip_prefix(&self.root).unwrap_or(&dir).to_path_buf();
            by_id.insert(id, relative);

            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    stack.push(entry.path());
                }
            }
        }
        debug!("indexed {} cgroups under {}", by_id.len(), self.root.display());
        self.by_id = by_id;
        Ok(())
    }

    /// Relative path of a cgroup id.
    pub fn get(&self, id: u64) -> Option<&Path> {
        self.by_id.get(&id).map(PathBuf::as_path)
    }

    /// Absolute path of a cgroup id.
    pub fn absolute(&self, id: u64) -> Option<PathBuf> {
        self.get(id).map(|relative| self.root.join(relative))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Path)> {
        self.by_id.iter().map(|(&id, path)| (id, path.as_path()))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Workload derived from a cgroup path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupWorkload {
    pub name: String,
    /// `None` when the path does not carry a namespace (Kubernetes pods).
    pub namespace: Option<String>,
}

impl CgroupWorkload {
    fn system() -> Self {
        Self {
            name: SYSTEM_WORKLOAD.to_string(),
            namespace: Some(SYSTEM_NAMESPACE.to_string()),
        }
    }

    pub fn is_system(&self) -> bool {
        self.name == SYSTEM_WORKLOAD
    }
}

/// Derives the workload of a cgroup from its path relative to the root.
///
/// - `kubepods*/.../pod<uid>/...` or `...-pod<uid>.slice` → `pod-<uid>`
/// - `.../docker-<id>.scope` or `docker/<id>` → `docker-<id[..12]>`
/// - `system.slice/<unit>/...` → `<unit>`
/// - `user.slice/...` → `user.slice`
/// - everything else → [`SYSTEM_WORKLOAD`]
pub fn classify_cgroup_path(relative: &Path) -> CgroupWorkload {
    let segments: Vec<&str> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();

    if segments.first().is_some_and(|s| s.starts_with("kubepods")) {
        return segments
            .iter()
            .find_map(|s| pod_uid(s))
            .map(|uid| CgroupWorkload {
                name: format!("pod-{uid}"),
                namespace: None,
            })
            .unwrap_or_else(CgroupWorkload::system);
    }

    for (i, segment) in segments.iter().enumerate() {
        let docker_id = if let Some(id) = segment
            .strip_prefix("docker-")
            .and_then(|s| s.strip_suffix(".scope"))
        {
            Some(id)
        } else if *segment == "docker" {
            segments.get(i + 1).copied()
        } else {
            None
        };
        if let Some(id) = docker_id {
            return CgroupWorkload {
                name: format!("docker-{}", id.chars().take(12).collect::<String>()),
                namespace: Some("docker".to_string()),
            };
        }
    }

    match segments.as_slice() {
        ["system.slice", unit, ..] => CgroupWorkload {
            name: (*unit).to_string(),
            namespace: Some(SYSTEM_NAMESPACE.to_string()),
        },
        ["user.slice", ..] => CgroupWorkload {
            name: "user.slice".to_string(),
            namespace: Some("user".to_string()),
        },
        _ => CgroupWorkload::system(),
    }
}

/// `pod1234_ab` → `1234-ab`, `kubepods-besteffort-pod1234_ab.slice` → `1234-ab`.
fn pod_uid(segment: &str) -> Option<String> {
    let trimmed = segment.strip_suffix(".slice").unwrap_or(segment);
    let uid = match trimmed.rfind("-pod") {
        Some(pos) => &trimmed[pos + 4..],
        None => trimmed.strip_prefix("pod")?,
    };
    if uid.is_empty() {
        return None;
    }
    Some(uid.replace('_', "-"))
}
