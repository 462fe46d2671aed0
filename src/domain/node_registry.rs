//! The persisted, shared view of every node.
//!
//! The registry file is the one mutable resource shared between the CLI and
//! detached job supervisors. Every mutation is a single transaction:
//!
//!   flock(nodes.yaml.lock) → read + verify → apply → write .tmp → rename
//!
//! so a reader either sees a whole group update or none of it.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, IoContext, Result};

use super::node::{Node, NodeStatus, NodeUpdate};

/// Registry contents wrapped with integrity metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredNodes {
    /// SHA-256 of the serialized node list: "sha256:<hex>"
    checksum: String,
    updated_at: DateTime<Utc>,
    nodes: Vec<Node>,
}

impl StoredNodes {
    fn new(nodes: Vec<Node>) -> Self {
        Self {
            checksum: checksum(&nodes),
            updated_at: Utc::now(),
            nodes,
        }
    }

    fn verify(&self) -> bool {
        self.checksum == checksum(&self.nodes)
    }
}

fn checksum(nodes: &[Node]) -> String {
    let serialized = serde_json::to_string(nodes).unwrap_or_default();
    format!("sha256:{:x}", Sha256::digest(serialized.as_bytes()))
}

pub struct NodeRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl NodeRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn find(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.read()?.remove(name))
    }

    /// Nodes matching `filter`, ordered by name.
    pub fn all(&self, filter: impl Fn(&Node) -> bool) -> Result<Vec<Node>> {
        Ok(self.read()?.into_values().filter(|n| filter(n)).collect())
    }

    /// Insert or replace a node record.
    pub fn insert(&self, node: Node) -> Result<()> {
        self.transaction(|nodes| {
            nodes.insert(node.name.clone(), node);
        })
    }

    /// Returns false when no such node exists.
    pub fn update(&self, name: &str, update: &NodeUpdate) -> Result<bool> {
        self.transaction(|nodes| match nodes.get_mut(name) {
            Some(node) => {
                node.apply(update);
                true
            }
            None => false,
        })
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        self.transaction(|nodes| nodes.remove(name).is_some())
    }

    pub fn is_busy(node: &Node) -> bool {
        node.is_busy()
    }

    /// Run `apply` against the current contents under the registry lock and
    /// persist the result atomically.
    pub fn transaction<R>(&self, apply: impl FnOnce(&mut BTreeMap<String, Node>) -> R) -> Result<R> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _flock = FileLock::exclusive(&self.lock_path())?;

        let mut nodes = self.read()?;
        let result = apply(&mut nodes);
        self.write(nodes.into_values().collect())?;
        Ok(result)
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("yaml.lock")
    }

    fn read(&self) -> Result<BTreeMap<String, Node>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no node registry yet");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(e).with_path("reading", &self.path),
        };

        let stored: StoredNodes = serde_yaml::from_str(&content)?;
        if !stored.verify() {
            warn!(path = %self.path.display(), "node registry checksum mismatch");
            return Err(Error::ChecksumMismatch(self.path.clone()));
        }
        Ok(stored
            .nodes
            .into_iter()
            .map(|n| (n.name.clone(), n))
            .collect())
    }

    fn write(&self, nodes: Vec<Node>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_path("creating directory", parent)?;
        }

        let content = serde_yaml::to_string(&StoredNodes::new(nodes))?;
        let tmp_path = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, content).with_path("writing temp file", &tmp_path)?;
        std::fs::rename(&tmp_path, &self.path).with_path("renaming temp file to", &self.path)?;
        Ok(())
    }
}

/// The nodes of one partition, updated or deleted as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroup {
    names: Vec<String>,
}

impl NodeGroup {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Apply the same update to every member in one transaction. Members
    /// missing from the registry are skipped; returns how many were updated.
    pub fn update_all(&self, registry: &NodeRegistry, update: &NodeUpdate) -> Result<usize> {
        registry.transaction(|nodes| {
            let mut updated = 0;
            for name in &self.names {
                if let Some(node) = nodes.get_mut(name) {
                    node.apply(update);
                    updated += 1;
                }
            }
            updated
        })
    }

    /// Finish the members still owned by `owner` in one transaction: apply
    /// `update`, then drop them when `delete` is set. A member is owned when
    /// its `deployment_pid` is `owner`, or when it is in progress with no pid
    /// claimed yet. Returns the names that were released.
    pub fn release(
        &self,
        registry: &NodeRegistry,
        owner: u32,
        update: &NodeUpdate,
        delete: bool,
    ) -> Result<Vec<String>> {
        registry.transaction(|nodes| {
            let mut released = Vec::new();
            for name in &self.names {
                let Some(node) = nodes.get_mut(name) else {
                    continue;
                };
                let owned = match node.deployment_pid {
                    Some(pid) => pid == owner,
                    None => node.status == NodeStatus::InProgress,
                };
                if !owned {
                    continue;
                }
                node.apply(update);
                if delete {
                    nodes.remove(name);
                }
                released.push(name.clone());
            }
            released
        })
    }

    pub fn delete_all(&self, registry: &NodeRegistry) -> Result<usize> {
        registry.transaction(|nodes| {
            self.names
                .iter()
                .filter(|name| nodes.remove(*name).is_some())
                .count()
        })
    }
}

/// Exclusive advisory lock held for the lifetime of the value.
struct FileLock {
    file: File,
}

impl FileLock {
    fn exclusive(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_path("creating directory", parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_path("opening lock file", path)?;

        // SAFETY: the descriptor is owned by `file` and outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).with_path("locking", path);
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: as above; closing the file would also release the lock.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
