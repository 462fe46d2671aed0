//! Inventory files and the hunter node-tracking service.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Error, IoContext, Result};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-cluster inventory files handed to jobs as `INVFILE`.
#[derive(Debug, Clone)]
pub struct Inventory {
    dir: PathBuf,
}

impl Inventory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the cluster's inventory, created empty if it does not exist.
    pub fn load(&self, cluster_name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).with_path("creating", &self.dir)?;
        let path = self.dir.join(format!("{cluster_name}.yaml"));
        if !path.exists() {
            std::fs::write(&path, "").with_path("creating inventory", &path)?;
        }
        Ok(path)
    }
}

/// Removes nodes from hunter once they have been torn down.
pub trait HunterNotifier: Send + Sync {
    /// `names` is a comma-joined list of node names.
    fn remove_nodes<'a>(&'a self, names: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Runs `<command> remove-node <names>`.
#[derive(Debug, Clone)]
pub struct HunterCli {
    command: PathBuf,
}

impl HunterCli {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &Path {
        &self.command
    }
}

impl HunterNotifier for HunterCli {
    fn remove_nodes<'a>(&'a self, names: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let output = Command::new(&self.command)
                .args(["remove-node", names])
                .output()
                .await
                .with_path("running", &self.command)?;
            if output.status.success() {
                info!(nodes = names, "removed hunter entries");
                Ok(())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(nodes = names, stderr = %stderr.trim(), "hunter removal failed");
                Err(Error::io(
                    format!("{} remove-node {names}", self.command.display()),
                    std::io::Error::other(format!("exited with {}", output.status)),
                ))
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records every removal instead of calling hunter.
    #[derive(Default)]
    pub(crate) struct RecordingHunter {
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl HunterNotifier for RecordingHunter {
        fn remove_nodes<'a>(&'a self, names: &'a str) -> BoxFuture<'a, Result<()>> {
            self.calls.lock().unwrap().push(names.to_string());
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn inventory_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Inventory::new(dir.path().join("inv"));
        let path = inventory.load("c1").unwrap();
        assert!(path.ends_with("inv/c1.yaml"));
        std::fs::write(&path, "hosts: [n1]\n").unwrap();
        inventory.load("c1").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hosts: [n1]\n");
    }

    #[tokio::test]
    async fn hunter_cli_passes_names() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("called");
        let script = crate::test_support::script(
            dir.path(),
            "hunter",
            &format!("echo \"$1 $2\" > {}", out.display()),
        );
        HunterCli::new(&script).remove_nodes("n1,n2").await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "remove-node n1,n2");

        let failing = crate::test_support::script(dir.path(), "broken", "exit 1");
        assert!(HunterCli::new(&failing).remove_nodes("n1").await.is_err());
    }
}
