//! Refuses work against busy nodes, or with force, signals
//! whatever job currently owns them and lets the new work through.

use std::collections::BTreeSet;
use std::sync::Arc;

use colored::Colorize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::process;

use super::node::Node;

/// Delivers the termination signal to a job's process.
pub trait Signaller: Send + Sync {
    fn terminate(&self, pid: u32) -> std::io::Result<()>;
}

/// SIGHUP via kill(2).
#[derive(Debug, Default)]
pub struct HangupSignaller;

impl Signaller for HangupSignaller {
    fn terminate(&self, pid: u32) -> std::io::Result<()> {
        process::send_hangup(pid)
    }
}

#[derive(Clone)]
pub struct RecoveryGuard {
    signaller: Arc<dyn Signaller>,
}

impl Default for RecoveryGuard {
    fn default() -> Self {
        Self::new(Arc::new(HangupSignaller))
    }
}

impl RecoveryGuard {
    pub fn new(signaller: Arc<dyn Signaller>) -> Self {
        Self { signaller }
    }

    /// Check `nodes` before dispatch. Without `force` any busy node fails the
    /// request; with it, each distinct recorded pid is signalled once and the
    /// returned pids are those that were signalled.
    pub fn check(&self, nodes: &[Node], force: bool) -> Result<Vec<u32>> {
        let busy: Vec<&Node> = nodes.iter().filter(|n| n.is_busy()).collect();
        if busy.is_empty() {
            return Ok(Vec::new());
        }

        let names: Vec<String> = busy.iter().map(|n| n.name.clone()).collect();
        let conflict = Error::Busy(names.clone());
        if !force {
            return Err(conflict);
        }

        eprintln!("{} {}\nContinuing...", "!!".yellow().bold(), conflict);
        warn!(nodes = %names.join(","), "forcing through busy nodes");

        let pids: BTreeSet<u32> = busy.iter().filter_map(|n| n.deployment_pid).collect();
        for pid in &pids {
            if let Err(e) = self.signaller.terminate(*pid) {
                warn!(pid, error = %e, "failed to signal job process");
            }
        }
        Ok(pids.into_iter().collect())
    }
}
