//! `stoke supervise <spec>`: owns one detached job until it exits.

use std::path::Path;

use anyhow::{Context as _, Result};
use tracing::{error, warn};

use stoke::domain::orchestrator::{self, JobSpec};

pub fn run(spec_path: &Path) -> Result<()> {
    let spec = JobSpec::load(spec_path)?;
    stoke::logging::init_supervisor(&spec.log_level, &spec.log_dir)?;

    let runtime = tokio::runtime::Runtime::new().context("building runtime")?;
    let result = runtime.block_on(orchestrator::supervise(&spec));

    if let Err(e) = std::fs::remove_file(spec_path) {
        warn!(path = %spec_path.display(), error = %e, "failed to remove job spec");
    }
    if let Err(e) = &result {
        error!(action = %spec.action, nodes = %spec.nodes.join(","), error = %e, "supervised job failed");
    }
    result?;
    Ok(())
}
