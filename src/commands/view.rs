//! `stoke view <node>`: progress of the node's most recent job.

use anyhow::{anyhow, Context as _, Result};

use stoke::domain::log_view;

use super::Context;

pub fn run(ctx: &Context, name: &str, raw: bool) -> Result<()> {
    let node = ctx
        .registry
        .find(name)?
        .ok_or_else(|| anyhow!("Node '{name}' not found"))?;

    let log_dir = &ctx.settings.log_dir;
    let path = log_view::latest_log(log_dir, &node.name)
        .with_context(|| format!("reading {}", log_dir.display()))?
        .ok_or_else(|| anyhow!("No logs found for node '{name}'"))?;
    let log = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;

    print!("{}", log_view::render(&log, node.status, raw));
    Ok(())
}
