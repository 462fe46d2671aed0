//! `stoke prepare <type>`: one-time preparation of a cluster type.

use anyhow::{bail, Result};
use colored::Colorize;

use super::Context;

pub fn run(ctx: &Context, type_key: &str) -> Result<()> {
    let mut cluster_type = ctx.types.require(type_key)?.clone();
    println!(
        "{} Preparing {} ({})",
        ">>".blue().bold(),
        cluster_type.name.bold(),
        cluster_type.id
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(cluster_type.prepare(&ctx.settings.log_dir))?;

    if outcome.exit_code != 0 {
        bail!(
            "Preparation of {} failed with exit code {}; see {}",
            cluster_type.name,
            outcome.exit_code,
            outcome.log.display()
        );
    }
    println!("{} {} is prepared", "ok".green().bold(), cluster_type.name);
    Ok(())
}
