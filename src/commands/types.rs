use anyhow::{bail, Result};
use colored::Colorize;

use super::Context;

pub fn run(ctx: &Context) -> Result<()> {
    if ctx.types.all().is_empty() {
        bail!(
            "No cluster types found in {}",
            ctx.settings
                .type_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let selected = ctx.selected_id()?;
    println!("{}", "Cluster types".bold());
    println!();
    for t in ctx.types.all() {
        let state = if t.is_prepared() {
            "prepared".green()
        } else {
            "not prepared".yellow()
        };
        let marker = if selected.as_deref() == Some(t.id.as_str()) {
            "*".bold()
        } else {
            " ".normal()
        };
        println!("{} {} ({}) [{}]", marker, t.name.bold(), t.id.dimmed(), state);
        if !t.description.is_empty() {
            println!("    {}", t.description);
        }
    }
    println!();
    Ok(())
}
