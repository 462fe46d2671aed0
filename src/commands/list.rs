use anyhow::{bail, Result};
use colored::Colorize;

use stoke::domain::node::NodeStatus;

use super::Context;

pub fn run(ctx: &Context) -> Result<()> {
    let nodes = ctx.registry.all(|_| true)?;
    if nodes.is_empty() {
        bail!("No nodes to display");
    }

    let name_width = nodes.iter().map(|n| n.name.len()).max().unwrap_or(0).max(4);
    let identity_width = nodes
        .iter()
        .map(|n| n.identity.as_deref().unwrap_or("-").len())
        .max()
        .unwrap_or(0)
        .max(8);

    let header = format!("{:<name_width$}  {:<identity_width$}  Status", "Node", "Identity");
    println!("{}", header.bold());
    for node in &nodes {
        let status = match node.status {
            NodeStatus::Complete => node.status.as_str().green(),
            NodeStatus::Failed => node.status.as_str().red(),
            NodeStatus::InProgress => node.status.as_str().yellow(),
            NodeStatus::Idle => node.status.as_str().normal(),
        };
        println!(
            "{:<name_width$}  {:<identity_width$}  {}",
            node.name,
            node.identity.as_deref().unwrap_or("-"),
            status
        );
    }
    Ok(())
}
