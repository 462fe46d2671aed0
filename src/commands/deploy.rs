//! `stoke apply` / `stoke remove`: run identity jobs against nodes.

use anyhow::Result;
use colored::Colorize;

use stoke::domain::orchestrator::{Action, DeployRequest, JobOrchestrator, Outcome};

use super::Context;

pub fn apply(ctx: &Context, identity: String, hosts: String, wait: bool, force: bool) -> Result<()> {
    let request = DeployRequest {
        action: Action::Apply { identity },
        targets: hosts,
        wait,
        force,
        remove_hunter_entry: false,
    };
    run(ctx, &request)
}

pub fn remove(
    ctx: &Context,
    hosts: String,
    wait: bool,
    force: bool,
    remove_hunter_entry: bool,
) -> Result<()> {
    let request = DeployRequest {
        action: Action::Remove,
        targets: hosts,
        wait,
        force,
        remove_hunter_entry,
    };
    run(ctx, &request)
}

fn run(ctx: &Context, request: &DeployRequest) -> Result<()> {
    let cluster_type = ctx.selected_type()?;
    let answers = ctx.answers.load(&cluster_type.id)?;
    let orchestrator = JobOrchestrator::new(ctx.settings.clone(), ctx.registry.clone());

    let summary = match &request.action {
        Action::Apply { identity } => format!("Applying {} to {}", identity.bold(), request.targets),
        Action::Remove => format!("Removing {}", request.targets),
    };
    println!("{} {}", ">>".blue().bold(), summary);

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(orchestrator.deploy(cluster_type, &answers, request))?;
    report(&outcome, request.wait);
    Ok(())
}

fn report(outcome: &Outcome, waited: bool) {
    for partition in &outcome.partitions {
        let nodes = partition.nodes.join(", ");
        match partition.exit_code {
            Some(0) => println!(
                "{} {} ({}) finished",
                "ok".green().bold(),
                nodes,
                partition.identity
            ),
            Some(code) => println!(
                "{} {} ({}) failed with exit code {}",
                "!!".red().bold(),
                nodes,
                partition.identity,
                code
            ),
            None => println!(
                "{} {} ({}) running as pid {}",
                "::".blue().bold(),
                nodes,
                partition.identity,
                partition.pid.map_or_else(|| "?".to_string(), |pid| pid.to_string())
            ),
        }
    }
    if !waited {
        println!(
            "{} The {} process has begun. Refer to `stoke list` or `stoke view` for more details",
            "::".blue().bold(),
            outcome.action
        );
    }
}
