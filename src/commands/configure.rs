//! `stoke configure`: select a cluster type and answer its questions.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use colored::Colorize;
use dialoguer::Select;

use stoke::domain::answer_tree::{answers_from_json, AnswerTree};
use stoke::domain::cluster_type::ClusterType;
use stoke::domain::prefill::{PrefillMap, PrefillResolver};
use stoke::prompt::TerminalPrompter;
use stoke::store::{self, Answers};

use super::Context;

pub struct Options {
    pub answers: Option<String>,
    pub accept_defaults: bool,
    pub reset_type: bool,
    pub show: bool,
}

pub fn run(ctx: &Context, options: Options) -> Result<()> {
    if options.show {
        return show(ctx);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let (cluster_type, answers) = match &options.answers {
        Some(json) => {
            let mut supplied = answers_from_json(json)?;
            let requested = supplied.remove("cluster_type");
            let selected = if options.reset_type {
                None
            } else {
                ctx.selected_id()?
            };
            let cluster_type = ctx
                .types
                .find([requested.as_deref(), selected.as_deref()])
                .ok_or_else(|| anyhow!("No valid cluster type given to configure"))?;

            let tree = AnswerTree::new(&cluster_type.questions);
            if options.accept_defaults {
                let prefills = prefill(ctx, &runtime, cluster_type)?;
                tree.fill_defaults(&mut supplied, &prefills.snapshot());
            }
            (cluster_type, tree.resolve_supplied(supplied)?)
        }
        None => {
            let cluster_type = choose_type(ctx, options.reset_type)?;
            let answers = ask(ctx, &runtime, cluster_type)?;
            (cluster_type, answers)
        }
    };

    ctx.answers.save(&cluster_type.id, &answers)?;
    store::select_type(&ctx.settings.selection_file(), &cluster_type.id)?;
    println!(
        "{} Saved configuration for {}",
        "ok".green().bold(),
        cluster_type.name.bold()
    );
    if !cluster_type.is_prepared() {
        println!(
            "{} Run `stoke prepare {}` before deploying",
            "::".blue().bold(),
            cluster_type.id
        );
    }
    Ok(())
}

fn show(ctx: &Context) -> Result<()> {
    let cluster_type = ctx.selected_type()?;
    let saved = ctx.answers.load(&cluster_type.id)?;
    println!("Cluster type: {}", cluster_type.name.bold());
    for (text, value) in AnswerTree::new(&cluster_type.questions).summary(&saved) {
        println!("{} {}", text, value.as_deref().unwrap_or("none"));
    }
    Ok(())
}

fn choose_type(ctx: &Context, reset: bool) -> Result<&ClusterType> {
    if !reset {
        if let Some(id) = ctx.selected_id()? {
            return Ok(ctx.types.require(&id)?);
        }
    }
    if ctx.types.all().is_empty() {
        bail!("No cluster types available to configure");
    }
    let names: Vec<&str> = ctx.types.all().iter().map(|t| t.name.as_str()).collect();
    let index = Select::new()
        .with_prompt("Cluster type")
        .items(&names)
        .default(0)
        .interact()?;
    Ok(&ctx.types.all()[index])
}

/// Compute every question's prefill, waiting for all probes to settle.
fn prefill(
    ctx: &Context,
    runtime: &tokio::runtime::Runtime,
    cluster_type: &ClusterType,
) -> Result<Arc<PrefillMap>> {
    let saved = ctx.answers.load(&cluster_type.id)?;
    let map = PrefillMap::new();
    let resolver = PrefillResolver::new(saved, ctx.settings.probe_timeout());
    runtime.block_on(resolver.resolve(&cluster_type.questions, map.clone()));
    Ok(map)
}

/// Prompt for every reachable question while prefills resolve in the
/// background; each prompt waits only for its own prefill.
fn ask(
    ctx: &Context,
    runtime: &tokio::runtime::Runtime,
    cluster_type: &ClusterType,
) -> Result<Answers> {
    let saved = ctx.answers.load(&cluster_type.id)?;
    let map = PrefillMap::new();
    let resolver = PrefillResolver::new(saved, ctx.settings.probe_timeout());

    let questions = cluster_type.questions.clone();
    let probing = {
        let questions = questions.clone();
        let map = map.clone();
        runtime.spawn(async move { resolver.resolve(&questions, map).await })
    };

    let answers = runtime.block_on(runtime.spawn_blocking(move || {
        AnswerTree::new(&questions).resolve_interactive(&TerminalPrompter, &map)
    }))??;

    probing.abort();
    Ok(answers)
}
