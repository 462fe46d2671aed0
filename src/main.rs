mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::Context;

#[derive(Parser)]
#[command(name = "stoke", version, about = "Cluster node identity deployment")]
struct Cli {
    /// Path to config file (default: ~/.config/stoke/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Select a cluster type and answer its questions
    Configure {
        /// Answers as a JSON object instead of prompting
        #[arg(long)]
        answers: Option<String>,

        /// Fill unanswered questions with their defaults (with --answers)
        #[arg(long)]
        accept_defaults: bool,

        /// Choose the cluster type again instead of reusing the saved one
        #[arg(long)]
        reset_type: bool,

        /// Print the current configuration
        #[arg(long)]
        show: bool,
    },

    /// List available cluster types
    Types,

    /// Run a cluster type's one-time preparation
    Prepare {
        /// Cluster type name or id
        cluster_type: String,
    },

    /// Assign an identity to nodes and run its apply job
    Apply {
        /// Identity name
        identity: String,

        /// Hosts, e.g. `node[01-04],gpu1`
        hosts: String,

        /// Wait for the jobs to finish
        #[arg(long)]
        wait: bool,

        /// Signal any job already running on the nodes and continue
        #[arg(long)]
        force: bool,
    },

    /// Run the remove job for nodes and drop them on success
    Remove {
        /// Hosts, e.g. `node[01-04],gpu1`
        hosts: String,

        /// Wait for the jobs to finish
        #[arg(long)]
        wait: bool,

        /// Signal any job already running on the nodes and continue
        #[arg(long)]
        force: bool,

        /// Also remove the nodes from hunter
        #[arg(long)]
        remove_hunter_entry: bool,
    },

    /// List nodes with their identity and status
    List,

    /// Show the progress of a node's latest job
    View {
        /// Node name
        node: String,

        /// Print log sections without parsing
        #[arg(long)]
        raw: bool,
    },

    /// Own a detached job until it exits
    #[command(hide = true)]
    Supervise {
        /// Job spec written by `apply`/`remove`
        spec: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config;
    let context = || Context::load(config.as_deref());

    match cli.command {
        Commands::Configure {
            answers,
            accept_defaults,
            reset_type,
            show,
        } => commands::configure::run(
            &context()?,
            commands::configure::Options {
                answers,
                accept_defaults,
                reset_type,
                show,
            },
        ),
        Commands::Types => commands::types::run(&context()?),
        Commands::Prepare { cluster_type } => commands::prepare::run(&context()?, &cluster_type),
        Commands::Apply {
            identity,
            hosts,
            wait,
            force,
        } => commands::deploy::apply(&context()?, identity, hosts, wait, force),
        Commands::Remove {
            hosts,
            wait,
            force,
            remove_hunter_entry,
        } => commands::deploy::remove(&context()?, hosts, wait, force, remove_hunter_entry),
        Commands::List => commands::list::run(&context()?),
        Commands::View { node, raw } => commands::view::run(&context()?, &node, raw),
        Commands::Supervise { spec } => commands::supervise::run(&spec),
    }
}
