mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// stackrun CLI -- execute a plan of agent-driven code-modification tasks
/// into a stack of reviewable branches.
#[derive(Parser)]
#[command(name = "sr", version, about)]
struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. "sr_engine=debug".
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a plan file without executing anything.
    Validate {
        /// Path to the plan YAML.
        plan: PathBuf,
        /// Promote structural warnings to errors.
        #[arg(short = 'S', long)]
        strict: bool,
        /// Output JSON.
        #[arg(short, long)]
        json: bool,
    },

    /// Execute a plan against a repository.
    Run {
        /// Path to the plan YAML.
        plan: PathBuf,
        /// Repository root to operate on.
        #[arg(short = 'C', long, default_value = ".")]
        repo: PathBuf,
        /// VCS mode: merge-commit, worktree, git-spice, graphite, sapling
        /// (aliases: simple, stacked). Defaults to git-spice with fallback.
        #[arg(short, long)]
        mode: Option<String>,
        /// Keep executing unrelated tasks after a failure.
        #[arg(long)]
        continue_on_error: bool,
        /// Per-task retry budget (overrides config).
        #[arg(long)]
        max_retries: Option<u32>,
        /// Agent CLI to invoke (overrides config).
        #[arg(short, long)]
        agent: Option<String>,
        /// Base reference task branches fork from (default: HEAD).
        #[arg(short, long)]
        parent_ref: Option<String>,
        /// Report file-scope violations as warnings instead of failing.
        #[arg(long)]
        permissive: bool,
        /// Validate and print the layer plan without invoking agents.
        #[arg(short = 'n', long)]
        dry_run: bool,
        /// Output JSON.
        #[arg(short, long)]
        json: bool,
    },

    /// Check which VCS backend tools are installed.
    Doctor {
        /// Exit non-zero if any backend is missing.
        #[arg(short = 'S', long)]
        strict: bool,
        /// Output JSON.
        #[arg(short, long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = cli
        .log
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { plan, strict, json } => commands::validate::run(&plan, strict, json),
        Commands::Run {
            plan,
            repo,
            mode,
            continue_on_error,
            max_retries,
            agent,
            parent_ref,
            permissive,
            dry_run,
            json,
        } => {
            commands::run::run(commands::run::RunArgs {
                plan,
                repo,
                mode,
                continue_on_error,
                max_retries,
                agent,
                parent_ref,
                permissive,
                dry_run,
                json,
            })
            .await
        }
        Commands::Doctor { strict, json } => commands::doctor::run(strict, json).await,
    }
}
