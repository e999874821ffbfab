//! # px-cli
//!
//! Command-line front end for Parallax. `run` validates a params file and
//! supervises one worker process per job; the hidden `worker` subcommand
//! is what those processes execute.
//!
//! Binaries that ship their own adapters build an [`AdapterRegistry`] and
//! call [`run_main`].

pub mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use px_optimizer::{
    prepare, run_study, run_worker_spec, AdapterOverrides, AdapterRegistry, ProcessLauncher,
    RunOptions, WorkerSpec, EXIT_PANIC,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "parallax", version, about = "Parallel hyperparameter search")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a study described by a params file
    Run(RunArgs),
    /// Worker process entry point
    #[command(hide = true)]
    Worker {
        /// JSON-encoded worker assignment
        #[arg(long)]
        spec: String,
    },
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Params file (JSON or YAML)
    #[arg(short, long)]
    pub params: PathBuf,

    /// Reuse meta.study_version even if that study already exists
    #[arg(short, long)]
    pub continue_study: bool,

    /// Override optimizer.n_trials
    #[arg(short, long)]
    pub trials: Option<i64>,

    /// Objective adapter name
    #[arg(long, alias = "adapter")]
    pub objective_adapter: Option<String>,

    /// Prune adapter name
    #[arg(long)]
    pub prune_adapter: Option<String>,

    /// Worker hook adapter name
    #[arg(long)]
    pub worker_adapter: Option<String>,

    /// Master hook adapter name
    #[arg(long)]
    pub master_adapter: Option<String>,
}

impl RunArgs {
    pub fn options(&self) -> RunOptions {
        RunOptions {
            params_path: self.params.clone(),
            continue_study: self.continue_study,
            n_trials: self.trials,
            adapters: AdapterOverrides {
                objective: self.objective_adapter.clone(),
                prune: self.prune_adapter.clone(),
                worker: self.worker_adapter.clone(),
                master: self.master_adapter.clone(),
            },
        }
    }
}

fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbose: u8) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter(verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Parse the command line and run it. Returns the process exit code.
pub async fn run_main(registry: AdapterRegistry) -> anyhow::Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Worker { spec } => {
            let spec: WorkerSpec =
                serde_json::from_str(&spec).context("invalid worker spec")?;
            match tokio::task::spawn_blocking(move || run_worker_spec(&spec, &registry)).await {
                Ok(code) => Ok(code),
                Err(e) => {
                    error!(error = %e, "worker panicked");
                    Ok(EXIT_PANIC)
                }
            }
        }
        Command::Run(args) => {
            let options = args.options();
            let prepared = prepare(&options, &registry)?;
            let launcher = ProcessLauncher::current_exe(
                options.params_path.clone(),
                prepared.adapters.clone(),
            )?
            .with_log_filter(log_filter(cli.verbose));
            let summary = run_study(prepared, &registry, Arc::new(launcher)).await?;
            info!(
                failed_workers = summary.workers.failed_workers,
                "run finished"
            );
            println!(
                "[DONE] best_value={:.6} -> {}",
                summary.best.best_value,
                summary.out_path.display()
            );
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "parallax",
            "run",
            "-p",
            "study.yaml",
            "-c",
            "-t",
            "8",
            "--adapter",
            "trace",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let options = args.options();
        assert_eq!(options.params_path, PathBuf::from("study.yaml"));
        assert!(options.continue_study);
        assert_eq!(options.n_trials, Some(8));
        assert_eq!(options.adapters.objective.as_deref(), Some("trace"));
        assert_eq!(options.adapters.prune, None);
    }

    #[test]
    fn parses_worker_spec() {
        let cli = Cli::try_parse_from(["parallax", "worker", "--spec", "{}"]).unwrap();
        assert!(matches!(cli.command, Command::Worker { ref spec } if spec == "{}"));
    }

    #[test]
    fn params_flag_is_required() {
        assert!(Cli::try_parse_from(["parallax", "run"]).is_err());
    }

    #[test]
    fn verbosity_maps_to_filter() {
        assert_eq!(log_filter(0), "info");
        assert_eq!(log_filter(1), "debug");
        assert_eq!(log_filter(5), "trace");
    }
}
