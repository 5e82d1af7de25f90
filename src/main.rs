//! fixpoint: drive an external code agent in a check/fix/verify loop until a
//! set of files reaches a stable, repeatedly-clean state.

mod agent;
mod cli;
mod engine;
mod fingerprint;
mod lock;
mod session;
mod supervise;
mod target;
mod util;
mod verdict;
mod workflow;

use anyhow::Result;
use clap::Parser;
use cli::{Command, RootArgs};

fn main() -> Result<()> {
    let args = RootArgs::parse();
    match args.command {
        Command::Run(run) => {
            init_tracing(run.verbose);
            let code = workflow::run_run(run)?;
            std::process::exit(code);
        }
        Command::Unlock(unlock) => {
            init_tracing(false);
            workflow::run_unlock(unlock)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if verbose {
            "fixpoint=debug"
        } else {
            "fixpoint=info"
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
