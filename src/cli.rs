//! Command-line surface.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Convergence-driven review/repair loop around an external code agent.
#[derive(Debug, Parser)]
#[command(
    name = "fixpoint",
    version,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the review/repair loop over a set of files until it converges.
    Run(RunArgs),
    /// Remove a stale session lock left behind by a dead process.
    Unlock(UnlockArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// File under review; repeat for multiple files.
    #[arg(long = "file", value_name = "PATH", required = true)]
    pub files: Vec<PathBuf>,

    /// Agent command line (falls back to FIXPOINT_AGENT).
    #[arg(long, value_name = "CMD")]
    pub agent: Option<String>,

    /// Iteration budget before the run is declared non-converging.
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub max_iterations: u32,

    /// Consecutive clean checks required to declare convergence.
    #[arg(long, value_name = "N", default_value_t = 2)]
    pub passes_required: u32,

    /// Retries per agent invocation on transient failure.
    #[arg(long, value_name = "N", default_value_t = 2)]
    pub retries: u32,

    /// Hard wall-clock limit per agent invocation, in seconds.
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    pub timeout_secs: u64,

    /// Warn when the agent produces no output for this long, in seconds.
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub stall_secs: u64,

    /// Ceiling on lines touched by a single fix.
    #[arg(long, value_name = "N", default_value_t = 400)]
    pub max_fix_lines: usize,

    /// Exercise the loop wiring without invoking any agent.
    #[arg(long)]
    pub dry_run: bool,

    /// Override the state directory (locks and session transcripts).
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Emit the final report as JSON on stdout.
    #[arg(long)]
    pub json: bool,

    /// Verbose logging (same as RUST_LOG=fixpoint=debug).
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug, Args)]
pub struct UnlockArgs {
    /// File the stuck session was reviewing; repeat for multiple files.
    #[arg(long = "file", value_name = "PATH", required = true)]
    pub files: Vec<PathBuf>,

    /// Override the state directory (locks and session transcripts).
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,
}
