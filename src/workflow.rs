//! Top-level run orchestration: wire the target, agent, lock, and session
//! together, drive the controller, and turn the outcome into a report and an
//! exit code.

use crate::agent::{resolve_agent_command, Agent, DryRunAgent, SupervisedAgent};
use crate::cli::{RunArgs, UnlockArgs};
use crate::engine::{self, LoopOutcome};
use crate::lock::{process_alive, FsLock, LockError, LockGuard};
use crate::session::{RunReport, Session, SessionLimits};
use crate::supervise;
use crate::target::FileSet;
use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const EXIT_DONE: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = 130;

/// Run the loop to completion and return the process exit code.
pub fn run_run(args: RunArgs) -> Result<i32> {
    let target = FileSet::new(args.files.clone())?;
    let identity = target.identity()?;
    let state_dir = resolve_state_dir(args.state_dir.clone())?;

    let limits = SessionLimits {
        max_iterations: args.max_iterations,
        passes_required: args.passes_required,
        retries: args.retries,
        timeout: Duration::from_secs(args.timeout_secs),
        stall_threshold: Duration::from_secs(args.stall_secs),
        max_fix_lines: args.max_fix_lines,
    };

    // Resolve the agent before taking the lock: a typo in --agent should not
    // leave a lock to clean up.
    let mut agent: Box<dyn Agent> = if args.dry_run {
        Box::new(DryRunAgent)
    } else {
        let command = resolve_agent_command(args.agent.as_deref())?;
        Box::new(SupervisedAgent::new(command, limits.supervise(), limits.retries))
    };

    supervise::install_interrupt_handler();

    let lock = FsLock::new(state_dir.join("locks"));
    let guard = LockGuard::new(&lock, &identity).map_err(|err| match err {
        LockError::AlreadyRunning { pid } => anyhow!(
            "another session owns this target (pid {pid}); use `fixpoint unlock` if it is dead"
        ),
        LockError::Io(err) => err,
    })?;

    let mut session = Session::create(&identity, limits, &state_dir)?;
    tracing::info!(
        identity = %identity,
        files = args.files.len(),
        dry_run = args.dry_run,
        "session started"
    );

    let outcome = engine::run(agent.as_mut(), &target, &mut session)?;
    let report = finish(&outcome, &session)?;
    guard.release()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report).context("serialize report")?);
    } else {
        print_human(&report);
    }

    Ok(match outcome {
        LoopOutcome::Converged => EXIT_DONE,
        LoopOutcome::Aborted { .. } => EXIT_FAILED,
        LoopOutcome::Interrupted => EXIT_INTERRUPTED,
    })
}

/// Remove the lock for a target whose owning process has died.
pub fn run_unlock(args: UnlockArgs) -> Result<()> {
    let target = FileSet::new(args.files)?;
    let identity = target.identity()?;
    let state_dir = resolve_state_dir(args.state_dir)?;
    let lock = FsLock::new(state_dir.join("locks"));

    match lock.owner(&identity) {
        Ok(None) => {
            println!("no lock held for this target");
            Ok(())
        }
        Ok(Some(owner)) if process_alive(owner.pid) => {
            bail!("lock owner (pid {}) is still alive; refusing to unlock", owner.pid)
        }
        Ok(Some(owner)) => {
            lock.force_release(&identity)?;
            println!("removed lock left by dead pid {}", owner.pid);
            Ok(())
        }
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "lock file unreadable");
            lock.force_release(&identity)?;
            println!("removed unreadable lock");
            Ok(())
        }
    }
}

fn resolve_state_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    let base = dirs::data_local_dir()
        .ok_or_else(|| anyhow!("no local data directory on this system"))?;
    Ok(base.join("fixpoint"))
}

/// Build the run report. Transcripts are purged on convergence and kept for
/// every other outcome.
fn finish(outcome: &LoopOutcome, session: &Session) -> Result<RunReport> {
    let elapsed_secs = session.elapsed().as_secs_f64();
    let report = match outcome {
        LoopOutcome::Converged => {
            session.purge_logs()?;
            RunReport {
                outcome: "done",
                reason: None,
                iterations: session.iteration,
                passes: session.passes,
                elapsed_secs,
                log_dir: None,
            }
        }
        LoopOutcome::Aborted { reason } => RunReport {
            outcome: "failed",
            reason: Some(format!("{reason} (iteration {})", session.iteration)),
            iterations: session.iteration,
            passes: session.passes,
            elapsed_secs,
            log_dir: Some(session.log_dir().display().to_string()),
        },
        LoopOutcome::Interrupted => RunReport {
            outcome: "interrupted",
            reason: None,
            iterations: session.iteration,
            passes: session.passes,
            elapsed_secs,
            log_dir: Some(session.log_dir().display().to_string()),
        },
    };
    Ok(report)
}

fn print_human(report: &RunReport) {
    match report.outcome {
        "done" => println!(
            "converged after {} iteration(s) ({} consecutive clean checks) in {:.1}s",
            report.iterations, report.passes, report.elapsed_secs
        ),
        "interrupted" => println!(
            "interrupted at iteration {} after {:.1}s",
            report.iterations, report.elapsed_secs
        ),
        _ => {
            println!(
                "failed: {}",
                report.reason.as_deref().unwrap_or("unknown reason")
            );
            if let Some(log_dir) = &report.log_dir {
                println!("transcripts kept in {log_dir}");
            }
        }
    }
}
