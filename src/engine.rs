//! The convergence controller: the check/fix/verify state machine.
//!
//! Strictly sequential; every step's outcome gates the next. The controller
//! trusts nothing: a clean verdict only counts toward convergence when it
//! repeats, a fix only counts when the fingerprint actually moved, and every
//! movement is checked against the runaway ceiling and the oscillation
//! history before the loop continues.

use crate::agent::{self, Agent, CallKind};
use crate::fingerprint;
use crate::session::Session;
use crate::supervise::{self, CallError, Invocation};
use crate::target::{self, Target};
use crate::util::truncate_string;
use crate::verdict::{classify, Verdict};
use anyhow::Result;

/// Ceiling on agent-authored text quoted into abort reasons.
const REASON_BYTES: usize = 200;

/// Terminal outcome of the loop.
#[derive(Debug)]
pub enum LoopOutcome {
    /// The required number of consecutive clean checks was reached.
    Converged,
    /// A safety policy tripped or the agent failed; the reason is the short,
    /// specific string surfaced to the operator.
    Aborted { reason: String },
    /// The operator interrupted the run.
    Interrupted,
}

enum State {
    Check,
    Fix { report: String },
    Verify,
}

enum Flow {
    Next(State),
    Done,
}

/// Why the loop stopped before converging. `Env` carries environment errors
/// (target IO, transcript writes) that are not policy decisions.
enum Stop {
    Abort(String),
    Interrupted,
    Env(anyhow::Error),
}

impl From<anyhow::Error> for Stop {
    fn from(err: anyhow::Error) -> Self {
        Stop::Env(err)
    }
}

/// Drive the loop to a terminal state. The session must be freshly created;
/// the caller holds the session lock for the whole call.
pub fn run(
    agent: &mut dyn Agent,
    target: &dyn Target,
    session: &mut Session,
) -> Result<LoopOutcome> {
    let mut engine = Engine {
        agent,
        target,
        session,
        description: target.describe(),
    };
    match engine.drive() {
        Ok(()) => Ok(LoopOutcome::Converged),
        Err(Stop::Abort(reason)) => Ok(LoopOutcome::Aborted { reason }),
        Err(Stop::Interrupted) => Ok(LoopOutcome::Interrupted),
        Err(Stop::Env(err)) => Err(err),
    }
}

struct Engine<'a> {
    agent: &'a mut dyn Agent,
    target: &'a dyn Target,
    session: &'a mut Session,
    description: String,
}

impl Engine<'_> {
    fn drive(&mut self) -> Result<(), Stop> {
        let initial = self.target.snapshot()?;
        let first = fingerprint::fingerprint(&initial);
        tracing::info!(fingerprint = %first, "initial state recorded");
        self.session.record_fingerprint(first);

        let mut state = State::Check;
        loop {
            if supervise::interrupted() {
                return Err(Stop::Interrupted);
            }
            let flow = match state {
                State::Check => self.step_check()?,
                State::Fix { report } => self.step_fix(&report)?,
                State::Verify => self.step_verify()?,
            };
            match flow {
                Flow::Done => return Ok(()),
                Flow::Next(next) => state = next,
            }
        }
    }

    fn step_check(&mut self) -> Result<Flow, Stop> {
        tracing::info!(
            iteration = self.session.iteration,
            passes = self.session.passes,
            "check"
        );
        let prompt = agent::check_prompt(&self.description);
        let invocation = self.invoke(CallKind::Check, &prompt, "check")?;
        match classify(&invocation.output) {
            Verdict::Clean => self.note_pass(),
            Verdict::IssuesFound { report } => {
                tracing::info!(report_bytes = report.len(), "issues found");
                Ok(Flow::Next(State::Fix { report }))
            }
            Verdict::Blocked { reason } => Err(Stop::Abort(format!(
                "check blocked: {}",
                truncate_string(&reason, REASON_BYTES)
            ))),
            Verdict::Fixed { .. } | Verdict::Unparseable => {
                Err(Stop::Abort("check produced no usable verdict".to_string()))
            }
        }
    }

    fn step_fix(&mut self, report: &str) -> Result<Flow, Stop> {
        let before = self.target.snapshot()?;
        let before_digest = fingerprint::fingerprint(&before);

        let prompt = agent::fix_prompt(&self.description, report);
        let invocation = self.invoke(CallKind::Fix, &prompt, "fix")?;
        match classify(&invocation.output) {
            Verdict::Blocked { reason } => {
                // A blocked agent will not succeed on repetition.
                return Err(Stop::Abort(format!(
                    "fix blocked: {}",
                    truncate_string(&reason, REASON_BYTES)
                )));
            }
            Verdict::Fixed { summary } => {
                tracing::info!(summary = %summary, "agent reports fix applied");
            }
            // The fingerprint comparison below decides, not the agent's claim.
            _ => {}
        }

        let after = self.target.snapshot()?;
        let after_digest = fingerprint::fingerprint(&after);
        if after_digest == before_digest {
            tracing::info!("fix made no changes; re-verifying the original finding");
            return Ok(Flow::Next(State::Verify));
        }

        let touched = target::change_magnitude(&before, &after);
        if touched > self.session.limits.max_fix_lines {
            return Err(Stop::Abort(format!(
                "fix too large: {touched} lines touched (ceiling {})",
                self.session.limits.max_fix_lines
            )));
        }
        if !self.session.record_fingerprint(after_digest.clone()) {
            return Err(Stop::Abort(
                "cycle detected: fix returned the target to an earlier state".to_string(),
            ));
        }
        tracing::info!(lines_touched = touched, fingerprint = %after_digest, "fix applied");
        self.session.passes = 0;
        self.advance_iteration()?;
        Ok(Flow::Next(State::Check))
    }

    fn step_verify(&mut self) -> Result<Flow, Stop> {
        tracing::info!(iteration = self.session.iteration, "verify");
        let prompt = agent::check_prompt(&self.description);
        let invocation = self.invoke(CallKind::Check, &prompt, "verify")?;
        match classify(&invocation.output) {
            Verdict::Clean => {
                // Second opinion disagrees with the original finding: the
                // check was a false positive, not a stuck fix.
                tracing::info!("original finding did not reproduce; counted as a pass");
                self.note_pass()
            }
            Verdict::IssuesFound { .. } => Err(Stop::Abort(
                "fix made no changes and issue persists".to_string(),
            )),
            Verdict::Blocked { reason } => Err(Stop::Abort(format!(
                "verify blocked: {}",
                truncate_string(&reason, REASON_BYTES)
            ))),
            Verdict::Fixed { .. } | Verdict::Unparseable => {
                Err(Stop::Abort("verify produced no usable verdict".to_string()))
            }
        }
    }

    fn note_pass(&mut self) -> Result<Flow, Stop> {
        self.session.passes += 1;
        tracing::info!(
            passes = self.session.passes,
            required = self.session.limits.passes_required,
            "clean check"
        );
        if self.session.passes >= self.session.limits.passes_required {
            return Ok(Flow::Done);
        }
        self.advance_iteration()?;
        Ok(Flow::Next(State::Check))
    }

    fn advance_iteration(&mut self) -> Result<(), Stop> {
        self.session.iteration += 1;
        if self.session.iteration > self.session.limits.max_iterations {
            return Err(Stop::Abort("did not stabilize".to_string()));
        }
        Ok(())
    }

    fn invoke(&mut self, kind: CallKind, prompt: &str, label: &str) -> Result<Invocation, Stop> {
        let invocation = match self.agent.call(kind, prompt) {
            Ok(invocation) => invocation,
            Err(CallError::Interrupted) => return Err(Stop::Interrupted),
            Err(err) => return Err(Stop::Abort(format!("{label} failed: {err}"))),
        };
        self.session.log_invocation(label, prompt, &invocation.output)?;
        Ok(invocation)
    }
}
