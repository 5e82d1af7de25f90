//! Agent boundary: command resolution, prompt assembly, and invocation.
//!
//! The agent is any user-configured command that reads a prompt on stdin and
//! exits 0 with non-empty combined output carrying the sentinel markers the
//! classifier understands. Nothing here inspects what the agent did to the
//! target; that is the fingerprint's job.

use crate::supervise::{self, CallError, Invocation, Limits};
use anyhow::{anyhow, Context, Result};
use std::time::Duration;

/// Environment fallback for the agent command line.
pub const AGENT_ENV: &str = "FIXPOINT_AGENT";

const CHECK_PROMPT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/check.md"));
const FIX_PROMPT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/fix.md"));

/// What the loop is asking the agent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Check,
    Fix,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Check => "check",
            CallKind::Fix => "fix",
        }
    }
}

/// One supervised invocation per call; implementations decide how.
pub trait Agent {
    fn call(&mut self, kind: CallKind, prompt: &str) -> Result<Invocation, CallError>;
}

/// Parsed and resolved agent command line.
pub struct AgentCommand {
    pub argv: Vec<String>,
}

/// Resolve the agent command: `--agent` flag first, then the environment.
/// The program is resolved eagerly so a typo fails before any lock is taken.
pub fn resolve_agent_command(flag: Option<&str>) -> Result<AgentCommand> {
    let raw = match flag {
        Some(raw) => raw.to_string(),
        None => std::env::var(AGENT_ENV)
            .map_err(|_| anyhow!("no agent command (pass --agent or set {AGENT_ENV})"))?,
    };
    let argv = shell_words::split(&raw).with_context(|| format!("parse agent command: {raw}"))?;
    let program = argv
        .first()
        .ok_or_else(|| anyhow!("agent command is empty"))?;
    which::which(program).with_context(|| format!("agent program not found: {program}"))?;
    Ok(AgentCommand { argv })
}

/// The real agent: every call goes through the process supervisor.
pub struct SupervisedAgent {
    argv: Vec<String>,
    limits: Limits,
    retries: u32,
}

impl SupervisedAgent {
    pub fn new(command: AgentCommand, limits: Limits, retries: u32) -> Self {
        Self {
            argv: command.argv,
            limits,
            retries,
        }
    }
}

impl Agent for SupervisedAgent {
    fn call(&mut self, kind: CallKind, prompt: &str) -> Result<Invocation, CallError> {
        tracing::info!(
            kind = kind.as_str(),
            prompt_bytes = prompt.len(),
            "invoking agent"
        );
        supervise::run_with_retries(&self.argv, prompt, self.limits, self.retries)
    }
}

/// Wiring-test agent: bypasses the subprocess and always reports a pass.
pub struct DryRunAgent;

impl Agent for DryRunAgent {
    fn call(&mut self, kind: CallKind, _prompt: &str) -> Result<Invocation, CallError> {
        let output = match kind {
            CallKind::Check => "[PASS]\n",
            CallKind::Fix => "[DONE] dry run\n",
        };
        Ok(Invocation {
            output: output.to_string(),
            exit_code: 0,
            elapsed: Duration::ZERO,
        })
    }
}

pub fn check_prompt(target_description: &str) -> String {
    CHECK_PROMPT.replace("{target}", target_description)
}

pub fn fix_prompt(target_description: &str, report: &str) -> String {
    FIX_PROMPT
        .replace("{target}", target_description)
        .replace("{report}", report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_carry_target_and_report() {
        let check = check_prompt("- src/main.rs");
        assert!(check.contains("- src/main.rs"));
        assert!(check.contains("[PASS]"));

        let fix = fix_prompt("- src/main.rs", "src/main.rs:3 leak");
        assert!(fix.contains("src/main.rs:3 leak"));
        assert!(fix.contains("[DONE]"));
    }

    #[test]
    fn test_resolve_rejects_empty_command() {
        assert!(resolve_agent_command(Some("")).is_err());
    }

    #[test]
    fn test_resolve_splits_shell_words() {
        // /bin/sh exists everywhere this crate builds.
        let command = resolve_agent_command(Some("/bin/sh -c 'echo hi'")).unwrap();
        assert_eq!(command.argv, vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_dry_run_agent_always_passes() {
        let mut agent = DryRunAgent;
        let invocation = agent.call(CallKind::Check, "anything").unwrap();
        assert!(invocation.output.contains("[PASS]"));
    }
}
