//! Session state: counters, fingerprint history, and on-disk transcripts.
//!
//! All mutable run state lives in one `Session` value owned by the caller
//! and threaded through the controller; there is no ambient global state.
//! Transcripts are written per iteration and purged only on success, so a
//! failed run always leaves a post-mortem trail.

use crate::fingerprint::Fingerprint;
use crate::supervise::Limits;
use crate::util::now_epoch_ms;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// Disambiguates runs started within the same millisecond by one process.
static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Safety limits for one run.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_iterations: u32,
    pub passes_required: u32,
    pub retries: u32,
    pub timeout: Duration,
    pub stall_threshold: Duration,
    pub max_fix_lines: usize,
}

impl SessionLimits {
    pub fn supervise(&self) -> Limits {
        Limits {
            timeout: self.timeout,
            stall_threshold: self.stall_threshold,
        }
    }
}

pub struct Session {
    pub identity: String,
    pub limits: SessionLimits,
    pub iteration: u32,
    pub passes: u32,
    history: Vec<Fingerprint>,
    log_dir: PathBuf,
    started: Instant,
}

impl Session {
    pub fn create(identity: &str, limits: SessionLimits, state_dir: &Path) -> Result<Self> {
        // Each run gets its own transcript directory under the identity, so a
        // rerun never overwrites an earlier failure's trail and a later
        // success never purges it.
        let run_id = format!(
            "{}-{}-{}",
            now_epoch_ms()?,
            std::process::id(),
            RUN_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let log_dir = state_dir.join("sessions").join(identity).join(run_id);
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("create session log dir {}", log_dir.display()))?;
        Ok(Self {
            identity: identity.to_string(),
            limits,
            iteration: 1,
            passes: 0,
            history: Vec::new(),
            log_dir,
            started: Instant::now(),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Append a fingerprint to the seen history. Returns false when the
    /// fingerprint repeats an earlier state (oscillation); the history is
    /// never truncated, so the check covers the whole session.
    pub fn record_fingerprint(&mut self, fingerprint: Fingerprint) -> bool {
        if self.history.contains(&fingerprint) {
            return false;
        }
        self.history.push(fingerprint);
        true
    }

    /// Write one invocation transcript for post-mortem diagnosis.
    pub fn log_invocation(&self, label: &str, prompt: &str, output: &str) -> Result<()> {
        let path = self
            .log_dir
            .join(format!("iter_{:03}_{label}.log", self.iteration));
        let body = format!("# prompt\n{prompt}\n\n# output\n{output}\n");
        fs::write(&path, body).with_context(|| format!("write {}", path.display()))
    }

    /// Remove this run's transcripts; called only on successful termination.
    /// Transcripts left by earlier failed runs are untouched.
    pub fn purge_logs(&self) -> Result<()> {
        if self.log_dir.is_dir() {
            fs::remove_dir_all(&self.log_dir)
                .with_context(|| format!("remove session logs {}", self.log_dir.display()))?;
        }
        Ok(())
    }
}

/// Machine-readable summary of a finished run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub iterations: u32,
    pub passes: u32,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::target::Snapshot;

    fn limits() -> SessionLimits {
        SessionLimits {
            max_iterations: 5,
            passes_required: 2,
            retries: 0,
            timeout: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(5),
            max_fix_lines: 100,
        }
    }

    fn digest(content: &str) -> Fingerprint {
        let mut snapshot = Snapshot::new();
        snapshot.insert("f", content);
        fingerprint(&snapshot)
    }

    #[test]
    fn test_history_only_grows_and_detects_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::create("abc", limits(), dir.path()).unwrap();
        assert!(session.record_fingerprint(digest("a")));
        assert!(session.record_fingerprint(digest("b")));
        assert!(!session.record_fingerprint(digest("a")));
        // The rejected repeat does not displace existing history.
        assert!(!session.record_fingerprint(digest("b")));
    }

    #[test]
    fn test_logs_written_and_purged() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::create("abc", limits(), dir.path()).unwrap();
        session.log_invocation("check", "prompt text", "[PASS]").unwrap();
        assert!(session.log_dir().join("iter_001_check.log").is_file());
        session.purge_logs().unwrap();
        assert!(!session.log_dir().exists());
        // Idempotent after purge.
        session.purge_logs().unwrap();
    }

    #[test]
    fn test_reruns_keep_separate_transcript_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let first = Session::create("abc", limits(), dir.path()).unwrap();
        first.log_invocation("check", "prompt", "[FAIL]\nf:1 bad").unwrap();

        let second = Session::create("abc", limits(), dir.path()).unwrap();
        assert_ne!(first.log_dir(), second.log_dir());
        second.log_invocation("check", "prompt", "[PASS]").unwrap();
        second.purge_logs().unwrap();

        // The earlier failure's trail survives the later run's cleanup.
        assert!(first.log_dir().join("iter_001_check.log").is_file());
    }
}
