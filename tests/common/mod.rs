//! Shared fixture for exercising the fixpoint binary end to end.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

pub fn fixpoint_exe() -> &'static str {
    env!("CARGO_BIN_EXE_fixpoint")
}

/// A scratch directory holding one target file and an isolated state dir.
pub struct RunFixture {
    pub dir: TempDir,
    pub target: PathBuf,
    pub state_dir: PathBuf,
}

impl RunFixture {
    pub fn new(target_content: &str) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let target = dir.path().join("target.rs");
        fs::write(&target, target_content).expect("write target file");
        let state_dir = dir.path().join("state");
        Self {
            dir,
            target,
            state_dir,
        }
    }

    /// The session identity the binary derives for this target: a digest of
    /// the sorted canonical paths, truncated to 12 hex chars.
    pub fn identity(&self) -> String {
        // Canonicalize via the parent directory so the identity can still be
        // derived after the target file itself has been removed.
        let parent = self
            .target
            .parent()
            .expect("target has parent")
            .canonicalize()
            .expect("canonicalize target dir");
        let name = self.target.file_name().expect("target has file name");
        let canonical = parent.join(name).display().to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
        hex[..12].to_string()
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir
            .join("locks")
            .join(format!("{}.lock", self.identity()))
    }

    /// Directory holding this target's per-run transcript directories.
    pub fn session_log_dir(&self) -> PathBuf {
        self.state_dir.join("sessions").join(self.identity())
    }

    /// Run `fixpoint run` against the fixture target with extra flags.
    pub fn run(&self, extra: &[&str]) -> Output {
        let mut command = Command::new(fixpoint_exe());
        command
            .arg("run")
            .arg("--file")
            .arg(&self.target)
            .arg("--state-dir")
            .arg(&self.state_dir)
            .args(extra);
        command.output().expect("run fixpoint")
    }

    /// Run `fixpoint unlock` against the fixture target.
    pub fn unlock(&self) -> Output {
        Command::new(fixpoint_exe())
            .arg("unlock")
            .arg("--file")
            .arg(&self.target)
            .arg("--state-dir")
            .arg(&self.state_dir)
            .output()
            .expect("run fixpoint unlock")
    }
}

pub fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}
