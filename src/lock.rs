//! Advisory session locking keyed by target identity.
//!
//! One live session per target, system-wide. The filesystem backend records
//! the owning pid in a JSON lock file created with `create_new`; contention
//! probes the recorded owner for liveness and reclaims locks whose owner is
//! gone. The backend sits behind a trait so tests can substitute an
//! in-memory lock.

use crate::util::now_epoch_ms;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const ACQUIRE_ATTEMPTS: u32 = 3;
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(200);

/// On-disk owner record stored in the lock file.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub identity: String,
    pub started_at_epoch_ms: u64,
}

/// Why acquisition failed.
#[derive(Debug)]
pub enum LockError {
    AlreadyRunning { pid: u32 },
    Io(anyhow::Error),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::AlreadyRunning { pid } => {
                write!(f, "another session holds the lock (pid {pid})")
            }
            LockError::Io(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for LockError {}

/// Pluggable mutual-exclusion backend.
pub trait LockBackend {
    /// Take ownership of `identity`, reclaiming a dead owner's lock.
    fn acquire(&self, identity: &str) -> Result<(), LockError>;

    /// Idempotent; removes the lock only while this process still owns it.
    fn release(&self, identity: &str) -> Result<()>;
}

/// Scoped acquisition: released explicitly on the normal path, or on drop
/// for every other exit path (error, interrupt, panic unwind).
pub struct LockGuard<'a> {
    backend: &'a dyn LockBackend,
    identity: String,
    released: bool,
}

impl<'a> LockGuard<'a> {
    pub fn new(backend: &'a dyn LockBackend, identity: &str) -> Result<Self, LockError> {
        backend.acquire(identity)?;
        Ok(Self {
            backend,
            identity: identity.to_string(),
            released: false,
        })
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.backend.release(&self.identity)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.backend.release(&self.identity) {
                tracing::warn!(error = %err, "failed to release session lock");
            }
        }
    }
}

/// Filesystem lock backend rooted at one directory.
pub struct FsLock {
    dir: PathBuf,
    pid: u32,
}

impl FsLock {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            pid: std::process::id(),
        }
    }

    fn lock_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{identity}.lock"))
    }

    fn read_owner(path: &Path) -> Result<LockOwner> {
        let bytes = fs::read(path).with_context(|| format!("read lock {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse lock {}", path.display()))
    }

    /// Recorded owner, if a lock is held. Errors on an unreadable lock file.
    pub fn owner(&self, identity: &str) -> Result<Option<LockOwner>> {
        let path = self.lock_path(identity);
        if !path.is_file() {
            return Ok(None);
        }
        Self::read_owner(&path).map(Some)
    }

    /// Remove the lock regardless of ownership. Callers check liveness first.
    pub fn force_release(&self, identity: &str) -> Result<()> {
        let path = self.lock_path(identity);
        fs::remove_file(&path).with_context(|| format!("remove lock {}", path.display()))
    }
}

impl LockBackend for FsLock {
    fn acquire(&self, identity: &str) -> Result<(), LockError> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create lock dir {}", self.dir.display()))
            .map_err(LockError::Io)?;
        let path = self.lock_path(identity);
        for attempt in 0..ACQUIRE_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(ACQUIRE_BACKOFF);
            }
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    let owner = LockOwner {
                        pid: self.pid,
                        identity: identity.to_string(),
                        started_at_epoch_ms: now_epoch_ms().map_err(LockError::Io)?,
                    };
                    serde_json::to_writer_pretty(file, &owner)
                        .context("write lock owner")
                        .map_err(LockError::Io)?;
                    tracing::debug!(path = %path.display(), "lock acquired");
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    match Self::read_owner(&path) {
                        Ok(owner) if process_alive(owner.pid) => {
                            return Err(LockError::AlreadyRunning { pid: owner.pid });
                        }
                        Ok(owner) => {
                            tracing::warn!(
                                stale_pid = owner.pid,
                                "reclaiming lock from dead owner"
                            );
                            let _ = fs::remove_file(&path);
                        }
                        Err(_) => {
                            // An unreadable lock records nothing worth honoring.
                            let _ = fs::remove_file(&path);
                        }
                    }
                }
                Err(err) => {
                    return Err(LockError::Io(
                        anyhow::Error::new(err)
                            .context(format!("create lock {}", path.display())),
                    ));
                }
            }
        }
        Err(LockError::Io(anyhow!(
            "lock still contended after {ACQUIRE_ATTEMPTS} attempts"
        )))
    }

    fn release(&self, identity: &str) -> Result<()> {
        let path = self.lock_path(identity);
        // Gone or unreadable means nothing of ours is left to remove.
        let owner = match Self::read_owner(&path) {
            Ok(owner) => owner,
            Err(_) => return Ok(()),
        };
        // A newer session may have reclaimed a lock we once held stale.
        if owner.pid != self.pid {
            return Ok(());
        }
        fs::remove_file(&path).with_context(|| format!("remove lock {}", path.display()))
    }
}

/// Liveness probe via the null signal. EPERM still means alive.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
