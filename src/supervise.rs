//! Subprocess supervision: timeout, stall detection, and bounded retries.
//!
//! The external agent runs as a child process while the calling step blocks
//! on an exit-notification channel with a fixed timer tick. Each tick checks
//! wall-clock elapsed time against the timeout and captured-output growth
//! against the stall threshold. A stalled child whose output tail looks like
//! an interactive permission prompt is fatal for the whole run - retrying
//! reproduces the same block - while a plain stall is only surfaced for
//! observability. A fingerprint taken after `run_with_retries` returns is
//! safe: the child has been reaped and its output drained by then.

use crate::util::tail_string;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::fmt;
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Poll cadence of the supervision loop.
const TICK: Duration = Duration::from_secs(1);
/// Output tail inspected by the permission-prompt heuristic.
const PROMPT_TAIL_BYTES: usize = 2048;
/// Fixed delay between retry attempts.
const RETRY_DELAY: Duration = Duration::from_secs(2);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install a SIGINT handler that flips the process-wide interrupt flag.
/// The supervision tick and the controller's step boundaries poll it, so an
/// interrupt kills any in-flight child and unwinds through the lock guard.
pub fn install_interrupt_handler() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Supervision limits for one call.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub timeout: Duration,
    pub stall_threshold: Duration,
}

/// One completed agent invocation: combined output, exit code, elapsed time.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub output: String,
    pub exit_code: i32,
    pub elapsed: Duration,
}

/// Why a single attempt produced no usable output.
#[derive(Debug)]
enum AttemptFailure {
    Timeout { elapsed: Duration },
    NonZeroExit { code: i32, tail: String },
    EmptyOutput,
    PermissionPrompt { tail: String },
    Interrupted,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Timeout { elapsed } => {
                write!(f, "timed out after {:.0}s", elapsed.as_secs_f64())
            }
            AttemptFailure::NonZeroExit { code, tail } => {
                write!(f, "exited with code {code}: {}", tail.trim())
            }
            AttemptFailure::EmptyOutput => write!(f, "exited cleanly but produced no output"),
            AttemptFailure::PermissionPrompt { .. } => {
                write!(f, "stalled on an interactive permission prompt")
            }
            AttemptFailure::Interrupted => write!(f, "interrupted"),
        }
    }
}

enum Attempt {
    Completed(Invocation),
    Failed(AttemptFailure),
}

/// Terminal failure of a supervised call, after retry policy.
#[derive(Debug)]
pub enum CallError {
    /// The agent is waiting on a confirmation it cannot answer headlessly.
    /// Never retried: a rerun reproduces the same block.
    Blocked { tail: String },
    /// Transient failures exhausted the retry budget.
    Exhausted { attempts: u32, last: String },
    /// The operator interrupted the run.
    Interrupted,
    /// Environment error (spawn, pipe wiring).
    Io(anyhow::Error),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Blocked { tail } => write!(
                f,
                "agent blocked on a permission prompt: ...{}",
                tail.trim_end()
            ),
            CallError::Exhausted { attempts, last } => {
                write!(f, "agent failed {attempts} attempts; last: {last}")
            }
            CallError::Interrupted => write!(f, "interrupted"),
            CallError::Io(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for CallError {}

/// Run the command with bounded retries and a fixed delay between attempts.
/// Every attempt restarts the subprocess fresh; no partial output carries
/// over.
pub fn run_with_retries(
    argv: &[String],
    input: &str,
    limits: Limits,
    retries: u32,
) -> Result<Invocation, CallError> {
    let attempts = retries + 1;
    let mut last = String::new();
    for attempt in 1..=attempts {
        if interrupted() {
            return Err(CallError::Interrupted);
        }
        if attempt > 1 {
            tracing::info!(attempt, attempts, "retrying agent call");
            thread::sleep(RETRY_DELAY);
        }
        match run_once(argv, input, limits) {
            Ok(Attempt::Completed(invocation)) => {
                tracing::info!(
                    exit_code = invocation.exit_code,
                    elapsed_ms = invocation.elapsed.as_millis() as u64,
                    output_bytes = invocation.output.len(),
                    "agent call complete"
                );
                return Ok(invocation);
            }
            Ok(Attempt::Failed(AttemptFailure::PermissionPrompt { tail })) => {
                return Err(CallError::Blocked { tail });
            }
            Ok(Attempt::Failed(AttemptFailure::Interrupted)) => {
                return Err(CallError::Interrupted);
            }
            Ok(Attempt::Failed(failure)) => {
                tracing::warn!(attempt, %failure, "agent call failed");
                last = failure.to_string();
            }
            Err(err) => return Err(CallError::Io(err)),
        }
    }
    Err(CallError::Exhausted { attempts, last })
}

enum WaitResult {
    Exited(ExitStatus),
    TimedOut(Duration),
    Prompted(String),
    Interrupted,
}

fn run_once(argv: &[String], input: &str, limits: Limits) -> Result<Attempt> {
    let program = argv.first().ok_or_else(|| anyhow!("agent command is empty"))?;
    let start = Instant::now();
    let mut command = Command::new(program);
    command
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // The agent gets its own process group so termination reaches every
    // descendant, not just the immediate child; a surviving grandchild would
    // hold the output pipe open and block the reader joins below.
    unsafe {
        command.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let mut child = command
        .spawn()
        .with_context(|| format!("spawn agent command {program}"))?;
    let pid = child.id();

    // Feed the prompt from its own thread; a child that never reads stdin
    // must not deadlock the supervision loop on a full pipe.
    let mut stdin = child.stdin.take().context("agent stdin unavailable")?;
    let prompt = input.to_string();
    let stdin_thread = thread::spawn(move || {
        // The child may exit without draining stdin; that is not an error.
        let _ = stdin.write_all(prompt.as_bytes());
    });

    let capture: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Arc::clone(&capture)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Arc::clone(&capture)));
    }

    // Child-exit notification; `recv_timeout` doubles as the tick timer.
    let (exit_tx, exit_rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        let _ = exit_tx.send(child.wait());
    });

    let mut last_size = 0usize;
    let mut last_growth = Instant::now();
    let mut stall_logged = false;
    let wait_result = loop {
        match exit_rx.recv_timeout(TICK) {
            Ok(status) => break WaitResult::Exited(status.context("wait for agent")?),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("agent waiter thread dropped"));
            }
        }
        if interrupted() {
            break WaitResult::Interrupted;
        }
        let elapsed = start.elapsed();
        if elapsed >= limits.timeout {
            break WaitResult::TimedOut(elapsed);
        }
        let size = capture_len(&capture)?;
        if size > last_size {
            last_size = size;
            last_growth = Instant::now();
            stall_logged = false;
            tracing::debug!(
                elapsed_secs = elapsed.as_secs(),
                captured_bytes = size,
                "agent running"
            );
        } else if last_growth.elapsed() >= limits.stall_threshold {
            let tail = capture_tail(&capture)?;
            if looks_like_permission_prompt(&tail) {
                break WaitResult::Prompted(tail);
            }
            if !stall_logged {
                tracing::warn!(
                    stalled_secs = last_growth.elapsed().as_secs(),
                    "agent output stalled"
                );
                stall_logged = true;
            }
        }
    };

    if !matches!(wait_result, WaitResult::Exited(_)) {
        kill_group(pid);
        // Reap before touching any shared state.
        let _ = exit_rx.recv();
    }
    for reader in readers {
        let _ = reader.join();
    }
    let _ = stdin_thread.join();
    let _ = waiter.join();

    match wait_result {
        WaitResult::TimedOut(elapsed) => Ok(Attempt::Failed(AttemptFailure::Timeout { elapsed })),
        WaitResult::Prompted(tail) => {
            Ok(Attempt::Failed(AttemptFailure::PermissionPrompt { tail }))
        }
        WaitResult::Interrupted => Ok(Attempt::Failed(AttemptFailure::Interrupted)),
        WaitResult::Exited(status) => {
            let elapsed = start.elapsed();
            let bytes = capture
                .lock()
                .map_err(|_| anyhow!("capture buffer poisoned"))?;
            let output = String::from_utf8_lossy(&bytes).into_owned();
            let code = status.code().unwrap_or(-1);
            if !status.success() {
                let tail = tail_string(&output, PROMPT_TAIL_BYTES).to_string();
                return Ok(Attempt::Failed(AttemptFailure::NonZeroExit { code, tail }));
            }
            if output.trim().is_empty() {
                return Ok(Attempt::Failed(AttemptFailure::EmptyOutput));
            }
            Ok(Attempt::Completed(Invocation {
                output,
                exit_code: code,
                elapsed,
            }))
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut source: R,
    capture: Arc<Mutex<Vec<u8>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut capture) = capture.lock() {
                        capture.extend_from_slice(&buf[..n]);
                    }
                }
            }
        }
    })
}

fn capture_len(capture: &Arc<Mutex<Vec<u8>>>) -> Result<usize> {
    Ok(capture
        .lock()
        .map_err(|_| anyhow!("capture buffer poisoned"))?
        .len())
}

fn capture_tail(capture: &Arc<Mutex<Vec<u8>>>) -> Result<String> {
    let bytes = capture
        .lock()
        .map_err(|_| anyhow!("capture buffer poisoned"))?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(tail_string(&text, PROMPT_TAIL_BYTES).to_string())
}

fn kill_group(pid: u32) {
    // The waiter thread owns the Child, so termination goes through the pid.
    // The child is its own group leader; the negative pid targets the tree.
    let _ = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
}

/// Heuristic for an agent blocked on an interactive confirmation: a consent
/// verb paired with a y/n-style answer request in the output tail. Isolated
/// here so the detection can be tuned without touching supervision timing.
pub fn looks_like_permission_prompt(tail: &str) -> bool {
    static VERB: OnceLock<Regex> = OnceLock::new();
    static ANSWER: OnceLock<Regex> = OnceLock::new();
    let verb = VERB.get_or_init(|| {
        Regex::new(r"(?i)\b(allow|permit|approve|confirm|proceed|continue|grant|trust)\b").unwrap()
    });
    let answer = ANSWER.get_or_init(|| {
        Regex::new(r"(?i)(\[y/n\]|\(y/n\)|\byes/no\b|\by or n\b|press (y|enter))").unwrap()
    });
    verb.is_match(tail) && answer.is_match(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn limits(timeout_secs: u64, stall_secs: u64) -> Limits {
        Limits {
            timeout: Duration::from_secs(timeout_secs),
            stall_threshold: Duration::from_secs(stall_secs),
        }
    }

    #[test]
    fn test_success_requires_exit_zero_and_output() {
        let invocation = run_with_retries(&sh("echo ok"), "", limits(10, 10), 0).unwrap();
        assert_eq!(invocation.exit_code, 0);
        assert_eq!(invocation.output.trim(), "ok");
    }

    #[test]
    fn test_stdin_reaches_the_child() {
        let invocation = run_with_retries(&sh("cat"), "hello agent", limits(10, 10), 0).unwrap();
        assert_eq!(invocation.output, "hello agent");
    }

    #[test]
    fn test_nonzero_exit_exhausts_retries() {
        let err = run_with_retries(&sh("echo boom >&2; exit 3"), "", limits(10, 10), 1)
            .expect_err("nonzero exit must fail");
        match err {
            CallError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(last.contains("code 3"), "last failure: {last}");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_output_is_a_failure() {
        let err = run_with_retries(&sh("exit 0"), "", limits(10, 10), 0)
            .expect_err("empty output must fail");
        match err {
            CallError::Exhausted { last, .. } => assert!(last.contains("no output")),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_kills_the_child() {
        let start = Instant::now();
        let err = run_with_retries(&sh("sleep 30"), "", limits(1, 30), 0)
            .expect_err("timeout must fail");
        assert!(start.elapsed() < Duration::from_secs(10));
        match err {
            CallError::Exhausted { last, .. } => assert!(last.contains("timed out")),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_kills_descendant_processes() {
        // The shell forks a grandchild that inherits the output pipe; the
        // kill must reach it or the reader joins block until it exits.
        let start = Instant::now();
        let err = run_with_retries(&sh("sleep 30 & wait"), "", limits(1, 30), 0)
            .expect_err("timeout must fail");
        assert!(start.elapsed() < Duration::from_secs(10));
        match err {
            CallError::Exhausted { last, .. } => assert!(last.contains("timed out")),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_permission_prompt_stall_is_fatal_not_retried() {
        let script = "printf 'May I edit this file? Allow? [y/n] '; sleep 30";
        let start = Instant::now();
        let err = run_with_retries(&sh(script), "", limits(30, 1), 3)
            .expect_err("permission prompt must fail");
        // A retryable classification would sleep through the retry delays.
        assert!(start.elapsed() < Duration::from_secs(15));
        assert!(matches!(err, CallError::Blocked { .. }), "got {err:?}");
    }

    #[test]
    fn test_prompt_heuristic() {
        assert!(looks_like_permission_prompt(
            "Allow this command to run? [y/n]"
        ));
        assert!(looks_like_permission_prompt(
            "Do you want to proceed? (y/N)"
        ));
        assert!(!looks_like_permission_prompt("compiling fixpoint v0.1.0"));
        assert!(!looks_like_permission_prompt("error: permission denied"));
    }
}
