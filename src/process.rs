//! External process invocation with bounded capture and deadlines.
//!
//! Compiler and packager output can be arbitrarily verbose, so stdout and
//! stderr are drained into capped buffers. The child is polled against its
//! deadline and the shared cancellation flag; on either trip it is killed
//! and the outcome recorded, never thrown.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;

/// Upper bound on captured bytes per stream.
const CAPTURE_LIMIT: usize = 256 * 1024;

/// Marker appended when a stream exceeded [`CAPTURE_LIMIT`].
const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Interval at which the child is polled for exit, deadline and
/// cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One external command, fully assembled ahead of execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<Utf8PathBuf>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Cooperative cancellation flag shared between the orchestrator and every
/// in-flight process runner.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecStatus {
    /// Process exited zero.
    Success,
    /// Process exited non-zero or could not be spawned.
    Failed,
    /// Deadline elapsed; the child was terminated.
    Timeout,
    /// Cancellation was requested; the child was terminated.
    Cancelled,
    /// Node skipped, its fingerprint matched the last successful run.
    Skipped,
}

/// Outcome of a single task node, owned by the orchestrator and aggregated
/// into the final report.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub name: String,
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl ExecutionResult {
    pub(crate) fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ExecStatus::Skipped,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecStatus::Success | ExecStatus::Skipped)
    }
}

/// Runs one invocation to completion, enforcing the deadline and honoring
/// the cancellation flag. Every outcome is captured into the result; this
/// function never fails.
pub fn run(invocation: &Invocation, name: &str, cancel: &CancelToken) -> ExecutionResult {
    let started = Instant::now();

    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = &invocation.working_dir {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return ExecutionResult {
                name: name.to_string(),
                status: ExecStatus::Failed,
                stdout: String::new(),
                stderr: format!("Failed to spawn '{}': {err}", invocation.program),
                exit_code: None,
                duration: started.elapsed(),
            };
        }
    };

    tracing::debug!(
        "Running '{}' for task '{name}' with {} argument(s)",
        invocation.program,
        invocation.args.len()
    );

    let stdout = capture(child.stdout.take());
    let stderr = capture(child.stderr.take());

    let deadline = invocation.timeout.map(|timeout| started + timeout);

    let (status, exit_code) = loop {
        match child.try_wait() {
            Ok(Some(exit)) => {
                let status = if exit.success() {
                    ExecStatus::Success
                } else {
                    ExecStatus::Failed
                };
                break (status, exit.code());
            }
            Ok(None) => {}
            Err(_) => {
                kill(&mut child);
                break (ExecStatus::Failed, None);
            }
        }

        if cancel.is_cancelled() {
            kill(&mut child);
            break (ExecStatus::Cancelled, None);
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            kill(&mut child);
            break (ExecStatus::Timeout, None);
        }

        thread::sleep(POLL_INTERVAL);
    };

    // Pipes close once the child is gone, so the readers always terminate.
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();

    ExecutionResult {
        name: name.to_string(),
        status,
        stdout,
        stderr,
        exit_code,
        duration: started.elapsed(),
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Drains a stream into a buffer capped at [`CAPTURE_LIMIT`]. Excess bytes
/// are read and discarded so the child never blocks on a full pipe.
fn capture<R>(reader: Option<R>) -> JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let Some(mut reader) = reader else {
            return String::new();
        };

        let mut buffer = Vec::new();
        let mut chunk = [0u8; 8192];
        let mut truncated = false;

        loop {
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = CAPTURE_LIMIT.saturating_sub(buffer.len());
                    let take = n.min(room);
                    buffer.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                }
            }
        }

        let mut text = String::from_utf8_lossy(&buffer).into_owned();
        if truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    })
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Invocation {
        Invocation::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn captures_stdout() {
        let result = run(&sh("echo hello"), "echo", &CancelToken::new());
        assert_eq!(result.status, ExecStatus::Success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "hello");
        assert!(result.is_success());
    }

    #[test]
    fn captures_nonzero_exit() {
        let result = run(&sh("echo oops >&2; exit 3"), "fail", &CancelToken::new());
        assert_eq!(result.status, ExecStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr.trim(), "oops");
        assert!(!result.is_success());
    }

    #[test]
    fn spawn_failure_is_captured() {
        let invocation = Invocation::new("imageforge-no-such-binary", vec![]);
        let result = run(&invocation, "missing", &CancelToken::new());
        assert_eq!(result.status, ExecStatus::Failed);
        assert_eq!(result.exit_code, None);
        assert!(result.stderr.contains("Failed to spawn"));
    }

    #[test]
    fn deadline_kills_the_child() {
        let invocation = sh("sleep 5").timeout(Some(Duration::from_millis(200)));
        let result = run(&invocation, "slow", &CancelToken::new());
        assert_eq!(result.status, ExecStatus::Timeout);
        assert!(result.duration < Duration::from_secs(3));
    }

    #[test]
    fn cancellation_kills_the_child() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let result = run(&sh("sleep 5"), "cancelled", &cancel);
        handle.join().unwrap();

        assert_eq!(result.status, ExecStatus::Cancelled);
        assert!(result.duration < Duration::from_secs(3));
    }

    #[test]
    fn output_is_bounded() {
        // ~400 KiB of output against a 256 KiB cap
        let result = run(
            &sh("head -c 400000 /dev/zero | tr '\\0' 'x'"),
            "verbose",
            &CancelToken::new(),
        );
        assert_eq!(result.status, ExecStatus::Success);
        assert!(result.stdout.len() <= CAPTURE_LIMIT + TRUNCATION_MARKER.len());
        assert!(result.stdout.ends_with(TRUNCATION_MARKER));
    }
}
