//! Runs the external sampler for the requested duration.
//!
//! The sampler is stopped with SIGINT rather than killed, so it gets the
//! chance to finalize its capture file. The sampler must write its capture to
//! a fixed file name inside the working directory (`perf.data` for `perf
//! record`); the runner only checks that the file is there afterwards.

use crate::errors::CaptureError;
use crate::subprocess::{BoundedTail, ToolCommand};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

const RUNNING: u8 = 0;
const EXITED: u8 = 1;
const CANCELLED: u8 = 2;

const STDERR_GRACE: Duration = Duration::from_secs(2);

/// Completion state shared by the deadline and the wait on the child.
///
/// Whichever side moves it out of `RUNNING` first wins; the interrupt is only
/// delivered by a deadline that won, so a deadline expiring after the child
/// was seen exiting does nothing.
#[derive(Debug, Default)]
pub struct Deadline {
    state: AtomicU8,
}

impl Deadline {
    /// Claims the right to interrupt the child.
    pub fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Records that the child exited on its own.
    pub fn mark_exited(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, EXITED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn was_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

/// How the sampler ended, when that end is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    Interrupted,
}

/// Which exits of the sampler count as a usable capture.
///
/// Being stopped by SIGINT is the normal end of a deadline-bounded capture.
/// Samplers that trap SIGINT report it through an exit code instead; `perf`
/// exits with 130 when interrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub termination_by_signal_is_success: bool,
    pub interrupted_exit_codes: Vec<i32>,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            termination_by_signal_is_success: true,
            interrupted_exit_codes: vec![130],
        }
    }
}

impl TerminationPolicy {
    /// `None` means the exit is a failure.
    pub fn classify(&self, status: ExitStatus) -> Option<Termination> {
        if status.success() {
            return Some(Termination::Exited);
        }
        if self.termination_by_signal_is_success && status.signal() == Some(Signal::SIGINT as i32) {
            return Some(Termination::Interrupted);
        }
        match status.code() {
            Some(code) if self.interrupted_exit_codes.contains(&code) => {
                Some(Termination::Interrupted)
            }
            _ => None,
        }
    }
}

/// A capture file left behind by a successful sampler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCapture {
    pub path: PathBuf,
    pub termination: Termination,
}

#[derive(Debug, Clone)]
pub struct SamplingRunner {
    workdir: PathBuf,
    capture_file: PathBuf,
    policy: TerminationPolicy,
    stderr_limit: usize,
}

impl SamplingRunner {
    pub fn new(
        workdir: impl Into<PathBuf>,
        capture_file: impl Into<PathBuf>,
        policy: TerminationPolicy,
        stderr_limit: usize,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            capture_file: capture_file.into(),
            policy,
            stderr_limit,
        }
    }

    pub fn capture_path(&self) -> PathBuf {
        self.workdir.join(&self.capture_file)
    }

    /// Runs `command` until it exits or `timeout` elapses, whichever is first.
    pub async fn run(
        &self,
        command: &ToolCommand,
        timeout: Duration,
    ) -> Result<RawCapture, CaptureError> {
        log::info!("running {}", command);

        let mut child = command
            .to_piped_command()
            .stdout(Stdio::null())
            .current_dir(&self.workdir)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stderr = child.stderr.take();
        let limit = self.stderr_limit;
        let mut stderr_task = tokio::spawn(async move {
            match stderr {
                Some(stream) => read_tail(stream, limit).await,
                None => String::new(),
            }
        });

        let deadline = Deadline::default();
        let expiry = tokio::time::sleep(timeout);
        tokio::pin!(expiry);

        let waited = loop {
            tokio::select! {
                biased;
                status = child.wait() => break status,
                _ = &mut expiry, if !deadline.was_cancelled() => {
                    if deadline.try_cancel() {
                        interrupt(child.id(), timeout);
                    }
                }
            }
        };
        deadline.mark_exited();

        let status = waited.map_err(|source| CaptureError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let stderr = match tokio::time::timeout(STDERR_GRACE, &mut stderr_task).await {
            Ok(Ok(text)) => text,
            _ => {
                // a grandchild may still hold the pipe open
                stderr_task.abort();
                String::new()
            }
        };

        let termination = self.policy.classify(status).ok_or_else(|| CaptureError::Failed {
            command: command.to_string(),
            status,
            stderr,
        })?;

        let path = self.capture_path();
        if !capture_exists(&path) {
            return Err(CaptureError::MissingCapture {
                command: command.to_string(),
                path,
            });
        }
        log::debug!("{} ended ({:?}), capture at {}", command, termination, path.display());
        Ok(RawCapture { path, termination })
    }
}

fn interrupt(pid: Option<u32>, timeout: Duration) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    log::info!("sending INT signal to process {} after {:?}", pid, timeout);
    if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGINT) {
        log::warn!("interrupt of process {} failed: {}", pid, e);
    }
}

async fn read_tail<R: AsyncRead + Unpin>(mut stream: R, limit: usize) -> String {
    let mut tail = BoundedTail::new(limit);
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => tail.push(&chunk[..n]),
            Err(e) => {
                log::debug!("stopped reading stderr: {}", e);
                break;
            }
        }
    }
    tail.into_excerpt()
}

/// True when `path` looks like a capture the sampler produced.
pub fn capture_exists(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}
