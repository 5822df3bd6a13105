//! Execution supervisor
//!
//! Runs one job's launch command, streams its output into bounded buffers and
//! enforces the wall-clock deadline and cancellation. The job runs in its own
//! process group so that forced termination reaches every process it spawned.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

pub use crate::supervisor::capture::OutputCapture;
use crate::sandbox::{LaunchCommand, Rlimit};
use crate::types::{ErrorKind, FALLBACK_WALL_TIME, JobStatus, ResourceLimits};

mod capture;

/// How long to wait for output pipes to close once the process group is dead
const IO_SETTLE: Duration = Duration::from_secs(2);

/// Lifecycle of one supervised job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Pending,
    Running,
    Completed,
    TimedOut,
    Killed,
    Crashed,
}

impl SupervisorState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SupervisorState::Pending | SupervisorState::Running)
    }

    pub fn can_transition(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Pending, Running | Killed | Crashed)
                | (Running, Completed | TimedOut | Killed | Crashed)
        )
    }

    pub fn job_status(self) -> JobStatus {
        match self {
            SupervisorState::Pending => JobStatus::Pending,
            SupervisorState::Running => JobStatus::Running,
            SupervisorState::Completed => JobStatus::Completed,
            SupervisorState::TimedOut => JobStatus::TimedOut,
            SupervisorState::Killed => JobStatus::Killed,
            SupervisorState::Crashed => JobStatus::Crashed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal supervisor transition from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: SupervisorState,
    pub to: SupervisorState,
}

/// Called on every state change
pub type TransitionObserver = Arc<dyn Fn(SupervisorState) + Send + Sync>;

/// Everything the supervisor observed about one run
#[derive(Debug, Clone)]
pub struct Supervision {
    pub state: SupervisorState,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub wall_time: Duration,
    /// Set when the run crashed
    pub error: Option<(ErrorKind, String)>,
}

impl Supervision {
    fn empty(state: SupervisorState) -> Self {
        Self {
            state,
            exit_code: None,
            signal: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            wall_time: Duration::ZERO,
            error: None,
        }
    }
}

pub struct Supervisor {
    state: SupervisorState,
    limits: ResourceLimits,
    cancel: CancellationToken,
    observer: Option<TransitionObserver>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state)
            .field("limits", &self.limits)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(limits: ResourceLimits, cancel: CancellationToken) -> Self {
        Self {
            state: SupervisorState::Pending,
            limits,
            cancel,
            observer: None,
        }
    }

    pub fn on_transition(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn transition(&mut self, next: SupervisorState) -> Result<(), TransitionError> {
        if !self.state.can_transition(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        debug!(from = ?self.state, to = ?next, "supervisor transition");
        self.state = next;
        if let Some(observer) = &self.observer {
            observer(next);
        }
        Ok(())
    }

    /// Move to a terminal state, logging instead of failing on an illegal edge
    fn settle(&mut self, next: SupervisorState) -> SupervisorState {
        if let Err(e) = self.transition(next) {
            warn!(%e, "ignoring transition");
        }
        self.state
    }

    /// Run `launch` to completion, timeout or cancellation
    #[instrument(skip_all, fields(program = ?launch.program))]
    pub async fn run(mut self, launch: LaunchCommand, stdin: Option<Vec<u8>>) -> Supervision {
        if self.cancel.is_cancelled() {
            let state = self.settle(SupervisorState::Killed);
            return Supervision::empty(state);
        }

        let started = Instant::now();
        let mut child = match build_command(&launch, stdin.is_some()).spawn() {
            Ok(child) => child,
            Err(e) => {
                let state = self.settle(SupervisorState::Crashed);
                let mut supervision = Supervision::empty(state);
                supervision.error = Some((
                    ErrorKind::LaunchFailure,
                    format!("failed to launch {}: {e}", launch.program.to_string_lossy()),
                ));
                return supervision;
            }
        };
        let pgid = child.id();
        self.settle(SupervisorState::Running);
        debug!(pid = ?pgid, "job started");

        let feeder = match (child.stdin.take(), stdin) {
            (Some(mut pipe), Some(data)) => Some(tokio::spawn(async move {
                // The program may exit without reading its input
                if let Err(e) = pipe.write_all(&data).await {
                    debug!(%e, "stdin closed early");
                }
                let _ = pipe.shutdown().await;
            })),
            _ => None,
        };

        let cap = self.limits.output_cap();
        let mut stdout = OutputCapture::new(cap);
        let mut stderr = OutputCapture::new(cap);
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let mut io = Box::pin(async {
            let (out, err) = tokio::join!(stdout.drain(stdout_pipe), stderr.drain(stderr_pipe));
            if let Err(e) = out.and(err) {
                debug!(%e, "output stream error");
            }
        });
        let mut io_done = false;

        let wall = self.limits.wall_time_duration();
        let deadline = started
            .checked_add(wall)
            .unwrap_or_else(|| started + Duration::from_secs_f64(FALLBACK_WALL_TIME));
        let mut status = None;
        let mut error = None;

        let outcome = loop {
            tokio::select! {
                biased;

                () = &mut io, if !io_done => {
                    io_done = true;
                }
                waited = child.wait() => {
                    match waited {
                        Ok(exit) => {
                            status = Some(exit);
                            break SupervisorState::Completed;
                        }
                        Err(e) => {
                            error = Some((ErrorKind::InternalError, format!("wait failed: {e}")));
                            break SupervisorState::Crashed;
                        }
                    }
                }
                () = sleep_until(deadline) => {
                    debug!("wall time limit reached");
                    break SupervisorState::TimedOut;
                }
                () = self.cancel.cancelled() => {
                    debug!("job cancelled");
                    break SupervisorState::Killed;
                }
            }
        };

        if matches!(outcome, SupervisorState::TimedOut | SupervisorState::Killed) {
            status = terminate(&mut child, pgid, self.limits.grace_duration()).await;
        }

        // Stragglers left behind by the main process would hold the pipes open
        signal_group(pgid, libc::SIGKILL);
        if status.is_none() {
            let _ = child.start_kill();
            status = child.wait().await.ok();
        }

        if !io_done && timeout(IO_SETTLE, &mut io).await.is_err() {
            warn!("output streams still open after the job ended");
        }
        drop(io);
        if let Some(feeder) = feeder {
            feeder.abort();
        }

        let state = self.settle(outcome);
        let (stdout, stdout_truncated) = stdout.into_parts();
        let (stderr, stderr_truncated) = stderr.into_parts();

        Supervision {
            state,
            exit_code: status.and_then(|s| s.code()),
            signal: status.and_then(|s| s.signal()),
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            wall_time: started.elapsed(),
            error,
        }
    }
}

/// SIGTERM the group, give it `grace` to exit, then SIGKILL
async fn terminate(child: &mut Child, pgid: Option<u32>, grace: Duration) -> Option<ExitStatus> {
    signal_group(pgid, libc::SIGTERM);
    if let Ok(Ok(status)) = timeout(grace, child.wait()).await {
        return Some(status);
    }

    debug!(?grace, "grace period elapsed, killing process group");
    signal_group(pgid, libc::SIGKILL);
    let _ = child.start_kill();
    child.wait().await.ok()
}

fn signal_group(pgid: Option<u32>, signal: libc::c_int) {
    let Some(pgid) = pgid else {
        return;
    };
    // SAFETY: killpg takes plain integers and touches no memory
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pgid, signal, %err, "killpg failed");
        }
    }
}

fn build_command(launch: &LaunchCommand, pipe_stdin: bool) -> Command {
    let mut command = Command::new(&launch.program);
    command
        .args(&launch.args)
        .stdin(if pipe_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    if launch.clear_env {
        command.env_clear();
    }
    command.envs(&launch.env);
    if let Some(dir) = &launch.current_dir {
        command.current_dir(dir);
    }

    if !launch.rlimits.is_empty() {
        let rlimits = launch.rlimits.clone();
        // SAFETY: the hook only calls setrlimit, which is async-signal-safe
        unsafe {
            command.pre_exec(move || {
                for &(resource, soft, hard) in &rlimits {
                    apply_rlimit(resource, soft, hard)?;
                }
                Ok(())
            });
        }
    }

    command
}

fn apply_rlimit(resource: Rlimit, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call
    let rc = unsafe {
        match resource {
            Rlimit::AddressSpace => libc::setrlimit(libc::RLIMIT_AS, &limit),
            Rlimit::CpuTime => libc::setrlimit(libc::RLIMIT_CPU, &limit),
            Rlimit::FileSize => libc::setrlimit(libc::RLIMIT_FSIZE, &limit),
            Rlimit::OpenFiles => libc::setrlimit(libc::RLIMIT_NOFILE, &limit),
            Rlimit::Stack => libc::setrlimit(libc::RLIMIT_STACK, &limit),
            Rlimit::Processes => libc::setrlimit(libc::RLIMIT_NPROC, &limit),
        }
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
