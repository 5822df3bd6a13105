//! Result collection
//!
//! Turns what the supervisor saw and what the backend reports into one
//! [`ExecutionResult`], and tears the sandbox down before handing it back.

use tracing::{debug, warn};

use crate::sandbox::{SandboxGuard, SandboxReport};
use crate::supervisor::{Supervision, SupervisorState};
use crate::types::{ErrorKind, ExecutionResult, JobId, LimitExceeded, TerminationReason};

/// Signal delivered when RLIMIT_CPU's soft limit is reached
const SIGXCPU: i32 = libc::SIGXCPU;

/// Normalize a finished run and release its sandbox.
///
/// A failed teardown is logged and left to the reaper; it never changes the
/// result.
pub async fn collect(
    job_id: JobId,
    language: &str,
    supervision: Supervision,
    guard: SandboxGuard,
) -> ExecutionResult {
    let report = guard.report().await;
    let result = normalize(job_id, language, supervision, report);
    release(guard).await;
    debug!(
        job = %job_id,
        reason = ?result.reason,
        exit_code = ?result.exit_code,
        wall_time = result.wall_time,
        "job finished"
    );
    result
}

/// Release a sandbox whose job failed before it could run
pub async fn abandon(
    job_id: JobId,
    language: &str,
    guard: SandboxGuard,
    kind: ErrorKind,
    message: impl Into<String>,
) -> ExecutionResult {
    release(guard).await;
    ExecutionResult::failure(job_id, language, kind, message)
}

async fn release(guard: SandboxGuard) {
    let name = guard.name().to_owned();
    if let Err(e) = guard.release().await {
        warn!(sandbox = %name, error = %e, "teardown failed, left for the reaper");
    }
}

pub fn normalize(
    job_id: JobId,
    language: &str,
    supervision: Supervision,
    report: SandboxReport,
) -> ExecutionResult {
    let (exit_code, signal) = if report.reports_exit_status {
        (report.exit_code, report.signal)
    } else {
        (supervision.exit_code, supervision.signal)
    };

    let mut limit_exceeded = report.limit_exceeded;
    let mut message = report.message.clone();

    let (reason, error) = match supervision.state {
        SupervisorState::Completed if report.internal_error => {
            (TerminationReason::InternalError, Some(ErrorKind::InternalError))
        }
        SupervisorState::Completed if report.timed_out || signal == Some(SIGXCPU) => {
            if !limit_exceeded.is_time() {
                limit_exceeded = LimitExceeded::Time;
            }
            (TerminationReason::TimedOut, Some(ErrorKind::TimedOut))
        }
        SupervisorState::Completed => (TerminationReason::Completed, None),
        SupervisorState::TimedOut => {
            if !limit_exceeded.is_exceeded() {
                limit_exceeded = LimitExceeded::WallTime;
            }
            message.get_or_insert_with(|| "Wall time limit exceeded".to_owned());
            (TerminationReason::TimedOut, Some(ErrorKind::TimedOut))
        }
        SupervisorState::Killed => {
            message.get_or_insert_with(|| "Cancelled".to_owned());
            (TerminationReason::Killed, Some(ErrorKind::Killed))
        }
        SupervisorState::Crashed | SupervisorState::Pending | SupervisorState::Running => {
            let (kind, detail) = supervision
                .error
                .clone()
                .unwrap_or((ErrorKind::InternalError, "supervisor crashed".to_owned()));
            message = Some(detail);
            (TerminationReason::InternalError, Some(kind))
        }
    };

    let truncated = supervision.stdout_truncated || supervision.stderr_truncated;
    if truncated && !limit_exceeded.is_exceeded() {
        limit_exceeded = LimitExceeded::Output;
    }

    ExecutionResult {
        job_id,
        language: language.to_owned(),
        reason,
        error,
        message,
        exit_code,
        signal,
        stdout: supervision.stdout,
        stderr: supervision.stderr,
        stdout_truncated: supervision.stdout_truncated,
        stderr_truncated: supervision.stderr_truncated,
        wall_time: supervision.wall_time.as_secs_f64(),
        cpu_time: report.cpu_time,
        peak_memory: report.peak_memory,
        limit_exceeded,
    }
}
