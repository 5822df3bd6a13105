use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Default grace period between SIGTERM and SIGKILL, in seconds
pub const DEFAULT_GRACE_PERIOD: f64 = 0.5;

/// Wall clock limit used when none is configured, in seconds
pub const FALLBACK_WALL_TIME: f64 = 30.0;

/// Longest wall clock limit any job runs under, in seconds
pub const MAX_WALL_TIME: f64 = 24.0 * 60.0 * 60.0;

/// Longest grace period between SIGTERM and SIGKILL, in seconds
pub const MAX_GRACE_PERIOD: f64 = 60.0;

/// Identifier of a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time limit in seconds
    #[serde(default)]
    pub cpu_time: Option<f64>,

    /// Wall clock time limit in seconds
    #[serde(default)]
    pub wall_time: Option<f64>,

    /// Memory limit in kilobytes
    #[serde(default)]
    pub memory: Option<u64>,

    /// Stack size limit in kilobytes
    #[serde(default)]
    pub stack: Option<u64>,

    /// Maximum number of processes/threads
    #[serde(default)]
    pub max_processes: Option<u32>,

    /// Maximum size of any file written inside the sandbox, in kilobytes
    #[serde(default)]
    pub max_file_size: Option<u64>,

    /// Maximum open files
    #[serde(default)]
    pub max_open_files: Option<u32>,

    /// Maximum captured bytes per output stream (stdout and stderr separately)
    #[serde(default)]
    pub output_limit: Option<u64>,

    /// Time allowed between SIGTERM and SIGKILL, in seconds
    #[serde(default)]
    pub grace_period: Option<f64>,

    /// CPU quota as a fraction of cores (0.5 = half a core)
    #[serde(default)]
    pub cpus: Option<f64>,

    /// Whether outbound network access is allowed
    #[serde(default)]
    pub network: Option<bool>,
}

impl ResourceLimits {
    /// 1 kilobyte in kilobytes
    pub const KB: u64 = 1;
    /// 1 megabyte in kilobytes
    pub const MB: u64 = 1024;
    /// 1 gigabyte in kilobytes
    pub const GB: u64 = 1024 * 1024;

    /// Create new resource limits populated with the built-in defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits with every field unset, useful as an override set
    pub fn unset() -> Self {
        Self {
            cpu_time: None,
            wall_time: None,
            memory: None,
            stack: None,
            max_processes: None,
            max_file_size: None,
            max_open_files: None,
            output_limit: None,
            grace_period: None,
            cpus: None,
            network: None,
        }
    }

    /// Ceilings applied to every job unless configured otherwise.
    ///
    /// 30 seconds of wall time and 512 MB of memory.
    pub fn ceiling() -> Self {
        Self {
            cpu_time: Some(30.0),
            wall_time: Some(30.0),
            memory: Some(512 * Self::MB),
            output_limit: Some(64 * 1024 * 1024),
            grace_period: Some(5.0),
            ..Self::unset()
        }
    }

    /// Set the CPU time limit in seconds
    pub fn with_cpu_time(mut self, seconds: f64) -> Self {
        self.cpu_time = Some(seconds);
        self
    }

    /// Set the wall clock time limit in seconds
    pub fn with_wall_time(mut self, seconds: f64) -> Self {
        self.wall_time = Some(seconds);
        self
    }

    /// Set the memory limit in kilobytes
    pub fn with_memory(mut self, kb: u64) -> Self {
        self.memory = Some(kb);
        self
    }

    /// Set the stack size limit in kilobytes
    pub fn with_stack(mut self, kb: u64) -> Self {
        self.stack = Some(kb);
        self
    }

    /// Set the maximum number of processes
    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.max_processes = Some(count);
        self
    }

    /// Set the per-stream output cap in bytes
    pub fn with_output_limit(mut self, bytes: u64) -> Self {
        self.output_limit = Some(bytes);
        self
    }

    /// Set the grace period in seconds
    pub fn with_grace_period(mut self, seconds: f64) -> Self {
        self.grace_period = Some(seconds);
        self
    }

    /// Allow or deny network access
    pub fn with_network(mut self, allowed: bool) -> Self {
        self.network = Some(allowed);
        self
    }

    /// Apply overrides from another ResourceLimits, preferring values from `overrides`
    ///
    /// Returns a new ResourceLimits with values from `overrides` taking precedence
    /// over values from `self` when both are present.
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu_time: overrides.cpu_time.or(self.cpu_time),
            wall_time: overrides.wall_time.or(self.wall_time),
            memory: overrides.memory.or(self.memory),
            stack: overrides.stack.or(self.stack),
            max_processes: overrides.max_processes.or(self.max_processes),
            max_file_size: overrides.max_file_size.or(self.max_file_size),
            max_open_files: overrides.max_open_files.or(self.max_open_files),
            output_limit: overrides.output_limit.or(self.output_limit),
            grace_period: overrides.grace_period.or(self.grace_period),
            cpus: overrides.cpus.or(self.cpus),
            network: overrides.network.or(self.network),
        }
    }

    /// Clamp every limit to the matching field of `ceiling`.
    ///
    /// An unset limit becomes the ceiling, so a ceiling can never be escaped by
    /// leaving a field empty. Network access is only kept when the ceiling
    /// does not forbid it.
    pub fn clamp_to(&self, ceiling: &ResourceLimits) -> ResourceLimits {
        fn min_f64(value: Option<f64>, max: Option<f64>) -> Option<f64> {
            match (value, max) {
                (Some(v), Some(m)) => Some(v.min(m)),
                (None, m) => m,
                (v, None) => v,
            }
        }
        fn min_ord<T: Ord>(value: Option<T>, max: Option<T>) -> Option<T> {
            match (value, max) {
                (Some(v), Some(m)) => Some(v.min(m)),
                (None, m) => m,
                (v, None) => v,
            }
        }

        ResourceLimits {
            cpu_time: min_f64(self.cpu_time, ceiling.cpu_time),
            wall_time: min_f64(self.wall_time, ceiling.wall_time),
            memory: min_ord(self.memory, ceiling.memory),
            stack: min_ord(self.stack, ceiling.stack),
            max_processes: min_ord(self.max_processes, ceiling.max_processes),
            max_file_size: min_ord(self.max_file_size, ceiling.max_file_size),
            max_open_files: min_ord(self.max_open_files, ceiling.max_open_files),
            output_limit: min_ord(self.output_limit, ceiling.output_limit),
            grace_period: min_f64(self.grace_period, ceiling.grace_period),
            cpus: min_f64(self.cpus, ceiling.cpus),
            network: match ceiling.network {
                Some(false) => Some(false),
                _ => self.network,
            },
        }
    }

    /// Wall clock limit as a duration.
    ///
    /// Every job has a deadline: an unset or invalid limit falls back to
    /// [`FALLBACK_WALL_TIME`] and anything longer than [`MAX_WALL_TIME`] is
    /// capped.
    pub fn wall_time_duration(&self) -> Duration {
        let secs = self
            .wall_time
            .filter(|s| s.is_finite() && *s >= 0.0)
            .unwrap_or(FALLBACK_WALL_TIME);
        bounded_secs(secs, MAX_WALL_TIME)
    }

    /// Grace period as a duration, falling back to [`DEFAULT_GRACE_PERIOD`]
    pub fn grace_duration(&self) -> Duration {
        let secs = self
            .grace_period
            .filter(|s| s.is_finite() && *s >= 0.0)
            .unwrap_or(DEFAULT_GRACE_PERIOD);
        bounded_secs(secs, MAX_GRACE_PERIOD)
    }

    /// Output cap in bytes; `usize::MAX` when unset
    pub fn output_cap(&self) -> usize {
        self.output_limit
            .map(|b| usize::try_from(b).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX)
    }

    /// Whether network access is allowed (denied unless explicitly enabled)
    pub fn network_allowed(&self) -> bool {
        self.network.unwrap_or(false)
    }
}

fn bounded_secs(secs: f64, max: f64) -> Duration {
    Duration::try_from_secs_f64(secs.min(max)).unwrap_or_else(|_| Duration::from_secs_f64(max))
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time: Some(5.0),
            wall_time: Some(10.0),
            memory: Some(131072),      // 128 MB
            stack: Some(65536),        // 64 MB
            max_processes: Some(50),
            max_file_size: Some(1024), // 1 MB
            max_open_files: Some(64),
            output_limit: Some(1024 * 1024),
            grace_period: Some(DEFAULT_GRACE_PERIOD),
            cpus: Some(0.5),
            network: Some(false),
        }
    }
}

/// A request to execute a piece of source code
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Language identifier (matched against profile ids and aliases)
    pub language: String,

    /// Source code payload
    pub source: Vec<u8>,

    /// Data fed to the program's stdin
    pub stdin: Option<Vec<u8>>,

    /// Per-request limit overrides
    pub limits: Option<ResourceLimits>,

    /// Caller-supplied wall clock timeout; takes precedence over `limits.wall_time`
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, source: impl Into<Vec<u8>>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: None,
            limits: None,
            timeout: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The program ran to completion (any exit code)
    Completed,

    /// The wall clock or CPU limit was exceeded
    #[serde(rename = "timeout")]
    TimedOut,

    /// The job was cancelled while running
    Killed,

    /// The orchestrator or sandbox failed
    InternalError,
}

/// Error taxonomy shared by submission errors and execution results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QueueFull,
    UnsupportedLanguage,
    SandboxCreationFailed,
    LaunchFailure,
    TimedOut,
    Killed,
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::UnsupportedLanguage => "unsupported_language",
            ErrorKind::SandboxCreationFailed => "sandbox_creation_failed",
            ErrorKind::LaunchFailure => "launch_failure",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Killed => "killed",
            ErrorKind::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a job as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    TimedOut,
    Killed,
    Crashed,
    /// Withdrawn before it started; no result is produced
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Final status implied by a result's termination reason
    pub fn from_reason(reason: TerminationReason) -> Self {
        match reason {
            TerminationReason::Completed => JobStatus::Completed,
            TerminationReason::TimedOut => JobStatus::TimedOut,
            TerminationReason::Killed => JobStatus::Killed,
            TerminationReason::InternalError => JobStatus::Crashed,
        }
    }
}

/// Result of an execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub job_id: JobId,

    /// Profile id the job ran under
    pub language: String,

    pub reason: TerminationReason,

    /// Set for every reason other than `Completed`
    pub error: Option<ErrorKind>,

    /// Human-readable detail for `error`, or the sandbox's own message
    pub message: Option<String>,

    /// Exit code if the program exited normally
    pub exit_code: Option<i32>,

    /// Signal number if the program was killed by a signal
    pub signal: Option<i32>,

    /// Captured standard output, capped at the output limit
    #[serde(serialize_with = "serialize_lossy")]
    pub stdout: Vec<u8>,

    /// Captured standard error, capped at the output limit
    #[serde(serialize_with = "serialize_lossy")]
    pub stderr: Vec<u8>,

    pub stdout_truncated: bool,

    pub stderr_truncated: bool,

    /// Wall clock time used in seconds
    pub wall_time: f64,

    /// CPU time used in seconds, when the sandbox reports it
    pub cpu_time: Option<f64>,

    /// Peak memory usage in kilobytes, when the sandbox reports it
    pub peak_memory: Option<u64>,

    /// Secondary status indicating which limit was exceeded (if any)
    pub limit_exceeded: LimitExceeded,
}

impl ExecutionResult {
    /// Result for a job that never got to run its program
    pub fn failure(
        job_id: JobId,
        language: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        let reason = match kind {
            ErrorKind::TimedOut => TerminationReason::TimedOut,
            ErrorKind::Killed => TerminationReason::Killed,
            _ => TerminationReason::InternalError,
        };
        Self {
            job_id,
            language: language.into(),
            reason,
            error: Some(kind),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Check if the execution was successful (completed with exit code 0)
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.reason == TerminationReason::Completed && self.exit_code == Some(0)
    }

    /// Whether either output stream hit the cap
    #[must_use]
    pub fn output_truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            job_id: JobId::new(),
            language: String::new(),
            reason: TerminationReason::Completed,
            error: None,
            message: None,
            exit_code: None,
            signal: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            wall_time: 0.0,
            cpu_time: None,
            peak_memory: None,
            limit_exceeded: LimitExceeded::NotExceeded,
        }
    }
}

fn serialize_lossy<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

/// Secondary status indicating which resource limit was exceeded.
/// This provides more detail beyond the termination reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LimitExceeded {
    /// No limit was exceeded
    #[default]
    #[serde(rename = "none")]
    NotExceeded,

    /// CPU time limit exceeded (TLE)
    #[serde(rename = "time")]
    Time,

    /// Wall clock time limit exceeded
    #[serde(rename = "wall_time")]
    WallTime,

    /// Memory limit exceeded (MLE)
    #[serde(rename = "memory")]
    Memory,

    /// Output limit exceeded (OLE)
    #[serde(rename = "output")]
    Output,
}

impl LimitExceeded {
    /// Infer which limit was exceeded from a sandbox's message field
    pub fn from_message(message: Option<&str>) -> Self {
        let Some(msg) = message else {
            return LimitExceeded::NotExceeded;
        };

        let msg_lower = msg.to_lowercase();

        if msg_lower.contains("time limit") {
            if msg_lower.contains("wall") {
                LimitExceeded::WallTime
            } else {
                LimitExceeded::Time
            }
        } else if msg_lower.contains("memory") || msg_lower.contains("out of memory") {
            LimitExceeded::Memory
        } else if msg_lower.contains("output") {
            LimitExceeded::Output
        } else {
            LimitExceeded::NotExceeded
        }
    }

    /// Check if any limit was exceeded
    #[must_use]
    pub fn is_exceeded(&self) -> bool {
        !matches!(self, LimitExceeded::NotExceeded)
    }

    /// Whether this is one of the time limits
    #[must_use]
    pub fn is_time(&self) -> bool {
        matches!(self, LimitExceeded::Time | LimitExceeded::WallTime)
    }
}

/// Configuration for a directory mount inside a sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Source path on the host
    pub source: String,

    /// Target path in the sandbox
    pub target: String,

    /// Whether the mount is read-write (default: read-only)
    #[serde(default)]
    pub writable: bool,

    /// Whether this mount is optional (don't fail if source doesn't exist)
    #[serde(default)]
    pub optional: bool,
}
