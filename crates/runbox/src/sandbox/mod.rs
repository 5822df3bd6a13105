//! Sandbox backends and lifecycle.
//!
//! A [`SandboxBackend`] knows how to create, populate, run inside and destroy
//! one kind of isolated environment. The [`SandboxLauncher`] wraps a backend
//! and guarantees each sandbox it hands out is torn down exactly once, while
//! the reaper sweeps anything a crashed process left behind.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

pub use crate::sandbox::docker::DockerBackend;
pub use crate::sandbox::isolate::{IsolateBackend, prepare_cgroup};
pub use crate::sandbox::launcher::{ReapSummary, SandboxGuard, SandboxLauncher, SandboxStats};
pub use crate::sandbox::local::LocalBackend;
use crate::config::{BackendKind, Config, RuntimeProfile};
use crate::types::{ErrorKind, LimitExceeded, MountConfig, ResourceLimits};

pub mod docker;
pub mod isolate;
mod launcher;
pub mod local;

/// Errors that occur during sandbox operations
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create sandbox {name}: {message}")]
    CreateFailed { name: String, message: String },

    #[error("failed to destroy sandbox {name}: {message}")]
    DestroyFailed { name: String, message: String },

    #[error("sandbox command failed: {0}")]
    CommandFailed(String),

    #[error("failed to spawn sandbox tool: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("no free sandbox slots")]
    PoolExhausted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("mount source path does not exist: {0}")]
    MountSourceNotFound(String),

    #[error("language '{0}' has no image configured")]
    MissingImage(String),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::CreateFailed { .. }
            | SandboxError::PoolExhausted
            | SandboxError::MountSourceNotFound(_)
            | SandboxError::MissingImage(_) => ErrorKind::SandboxCreationFailed,
            _ => ErrorKind::InternalError,
        }
    }
}

/// A live isolated environment.
///
/// Owned by one [`SandboxGuard`]; backends only ever see it by reference.
#[derive(Debug)]
pub struct SandboxHandle {
    /// Backend-visible name, always starting with the configured prefix
    name: String,

    /// Backend slot (isolate box ID), if the backend uses one
    slot: Option<u32>,

    /// Host path of the directory the program sees as its work directory
    root: PathBuf,

    /// Path of the work directory as seen from inside the sandbox
    workdir: String,

    /// Host directory for backend bookkeeping, not visible to the program
    state_dir: PathBuf,

    torn_down: AtomicBool,
}

impl SandboxHandle {
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        workdir: impl Into<String>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            slot: None,
            root: root.into(),
            workdir: workdir.into(),
            state_dir: state_dir.into(),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn with_slot(mut self, slot: u32) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Get the host path to a file inside the work directory
    ///
    /// Returns an error if the path contains path traversal attempts.
    pub fn file_path(&self, name: &str) -> Result<PathBuf, SandboxError> {
        if name.is_empty() || name.contains("..") || name.starts_with('/') {
            return Err(SandboxError::InvalidPath(format!(
                "path traversal not allowed: {name}"
            )));
        }
        Ok(self.root.join(name))
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Mark the handle torn down. Returns true only for the first caller.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }
}

/// Resource limits applied to the launched process itself (via setrlimit)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rlimit {
    /// Address space in bytes
    AddressSpace,
    /// CPU time in seconds
    CpuTime,
    /// Largest file the process may write, in bytes
    FileSize,
    /// Number of open file descriptors
    OpenFiles,
    /// Stack size in bytes
    Stack,
    /// Processes for the invoking user
    Processes,
}

/// A fully resolved command that starts the job inside its sandbox
#[derive(Debug, Clone, Default)]
pub struct LaunchCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: HashMap<String, String>,
    /// Start from an empty environment
    pub clear_env: bool,
    pub current_dir: Option<PathBuf>,
    /// (resource, soft, hard)
    pub rlimits: Vec<(Rlimit, u64, u64)>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn clear_env(mut self) -> Self {
        self.clear_env = true;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn rlimit(mut self, resource: Rlimit, soft: u64, hard: u64) -> Self {
        self.rlimits.push((resource, soft, hard));
        self
    }
}

/// What a backend learned about the finished job on its own
#[derive(Debug, Clone, Default)]
pub struct SandboxReport {
    /// CPU time used in seconds, `None` when the backend does not measure it
    pub cpu_time: Option<f64>,

    /// Peak memory usage in kilobytes, `None` when the backend does not measure it
    pub peak_memory: Option<u64>,

    /// When set, `exit_code` and `signal` describe the job's program rather
    /// than the launcher process the supervisor watched
    pub reports_exit_status: bool,

    pub exit_code: Option<i32>,

    pub signal: Option<i32>,

    /// The backend enforced a time limit itself
    pub timed_out: bool,

    pub limit_exceeded: LimitExceeded,

    pub message: Option<String>,

    /// The backend itself failed while running the job
    pub internal_error: bool,
}

/// Capability set of one sandboxing technology
#[async_trait]
pub trait SandboxBackend: Send + Sync + 'static {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    /// Create an isolated environment named `name` for one job
    async fn create(
        &self,
        name: &str,
        profile: &RuntimeProfile,
        limits: &ResourceLimits,
    ) -> Result<SandboxHandle, SandboxError>;

    /// Write a file into the sandbox work directory
    async fn stage(
        &self,
        handle: &SandboxHandle,
        file: &str,
        content: &[u8],
    ) -> Result<(), SandboxError> {
        let path = handle.file_path(file)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        debug!(?path, len = content.len(), "staged file");
        Ok(())
    }

    /// Build the command that runs the profile's entrypoint inside the sandbox
    fn launch_command(
        &self,
        handle: &SandboxHandle,
        profile: &RuntimeProfile,
        limits: &ResourceLimits,
    ) -> Result<LaunchCommand, SandboxError>;

    /// Collect whatever the backend knows about the finished job
    async fn report(&self, _handle: &SandboxHandle) -> SandboxReport {
        SandboxReport::default()
    }

    /// Release every resource held by the sandbox
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Remove leftover sandboxes named with `prefix` that are not in `live`.
    ///
    /// Returns how many were removed.
    async fn sweep(&self, prefix: &str, live: &HashSet<String>) -> Result<usize, SandboxError>;
}

/// Build the backend selected by the configuration
pub fn build_backend(config: &Config) -> Arc<dyn SandboxBackend> {
    match config.backend.kind {
        BackendKind::Local => Arc::new(LocalBackend::new(config.backend.local.clone())),
        BackendKind::Isolate => Arc::new(IsolateBackend::new(config.backend.isolate.clone())),
        BackendKind::Docker => Arc::new(DockerBackend::new(config.backend.docker.clone())),
    }
}

/// Fresh sandbox name carrying the configured prefix
pub fn sandbox_name(prefix: &str) -> String {
    format!("{prefix}{}", uuid::Uuid::new_v4().simple())
}

/// Validate that all mount source paths exist
///
/// Returns an error if any non-optional mount source path does not exist on the host filesystem.
/// Optional mounts (with `optional: true`) are silently skipped if the source doesn't exist.
pub fn validate_mounts(mounts: &[MountConfig]) -> Result<(), SandboxError> {
    for mount in mounts {
        if mount.optional {
            continue;
        }
        if !Path::new(&mount.source).exists() {
            return Err(SandboxError::MountSourceNotFound(mount.source.clone()));
        }
    }
    Ok(())
}

/// Resolve the program in a command to an absolute path using the host's PATH.
///
/// Isolate uses `execve` which does not search PATH, so commands must be
/// absolute paths or contain a `/`. Commands that already contain a `/` are
/// left unchanged.
pub fn resolve_command(command: &mut [String]) -> Result<(), SandboxError> {
    let Some(first) = command.first_mut() else {
        return Ok(());
    };

    if first.contains('/') {
        return Ok(());
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in path_var.split(':') {
        let candidate = Path::new(dir).join(&*first);
        if candidate.exists() {
            // Canonicalize so the path is reachable inside the sandbox without
            // following symlinks across bind-mount boundaries.
            *first = std::fs::canonicalize(&candidate)
                .unwrap_or(candidate)
                .to_string_lossy()
                .into_owned();
            return Ok(());
        }
    }

    Err(SandboxError::CommandFailed(format!(
        "command '{first}' not found in PATH",
    )))
}

/// Run a backend tool (isolate, docker) to completion and capture its output
pub(crate) async fn run_tool(args: &[String]) -> Result<std::process::Output, SandboxError> {
    let program = args
        .first()
        .ok_or_else(|| SandboxError::CommandFailed("empty command arguments".to_owned()))?;

    debug!(?args, "running sandbox tool");
    Command::new(program)
        .args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(SandboxError::SpawnFailed)
}

/// Remove stale per-sandbox directories under `root`, skipping live ones.
///
/// An entry that cannot be removed is logged and left for the next pass.
/// Returns the number of directories removed.
pub(crate) async fn sweep_dirs(
    root: &Path,
    prefix: &str,
    live: &HashSet<String>,
) -> Result<usize, SandboxError> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(prefix) || live.contains(&name) {
            continue;
        }
        match tokio::fs::remove_dir_all(entry.path()).await {
            Ok(()) => {
                debug!(%name, "removed stale sandbox directory");
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(%name, error = %e, "failed to remove stale sandbox directory"),
        }
    }
    Ok(removed)
}
