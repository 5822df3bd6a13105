//! Local process backend
//!
//! A sandbox is a private scratch directory; the job runs as a child of the
//! orchestrator with a cleared environment, its own process group and
//! setrlimit caps applied before exec. There is no filesystem or network
//! isolation, so this backend is meant for development and tests.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::config::{LocalConfig, RuntimeProfile};
use crate::sandbox::{
    LaunchCommand, Rlimit, SandboxBackend, SandboxError, SandboxHandle, sweep_dirs,
};
use crate::types::ResourceLimits;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    config: LocalConfig,
}

impl LocalBackend {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }
}

/// setrlimit caps for `limits`. Sizes are configured in KiB.
fn rlimits(limits: &ResourceLimits, limit_processes: bool) -> Vec<(Rlimit, u64, u64)> {
    let mut out = Vec::new();
    if let Some(memory) = limits.memory {
        let bytes = memory.saturating_mul(1024);
        out.push((Rlimit::AddressSpace, bytes, bytes));
    }
    if let Some(cpu) = limits.cpu_time {
        // SIGXCPU at the soft limit, SIGKILL one second later
        let secs = cpu.ceil().max(1.0) as u64;
        out.push((Rlimit::CpuTime, secs, secs + 1));
    }
    if let Some(fsize) = limits.max_file_size {
        let bytes = fsize.saturating_mul(1024);
        out.push((Rlimit::FileSize, bytes, bytes));
    }
    if let Some(files) = limits.max_open_files {
        out.push((Rlimit::OpenFiles, u64::from(files), u64::from(files)));
    }
    if let Some(stack) = limits.stack {
        let bytes = stack.saturating_mul(1024);
        out.push((Rlimit::Stack, bytes, bytes));
    }
    if limit_processes && let Some(procs) = limits.max_processes {
        out.push((Rlimit::Processes, u64::from(procs), u64::from(procs)));
    }
    out
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, profile, _limits))]
    async fn create(
        &self,
        name: &str,
        profile: &RuntimeProfile,
        _limits: &ResourceLimits,
    ) -> Result<SandboxHandle, SandboxError> {
        let state_dir = self.config.scratch_root.join(name);
        let root = state_dir.join("work");
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| SandboxError::CreateFailed {
                name: name.to_owned(),
                message: e.to_string(),
            })?;

        let workdir = root.to_string_lossy().into_owned();
        debug!(language = %profile.id, ?root, "local sandbox created");
        Ok(SandboxHandle::new(name, root, workdir, state_dir))
    }

    fn launch_command(
        &self,
        handle: &SandboxHandle,
        profile: &RuntimeProfile,
        limits: &ResourceLimits,
    ) -> Result<LaunchCommand, SandboxError> {
        let mut argv = profile.expand_entrypoint(handle.workdir()).into_iter();
        let program = argv
            .next()
            .ok_or_else(|| SandboxError::CommandFailed("empty entrypoint".to_owned()))?;

        let mut launch = LaunchCommand::new(program)
            .args(argv)
            .clear_env()
            .env("PATH", &profile.path)
            .env("HOME", handle.workdir())
            .env("TMPDIR", handle.workdir())
            .current_dir(handle.root());
        for (key, value) in &profile.env {
            launch = launch.env(key, value);
        }
        for (resource, soft, hard) in rlimits(limits, self.config.limit_processes) {
            launch = launch.rlimit(resource, soft, hard);
        }
        Ok(launch)
    }

    #[instrument(skip(self, handle), fields(sandbox = %handle.name()))]
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        match tokio::fs::remove_dir_all(handle.state_dir()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::DestroyFailed {
                name: handle.name().to_owned(),
                message: e.to_string(),
            }),
        }
    }

    async fn sweep(&self, prefix: &str, live: &HashSet<String>) -> Result<usize, SandboxError> {
        sweep_dirs(&self.config.scratch_root, prefix, live).await
    }
}
