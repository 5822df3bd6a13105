//! Docker backend
//!
//! One container per job, created stopped with every limit baked in, then
//! started attached so the supervisor sees the program's stdio through the
//! docker client. The job's scratch directory is bind-mounted read-only at
//! `/code`; `/tmp` is the only writable path.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::config::{DockerConfig, RuntimeProfile};
use crate::sandbox::{
    LaunchCommand, SandboxBackend, SandboxError, SandboxHandle, SandboxReport, run_tool,
    sweep_dirs,
};
use crate::types::{LimitExceeded, ResourceLimits};

/// Mount point of the scratch directory inside the container
const CONTAINER_WORKDIR: &str = "/code";

/// Label carried by every container runbox creates
const SANDBOX_LABEL: &str = "runbox.sandbox";

/// Builder for `docker create` arguments
#[derive(Debug)]
pub struct DockerCreate {
    docker_path: PathBuf,
    name: String,
    image: String,
    limits: ResourceLimits,
    user: Option<String>,
    tmpfs_size: Option<String>,
    bind: Option<(PathBuf, String)>,
    env: BTreeMap<String, String>,
    command: Vec<String>,
}

impl DockerCreate {
    pub fn new(
        docker_path: impl Into<PathBuf>,
        name: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            docker_path: docker_path.into(),
            name: name.into(),
            image: image.into(),
            limits: ResourceLimits::unset(),
            user: None,
            tmpfs_size: None,
            bind: None,
            env: BTreeMap::new(),
            command: Vec::new(),
        }
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn tmpfs_size(mut self, size: impl Into<String>) -> Self {
        self.tmpfs_size = Some(size.into());
        self
    }

    /// Bind-mount a host directory read-only and make it the working directory
    pub fn workdir(mut self, host: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        self.bind = Some((host.into(), target.into()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn command(mut self, cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Vec<String> {
        let mut args = vec![
            self.docker_path.to_string_lossy().into_owned(),
            "create".to_owned(),
            format!("--name={}", self.name),
            format!("--label={SANDBOX_LABEL}=1"),
            "--interactive".to_owned(),
            "--read-only".to_owned(),
            "--cap-drop=ALL".to_owned(),
            "--security-opt=no-new-privileges".to_owned(),
        ];

        let limits = &self.limits;
        if !limits.network_allowed() {
            args.push("--network=none".to_owned());
        }
        if let Some(memory) = limits.memory {
            // No swap: the memory ceiling is the whole budget
            args.push(format!("--memory={memory}k"));
            args.push(format!("--memory-swap={memory}k"));
        }
        if let Some(cpus) = limits.cpus {
            args.push(format!("--cpus={cpus}"));
        }
        if let Some(procs) = limits.max_processes {
            args.push(format!("--pids-limit={procs}"));
        }
        if let Some(cpu_time) = limits.cpu_time {
            let secs = cpu_time.ceil().max(1.0) as u64;
            args.push(format!("--ulimit=cpu={secs}:{}", secs + 1));
        }
        if let Some(fsize) = limits.max_file_size {
            let bytes = fsize.saturating_mul(1024);
            args.push(format!("--ulimit=fsize={bytes}:{bytes}"));
        }
        if let Some(files) = limits.max_open_files {
            args.push(format!("--ulimit=nofile={files}:{files}"));
        }
        if let Some(stack) = limits.stack {
            let bytes = stack.saturating_mul(1024);
            args.push(format!("--ulimit=stack={bytes}:{bytes}"));
        }

        let tmpfs = match self.tmpfs_size {
            Some(size) => format!("--tmpfs=/tmp:rw,nosuid,size={size}"),
            None => "--tmpfs=/tmp:rw,nosuid".to_owned(),
        };
        args.push(tmpfs);

        if let Some(user) = self.user {
            args.push(format!("--user={user}"));
        }

        if let Some((host, target)) = self.bind {
            args.push(format!("--volume={}:{target}:ro", host.display()));
            args.push(format!("--workdir={target}"));
        }

        for (key, value) in &self.env {
            args.push(format!("--env={key}={value}"));
        }

        let mut command = self.command.into_iter();
        if let Some(entrypoint) = command.next() {
            args.push(format!("--entrypoint={entrypoint}"));
        }
        args.push(self.image);
        args.extend(command);

        args
    }
}

#[derive(Debug)]
pub struct DockerBackend {
    config: DockerConfig,
    docker_path: PathBuf,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            docker_path: config.docker_binary(),
            config,
        }
    }

    fn tool(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.docker_path.to_string_lossy().into_owned())
            .chain(args.iter().map(|a| (*a).to_owned()))
            .collect()
    }

    async fn remove_container(&self, name: &str) -> Result<(), SandboxError> {
        let output = run_tool(&self.tool(&["rm", "--force", "--volumes", name])).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Ok(());
        }
        Err(SandboxError::DestroyFailed {
            name: name.to_owned(),
            message: stderr.trim().to_owned(),
        })
    }
}

async fn remove_dir(path: &Path) -> Result<(), SandboxError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Parse `docker inspect` output formatted as "<running> <exit code> <oom killed>"
fn parse_inspect(line: &str) -> SandboxReport {
    let mut fields = line.split_whitespace();
    let running = fields.next() == Some("true");
    let exit_code = fields.next().and_then(|v| v.parse().ok());
    let oom_killed = fields.next() == Some("true");

    SandboxReport {
        reports_exit_status: !running && exit_code.is_some(),
        exit_code: if running { None } else { exit_code },
        limit_exceeded: if oom_killed {
            LimitExceeded::Memory
        } else {
            LimitExceeded::NotExceeded
        },
        message: oom_killed.then(|| "Out of memory".to_owned()),
        ..Default::default()
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, profile, limits))]
    async fn create(
        &self,
        name: &str,
        profile: &RuntimeProfile,
        limits: &ResourceLimits,
    ) -> Result<SandboxHandle, SandboxError> {
        let image = profile
            .image
            .as_deref()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| SandboxError::MissingImage(profile.id.clone()))?;

        let state_dir = self.config.scratch_root.join(name);
        let root = state_dir.join("work");
        tokio::fs::create_dir_all(&root).await?;
        {
            use std::os::unix::fs::PermissionsExt;
            // The container runs as an unprivileged user that must read the source
            tokio::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o755)).await?;
        }

        let mut create = DockerCreate::new(&self.docker_path, name, image)
            .limits(limits.clone())
            .user(&self.config.user)
            .tmpfs_size(&self.config.tmpfs_size)
            .workdir(&root, CONTAINER_WORKDIR)
            .env("HOME", "/tmp")
            .command(profile.expand_entrypoint(CONTAINER_WORKDIR));
        for (key, value) in &profile.env {
            create = create.env(key, value);
        }

        let output = match run_tool(&create.build()).await {
            Ok(output) => output,
            Err(e) => {
                let _ = remove_dir(&state_dir).await;
                return Err(e);
            }
        };
        if !output.status.success() {
            let _ = remove_dir(&state_dir).await;
            return Err(SandboxError::CreateFailed {
                name: name.to_owned(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        debug!(container = %name, %image, "container created");
        Ok(SandboxHandle::new(name, root, CONTAINER_WORKDIR, state_dir))
    }

    fn launch_command(
        &self,
        handle: &SandboxHandle,
        _profile: &RuntimeProfile,
        _limits: &ResourceLimits,
    ) -> Result<LaunchCommand, SandboxError> {
        Ok(LaunchCommand::new(&self.docker_path).args([
            "start",
            "--attach",
            "--interactive",
            handle.name(),
        ]))
    }

    /// Exit status and OOM kill as recorded by the daemon.
    ///
    /// CPU time and peak memory are not reported. The container's cgroup is
    /// gone once it exits and `docker inspect` keeps no usage figures, so
    /// `cpu_time` and `peak_memory` stay `None` for this backend.
    async fn report(&self, handle: &SandboxHandle) -> SandboxReport {
        let args = self.tool(&[
            "inspect",
            "--format={{.State.Running}} {{.State.ExitCode}} {{.State.OOMKilled}}",
            handle.name(),
        ]);
        match run_tool(&args).await {
            Ok(output) if output.status.success() => {
                parse_inspect(&String::from_utf8_lossy(&output.stdout))
            }
            _ => SandboxReport::default(),
        }
    }

    #[instrument(skip(self, handle), fields(container = %handle.name()))]
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.remove_container(handle.name()).await?;
        remove_dir(handle.state_dir()).await
    }

    async fn sweep(&self, prefix: &str, live: &HashSet<String>) -> Result<usize, SandboxError> {
        let filter = format!("--filter=label={SANDBOX_LABEL}");
        let output = run_tool(&self.tool(&["ps", "--all", &filter, "--format={{.Names}}"])).await?;
        if !output.status.success() {
            return Err(SandboxError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }

        let mut removed = 0;
        let stdout = String::from_utf8_lossy(&output.stdout);
        for name in stdout.lines().map(str::trim) {
            if !name.starts_with(prefix) || live.contains(name) {
                continue;
            }
            match self.remove_container(name).await {
                Ok(()) => {
                    debug!(container = %name, "removed orphaned container");
                    removed += 1;
                }
                Err(e) => warn!(container = %name, error = %e, "failed to remove orphaned container"),
            }
        }

        let dirs = sweep_dirs(&self.config.scratch_root, prefix, live).await?;
        Ok(removed + dirs)
    }
}
