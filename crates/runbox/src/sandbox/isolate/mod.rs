//! IOI Isolate backend
//!
//! Each job gets its own box, initialized on demand from a bounded pool of
//! box IDs reserved for runbox and cleaned up on teardown.
//!
//! References for Isolate's CLI arguments and meta-files:
//! - https://www.ucw.cz/isolate/isolate.1.html
//! - https://github.com/ioi/isolate

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

pub use crate::sandbox::isolate::command::{IsolateAction, IsolateCommand};
pub use crate::sandbox::isolate::meta::{IsolateStatus, MetaFile, MetaParseError};
use crate::config::{IsolateConfig, RuntimeProfile};
use crate::sandbox::{
    LaunchCommand, SandboxBackend, SandboxError, SandboxHandle, SandboxReport, resolve_command,
    run_tool, validate_mounts,
};
use crate::types::ResourceLimits;

mod command;
mod meta;

/// Working directory of the job inside a box
const BOX_WORKDIR: &str = "/box";

const META_FILE: &str = "meta.txt";

/// Attempt to set up the cgroup v2 hierarchy for isolate.
///
/// In container environments, `isolate-cg-keeper` (the systemd service that
/// normally manages isolate's cgroup) is not available. This function replicates
/// its job: creating the cgroup directory at `cg_root` and enabling the memory
/// and pids controllers so that per-box child cgroups work.
///
/// Returns `Ok(true)` if cgroups are ready, `Ok(false)` if setup failed and the
/// caller should fall back to non-cgroup mode (RLIMIT_AS).
pub fn prepare_cgroup(cg_root: &Path) -> Result<bool, SandboxError> {
    let cg_base = Path::new("/sys/fs/cgroup");

    let controllers_path = cg_base.join("cgroup.controllers");
    if !controllers_path.exists() {
        return Ok(false);
    }

    let controllers = fs::read_to_string(&controllers_path)?;
    if !controllers.split_whitespace().any(|c| c == "memory") {
        return Ok(false);
    }

    if cg_root.exists() {
        let subtree = cg_root.join("cgroup.subtree_control");
        if let Ok(content) = fs::read_to_string(&subtree)
            && content.split_whitespace().any(|c| c == "memory")
        {
            return Ok(true);
        }
    }

    // cgroup v2's "no internal process" rule prevents enabling controllers
    // in a cgroup that has processes directly in it.
    let init_cg = cg_base.join("init");
    if !init_cg.exists() {
        fs::create_dir(&init_cg)?;
    }
    fs::write(init_cg.join("cgroup.procs"), std::process::id().to_string())?;

    fs::write(cg_base.join("cgroup.subtree_control"), "+memory +pids")?;

    if !cg_root.exists() {
        fs::create_dir(cg_root)?;
    }

    fs::write(cg_root.join("cgroup.subtree_control"), "+memory +pids")?;

    Ok(true)
}

/// Box IDs not currently handed out
#[derive(Debug)]
struct BoxIdPool {
    free: Mutex<VecDeque<u32>>,
}

impl BoxIdPool {
    fn new(first: u32, count: u32) -> Self {
        Self {
            free: Mutex::new((first..first.saturating_add(count)).collect()),
        }
    }

    fn acquire(&self) -> Option<u32> {
        self.free.lock().pop_front()
    }

    /// Take a specific ID if it is free
    fn take(&self, id: u32) -> bool {
        let mut free = self.free.lock();
        match free.iter().position(|&f| f == id) {
            Some(index) => {
                free.remove(index);
                true
            }
            None => false,
        }
    }

    fn release(&self, id: u32) {
        self.free.lock().push_back(id);
    }

    fn available(&self) -> usize {
        self.free.lock().len()
    }
}

#[derive(Debug)]
pub struct IsolateBackend {
    config: IsolateConfig,
    isolate_path: PathBuf,
    cgroup: bool,
    boxes: BoxIdPool,
}

impl IsolateBackend {
    /// Create the backend, falling back to RLIMIT_AS memory limiting when
    /// cgroup mode is requested but unavailable
    pub fn new(config: IsolateConfig) -> Self {
        let cgroup = config.cgroup
            && match prepare_cgroup(&config.cg_root) {
                Ok(true) => {
                    debug!("cgroup hierarchy ready");
                    true
                }
                Ok(false) => {
                    warn!(
                        "cgroup support unavailable (memory controller not found), falling back to RLIMIT_AS"
                    );
                    false
                }
                Err(e) => {
                    warn!("cgroup setup failed: {e}, falling back to RLIMIT_AS memory limiting");
                    false
                }
            };

        Self {
            isolate_path: config.isolate_binary(),
            boxes: BoxIdPool::new(config.first_box_id, config.box_count),
            cgroup,
            config,
        }
    }

    /// Number of box IDs not in use
    pub fn available(&self) -> usize {
        self.boxes.available()
    }

    fn command(&self, box_id: u32, action: IsolateAction) -> IsolateCommand {
        IsolateCommand::new(&self.isolate_path, box_id)
            .action(action)
            .cgroup(self.cgroup)
    }

    async fn cleanup_box(&self, box_id: u32) -> Result<(), SandboxError> {
        let output = run_tool(&self.command(box_id, IsolateAction::Cleanup).build()).await?;
        if !output.status.success() {
            return Err(SandboxError::DestroyFailed {
                name: format!("box {box_id}"),
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for IsolateBackend {
    fn name(&self) -> &'static str {
        "isolate"
    }

    #[instrument(skip(self, profile, _limits))]
    async fn create(
        &self,
        name: &str,
        profile: &RuntimeProfile,
        _limits: &ResourceLimits,
    ) -> Result<SandboxHandle, SandboxError> {
        validate_mounts(&self.config.sandbox_mounts)?;
        validate_mounts(&profile.mounts)?;

        let box_id = self.boxes.acquire().ok_or(SandboxError::PoolExhausted)?;

        let output = match run_tool(&self.command(box_id, IsolateAction::Init).build()).await {
            Ok(output) => output,
            Err(e) => {
                self.boxes.release(box_id);
                return Err(e);
            }
        };

        if !output.status.success() {
            self.boxes.release(box_id);
            return Err(SandboxError::CreateFailed {
                name: name.to_owned(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let box_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        if !box_path.exists() {
            self.boxes.release(box_id);
            return Err(SandboxError::CreateFailed {
                name: name.to_owned(),
                message: format!("box path does not exist: {}", box_path.display()),
            });
        }

        debug!(box_id, ?box_path, "box initialized");

        // The meta file lives next to the box directory, outside the part
        // mounted into the sandbox.
        Ok(
            SandboxHandle::new(name, box_path.join("box"), BOX_WORKDIR, box_path)
                .with_slot(box_id),
        )
    }

    fn launch_command(
        &self,
        handle: &SandboxHandle,
        profile: &RuntimeProfile,
        limits: &ResourceLimits,
    ) -> Result<LaunchCommand, SandboxError> {
        let box_id = handle
            .slot()
            .ok_or_else(|| SandboxError::CommandFailed(format!("{} has no box id", handle.name())))?;

        let mut entrypoint = profile.expand_entrypoint(handle.workdir());
        resolve_command(&mut entrypoint)?;

        let mut cmd = self
            .command(box_id, IsolateAction::Run)
            .limits(limits.clone())
            .mounts(self.config.sandbox_mounts.iter().cloned())
            .mounts(profile.mounts.iter().cloned())
            .env("PATH", &profile.path)
            .env("HOME", BOX_WORKDIR)
            .meta_file(handle.state_dir().join(META_FILE))
            .working_dir(BOX_WORKDIR)
            .command(entrypoint);
        for (key, value) in &profile.env {
            cmd = cmd.env(key, value);
        }

        let args = cmd.build();
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| SandboxError::CommandFailed("empty command arguments".to_owned()))?;
        Ok(LaunchCommand::new(program).args(rest))
    }

    async fn report(&self, handle: &SandboxHandle) -> SandboxReport {
        match MetaFile::load(handle.state_dir().join(META_FILE)).await {
            Ok(meta) => meta.to_report(),
            Err(e) => SandboxReport {
                internal_error: true,
                message: Some(format!("no meta file produced: {e}")),
                ..Default::default()
            },
        }
    }

    #[instrument(skip(self, handle), fields(sandbox = %handle.name()))]
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let Some(box_id) = handle.slot() else {
            return Ok(());
        };
        self.cleanup_box(box_id).await?;
        self.boxes.release(box_id);
        debug!(box_id, "box cleaned up");
        Ok(())
    }

    /// Box IDs are reserved for runbox by configuration, so any initialized
    /// box whose ID is free in the pool is an orphan. The prefix and live set
    /// are implied by the pool.
    async fn sweep(&self, _prefix: &str, _live: &HashSet<String>) -> Result<usize, SandboxError> {
        let first = self.config.first_box_id;
        let mut removed = 0;
        for box_id in first..first.saturating_add(self.config.box_count) {
            if !self.boxes.take(box_id) {
                continue;
            }
            if self.config.box_root.join(box_id.to_string()).exists() {
                match self.cleanup_box(box_id).await {
                    Ok(()) => {
                        debug!(box_id, "cleaned up orphaned box");
                        removed += 1;
                    }
                    Err(e) => warn!(box_id, error = %e, "failed to clean up orphaned box"),
                }
            }
            self.boxes.release(box_id);
        }
        Ok(removed)
    }
}
