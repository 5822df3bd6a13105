//! Command builder for the Isolate CLI

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{MountConfig, ResourceLimits};

/// Builder for Isolate command-line arguments
#[derive(Debug)]
pub struct IsolateCommand {
    isolate_path: PathBuf,
    /// One of --init, --run, --cleanup
    action: IsolateAction,
    /// -b, --box-id
    box_id: u32,
    limits: ResourceLimits,
    mounts: Vec<MountConfig>,
    /// -E, --env (sorted for stable argument order)
    env: BTreeMap<String, String>,
    /// -M, --meta
    meta_file: Option<PathBuf>,
    working_dir: Option<String>,
    command: Vec<String>,
    cgroup: bool,
}

impl IsolateCommand {
    pub fn new(isolate_path: impl Into<PathBuf>, box_id: u32) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            action: IsolateAction::Run,
            box_id,
            limits: ResourceLimits::unset(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            meta_file: None,
            working_dir: None,
            command: Vec::new(),
            cgroup: false,
        }
    }

    pub fn action(mut self, action: IsolateAction) -> Self {
        self.action = action;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn mounts(mut self, mounts: impl IntoIterator<Item = MountConfig>) -> Self {
        self.mounts.extend(mounts);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the meta file path for execution results
    pub fn meta_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.meta_file = Some(path.into());
        self
    }

    /// Set the working directory inside the sandbox
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command(mut self, cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Enable cgroup support for memory limiting
    pub fn cgroup(mut self, enable: bool) -> Self {
        self.cgroup = enable;
        self
    }

    /// Build the command-line arguments
    ///
    /// Consumes self to avoid cloning the command vector. Standard streams
    /// are not redirected; the job inherits isolate's own stdio.
    pub fn build(self) -> Vec<String> {
        let mut args = vec![self.isolate_path.to_string_lossy().into_owned()];

        args.push(format!("--box-id={}", self.box_id));

        if self.cgroup {
            args.push("--cg".to_owned());
        }

        match self.action {
            IsolateAction::Init => {
                args.push("--init".to_owned());
            }
            IsolateAction::Cleanup => {
                args.push("--cleanup".to_owned());
            }
            IsolateAction::Run => {
                args.push("--run".to_owned());

                let limits = &self.limits;
                if let Some(time) = limits.cpu_time {
                    args.push(format!("--time={time}"));
                }
                if let Some(wall_time) = limits.wall_time {
                    args.push(format!("--wall-time={wall_time}"));
                }
                if let Some(grace) = limits.grace_period {
                    args.push(format!("--extra-time={grace}"));
                }
                if let Some(memory) = limits.memory {
                    if self.cgroup {
                        args.push(format!("--cg-mem={memory}"));
                    } else {
                        args.push(format!("--mem={memory}"));
                    }
                }
                if let Some(stack) = limits.stack {
                    args.push(format!("--stack={stack}"));
                }
                if let Some(procs) = limits.max_processes {
                    args.push(format!("--processes={procs}"));
                }
                if let Some(fsize) = limits.max_file_size {
                    args.push(format!("--fsize={fsize}"));
                }
                if let Some(open_files) = limits.max_open_files {
                    args.push(format!("--open-files={open_files}"));
                }
                if limits.network_allowed() {
                    args.push("--share-net".to_owned());
                }

                for mount in &self.mounts {
                    // Skip optional mounts whose source doesn't exist
                    if mount.optional && !Path::new(&mount.source).exists() {
                        continue;
                    }
                    let mut opts = String::new();
                    if mount.writable {
                        opts.push_str(":rw");
                    }
                    if mount.optional {
                        opts.push_str(":maybe");
                    }
                    args.push(format!("--dir={}={}{}", mount.target, mount.source, opts));
                }

                for (key, value) in &self.env {
                    args.push(format!("--env={key}={value}"));
                }

                if let Some(ref meta) = self.meta_file {
                    args.push(format!("--meta={}", meta.display()));
                }

                if let Some(ref dir) = self.working_dir {
                    args.push(format!("--chdir={dir}"));
                }

                args.push("--".to_owned());
                args.extend(self.command);
            }
        }

        args
    }

    pub fn box_id(&self) -> u32 {
        self.box_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateAction {
    /// Initialize a new box
    Init,
    /// Run a command in the box
    Run,
    /// Clean up a box
    Cleanup,
}
