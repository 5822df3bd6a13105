use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::config::profile::{DEFAULT_SANDBOX_PATH, RuntimeProfile, SourceName};
use crate::types::{ExecutionRequest, MountConfig, ResourceLimits};

mod loader;
pub mod profile;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../runbox.example.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid source file name '{0}'")]
    InvalidSourceName(String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for runbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Which sandbox backend runs jobs, plus per-backend settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Maximum number of jobs waiting to start
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum number of live sandboxes
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Prefix for sandbox names; the reaper only touches names carrying it
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Default resource limits applied to all executions.
    /// Overridden by language limits, then by request limits.
    #[serde(default)]
    pub default_limits: ResourceLimits,

    /// Hard ceilings; effective limits are clamped to these
    #[serde(default = "ResourceLimits::ceiling")]
    pub max_limits: ResourceLimits,

    /// Runtime profiles keyed by language ID
    #[serde(default)]
    pub languages: HashMap<String, RuntimeProfile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host child processes in a scratch directory (no namespace isolation)
    #[default]
    Local,
    /// IOI Isolate boxes
    Isolate,
    /// One container per job
    Docker,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::Local => "local",
            BackendKind::Isolate => "isolate",
            BackendKind::Docker => "docker",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    #[serde(default)]
    pub local: LocalConfig,

    #[serde(default)]
    pub isolate: IsolateConfig,

    #[serde(default)]
    pub docker: DockerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory holding one scratch directory per sandbox
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    /// Apply `max_processes` as RLIMIT_NPROC.
    ///
    /// The kernel counts every process of the invoking user against this
    /// limit, not just the job's, so it is off unless jobs run as a
    /// dedicated user.
    #[serde(default)]
    pub limit_processes: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            limit_processes: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolateConfig {
    /// Path to the Isolate binary (uses PATH if not specified).
    #[serde(default)]
    pub isolate_path: Option<PathBuf>,

    /// Use cgroup memory limiting instead of RLIMIT_AS.
    ///
    /// When enabled, isolate uses `--cg` and `--cg-mem` which limit actual memory
    /// usage (RSS) rather than virtual address space. This is required for runtimes
    /// like the JVM and Go that map large amounts of virtual memory.
    #[serde(default)]
    pub cgroup: bool,

    /// Cgroup root path for isolate. Must match isolate's `cg_root` config value.
    #[serde(default = "default_cg_root")]
    pub cg_root: PathBuf,

    /// First box ID handed out
    #[serde(default)]
    pub first_box_id: u32,

    /// Number of box IDs available, starting at `first_box_id`
    #[serde(default = "default_box_count")]
    pub box_count: u32,

    /// Directory isolate creates boxes under. Must match isolate's `box_root`.
    #[serde(default = "default_box_root")]
    pub box_root: PathBuf,

    /// Directory mounts applied to every box
    #[serde(default)]
    pub sandbox_mounts: Vec<MountConfig>,
}

impl IsolateConfig {
    /// Get the path to the isolate binary
    pub fn isolate_binary(&self) -> PathBuf {
        self.isolate_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("isolate"))
    }
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            isolate_path: None,
            cgroup: false,
            cg_root: default_cg_root(),
            first_box_id: 0,
            box_count: default_box_count(),
            box_root: default_box_root(),
            sandbox_mounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Path to the docker CLI (uses PATH if not specified)
    #[serde(default)]
    pub docker_path: Option<PathBuf>,

    /// Host directory holding the per-container work directories
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    /// Non-root identity the program runs as
    #[serde(default = "default_docker_user")]
    pub user: String,

    /// Size of the writable /tmp tmpfs
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
}

impl DockerConfig {
    pub fn docker_binary(&self) -> PathBuf {
        self.docker_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("docker"))
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_path: None,
            scratch_root: default_scratch_root(),
            user: default_docker_user(),
            tmpfs_size: default_tmpfs_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweeps
    #[serde(default = "default_reaper_interval")]
    pub interval: u64,
}

impl ReaperConfig {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_reaper_interval(),
        }
    }
}

impl Config {
    /// Create a new config with the embedded example languages
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with no languages, running on the local backend
    pub fn empty() -> Self {
        Self {
            backend: BackendConfig::default(),
            queue_capacity: default_queue_capacity(),
            max_concurrent: default_max_concurrent(),
            name_prefix: default_name_prefix(),
            reaper: ReaperConfig::default(),
            default_limits: ResourceLimits::default(),
            max_limits: ResourceLimits::ceiling(),
            languages: HashMap::new(),
        }
    }

    /// Resolve the limits a job runs under.
    ///
    /// Defaults, then the profile's limits, then the request's overrides and
    /// timeout, all clamped to `max_limits`.
    pub fn effective_limits(
        &self,
        profile: &RuntimeProfile,
        request: &ExecutionRequest,
    ) -> ResourceLimits {
        let mut limits = self.default_limits.clone();
        if let Some(ref profile_limits) = profile.limits {
            limits = limits.with_overrides(profile_limits);
        }
        if let Some(ref overrides) = request.limits {
            limits = limits.with_overrides(overrides);
        }
        if let Some(timeout) = request.timeout {
            limits.wall_time = Some(timeout.as_secs_f64());
        }
        limits.clamp_to(&self.max_limits)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_concurrent() -> usize {
    4
}

fn default_name_prefix() -> String {
    "runbox-".to_owned()
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir().join("runbox")
}

fn default_cg_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/isolate")
}

fn default_box_count() -> u32 {
    16
}

fn default_box_root() -> PathBuf {
    PathBuf::from("/var/local/lib/isolate")
}

fn default_docker_user() -> String {
    "65534:65534".to_owned()
}

fn default_tmpfs_size() -> String {
    "64m".to_owned()
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}
