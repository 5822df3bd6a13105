//! Integration tests for runbox
//!
//! Most tests drive the `local` backend and need nothing beyond `/bin/sh` and
//! coreutils. Tests for the isolate and docker backends need the respective
//! tools and are compiled only with the `integration-tests` feature:
//!    cargo test -p runbox --features integration-tests -- --include-ignored

use std::path::Path;
use std::time::Duration;

use runbox::{Config, ExecutionRequest, Orchestrator, ResourceLimits};
use tempfile::TempDir;

mod config_loading;
#[cfg(feature = "integration-tests")]
mod docker;
#[cfg(feature = "integration-tests")]
mod isolate;
mod lifecycle;
mod meta_file_fixtures;
mod output_cap;
mod queue;
mod timeouts;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// A shell "language": the source is a script run by /bin/sh
const SHELL_PROFILE: &str = r#"
name_prefix = "runbox-it-"

[backend]
kind = "local"

[reaper]
enabled = false

[default_limits]
cpu_time = 10.0
wall_time = 10.0
memory = 1048576
max_file_size = 10240
max_open_files = 64
output_limit = 1048576
grace_period = 0.5

[max_limits]
cpu_time = 30.0
wall_time = 30.0
memory = 2097152
output_limit = 67108864
grace_period = 5.0
network = false

[languages.sh]
name = "POSIX shell"
aliases = ["shell"]
entrypoint = ["/bin/sh", "{source}"]
source_name = "main.sh"
"#;

/// Local-backend config whose scratch root lives in `scratch`
pub(crate) fn test_config(scratch: &Path) -> Config {
    let mut config = Config::parse_toml(SHELL_PROFILE).expect("shell profile should parse");
    config.backend.local.scratch_root = scratch.to_path_buf();
    config
}

/// Orchestrator over a fresh scratch directory
pub(crate) fn local_orchestrator(tweak: impl FnOnce(&mut Config)) -> (Orchestrator, TempDir) {
    let scratch = tempfile::tempdir().expect("failed to create scratch dir");
    let mut config = test_config(scratch.path());
    tweak(&mut config);
    (Orchestrator::start(config), scratch)
}

pub(crate) fn sh(script: &str) -> ExecutionRequest {
    ExecutionRequest::new("sh", script)
}

pub(crate) fn sh_with_timeout(script: &str, secs: f64) -> ExecutionRequest {
    sh(script).with_timeout(Duration::from_secs_f64(secs))
}

pub(crate) fn sh_with_limits(script: &str, limits: ResourceLimits) -> ExecutionRequest {
    sh(script).with_limits(limits)
}

/// Entries left in a scratch directory
pub(crate) fn scratch_entries(scratch: &Path) -> Vec<String> {
    std::fs::read_dir(scratch)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

/// Whether a process is gone, polling briefly for the reaping parent
pub(crate) async fn process_gone(pid: u32) -> bool {
    for _ in 0..50 {
        let status = std::fs::read_to_string(format!("/proc/{pid}/stat"));
        match status {
            Err(_) => return true,
            // A zombie has already been killed
            Ok(stat) if stat.rsplit(')').next().is_some_and(|s| s.trim_start().starts_with('Z')) => {
                return true;
            }
            Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    false
}
