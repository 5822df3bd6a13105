//! A library for orchestrating sandboxed code execution.
//!
//! runbox accepts untrusted source code in one of several configured
//! languages, runs it inside an isolated sandbox under CPU, memory, wall-clock,
//! process and network limits, and returns a normalized result.
//!
//! # Features
//!
//! - **Bounded job queue**: FIFO submission that rejects instead of blocking when full.
//! - **Runtime profiles**: per-language entrypoint, environment and limits loaded from TOML.
//! - **Pluggable sandboxes**: Docker containers, IOI Isolate boxes, or plain local processes.
//! - **Supervision**: byte-capped output capture, monotonic deadlines, cancellation and
//!   process-group termination with a grace period.
//! - **Guaranteed teardown**: every sandbox is destroyed exactly once, with a
//!   background reaper for anything left behind.

pub use collector::{collect, normalize};
pub use config::{
    BackendKind, Config, ConfigError, EXAMPLE_CONFIG, RuntimeProfile, SourceName,
};
pub use orchestrator::{CancelOutcome, Orchestrator, OrchestratorError};
pub use queue::{JobQueue, QueueError, QueuedJob};
pub use registry::{RegistryError, RuntimeRegistry};
pub use sandbox::{
    LaunchCommand, ReapSummary, SandboxBackend, SandboxError, SandboxGuard, SandboxHandle,
    SandboxLauncher, SandboxReport, SandboxStats, build_backend, prepare_cgroup,
};
pub use supervisor::{Supervision, Supervisor, SupervisorState};
pub use types::{
    ErrorKind, ExecutionRequest, ExecutionResult, JobId, JobStatus, LimitExceeded, MountConfig,
    ResourceLimits, TerminationReason,
};

pub mod collector;
pub mod config;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod sandbox;
pub mod supervisor;
pub mod types;
