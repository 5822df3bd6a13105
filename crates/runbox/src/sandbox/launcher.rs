//! Sandbox lifecycle ownership.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::RuntimeProfile;
use crate::sandbox::{
    LaunchCommand, SandboxBackend, SandboxError, SandboxHandle, SandboxReport, sandbox_name,
};
use crate::types::ResourceLimits;

/// Counters describing sandbox churn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxStats {
    /// Sandboxes successfully created
    pub created: u64,
    /// First teardown calls made, successful or not
    pub teardowns: u64,
    /// Sandboxes currently tracked as live
    pub live: usize,
    /// Failed teardowns waiting for the reaper
    pub pending_retry: usize,
}

/// Summary of one reaper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Failed teardowns that succeeded on retry
    pub retried: usize,
    /// Orphans removed by the backend sweep
    pub swept: usize,
}

struct Inner {
    backend: Arc<dyn SandboxBackend>,
    prefix: String,
    /// Names of sandboxes created and not yet destroyed
    live: Mutex<HashSet<String>>,
    /// Handles whose teardown failed
    failed: Mutex<Vec<Arc<SandboxHandle>>>,
    created: AtomicU64,
    teardowns: AtomicU64,
}

/// Creates sandboxes through a backend and tracks them until teardown
#[derive(Clone)]
pub struct SandboxLauncher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SandboxLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxLauncher")
            .field("backend", &self.inner.backend.name())
            .field("prefix", &self.inner.prefix)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SandboxLauncher {
    pub fn new(backend: Arc<dyn SandboxBackend>, prefix: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                prefix: prefix.into(),
                live: Mutex::new(HashSet::new()),
                failed: Mutex::new(Vec::new()),
                created: AtomicU64::new(0),
                teardowns: AtomicU64::new(0),
            }),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Create a sandbox for one job. Failures are not retried.
    #[instrument(skip(self, profile, limits), fields(language = %profile.id))]
    pub async fn create(
        &self,
        profile: &RuntimeProfile,
        limits: &ResourceLimits,
    ) -> Result<SandboxGuard, SandboxError> {
        let name = sandbox_name(&self.inner.prefix);
        // Track before the backend sees it so a concurrent sweep leaves it alone
        self.inner.live.lock().insert(name.clone());

        match self.inner.backend.create(&name, profile, limits).await {
            Ok(handle) => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                debug!(sandbox = %name, backend = self.backend_name(), "sandbox created");
                Ok(SandboxGuard {
                    handle: Arc::new(handle),
                    launcher: self.clone(),
                    released: false,
                })
            }
            Err(e) => {
                self.inner.live.lock().remove(&name);
                warn!(sandbox = %name, error = %e, "sandbox creation failed");
                Err(match e {
                    SandboxError::CreateFailed { .. } => e,
                    other => SandboxError::CreateFailed {
                        name,
                        message: other.to_string(),
                    },
                })
            }
        }
    }

    /// Tear a sandbox down. Only the first call per handle reaches the backend.
    ///
    /// Returns `Ok(false)` when the handle was already torn down. A failed
    /// teardown is queued for the reaper and returned as an error.
    pub async fn destroy(&self, handle: &Arc<SandboxHandle>) -> Result<bool, SandboxError> {
        if !handle.begin_teardown() {
            return Ok(false);
        }
        self.inner.teardowns.fetch_add(1, Ordering::Relaxed);

        match self.inner.backend.destroy(handle).await {
            Ok(()) => {
                self.inner.live.lock().remove(handle.name());
                debug!(sandbox = %handle.name(), "sandbox destroyed");
                Ok(true)
            }
            Err(e) => {
                warn!(sandbox = %handle.name(), error = %e, "sandbox teardown failed, queued for reaper");
                self.inner.failed.lock().push(Arc::clone(handle));
                Err(e)
            }
        }
    }

    /// Retry failed teardowns, then sweep orphaned sandboxes
    #[instrument(skip(self))]
    pub async fn reap(&self) -> Result<ReapSummary, SandboxError> {
        let failed: Vec<_> = std::mem::take(&mut *self.inner.failed.lock());
        let mut summary = ReapSummary::default();

        for handle in failed {
            match self.inner.backend.destroy(&handle).await {
                Ok(()) => {
                    self.inner.live.lock().remove(handle.name());
                    summary.retried += 1;
                }
                Err(e) => {
                    warn!(sandbox = %handle.name(), error = %e, "teardown retry failed");
                    self.inner.failed.lock().push(handle);
                }
            }
        }

        let live = self.inner.live.lock().clone();
        summary.swept = self.inner.backend.sweep(&self.inner.prefix, &live).await?;

        if summary.retried > 0 || summary.swept > 0 {
            info!(retried = summary.retried, swept = summary.swept, "reaper pass");
        }
        Ok(summary)
    }

    pub fn stats(&self) -> SandboxStats {
        SandboxStats {
            created: self.inner.created.load(Ordering::Relaxed),
            teardowns: self.inner.teardowns.load(Ordering::Relaxed),
            live: self.inner.live.lock().len(),
            pending_retry: self.inner.failed.lock().len(),
        }
    }

    fn defer(&self, handle: Arc<SandboxHandle>) {
        self.inner.failed.lock().push(handle);
    }
}

/// Exclusive ownership of one live sandbox.
///
/// Call [`release`](Self::release) when done. Dropping an unreleased guard
/// (for instance while a supervising task unwinds) schedules the teardown on
/// the current runtime, or leaves it to the reaper if there is none.
#[derive(Debug)]
pub struct SandboxGuard {
    handle: Arc<SandboxHandle>,
    launcher: SandboxLauncher,
    released: bool,
}

impl SandboxGuard {
    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Write a file into the sandbox work directory
    pub async fn stage(&self, file: &str, content: &[u8]) -> Result<(), SandboxError> {
        self.launcher
            .inner
            .backend
            .stage(&self.handle, file, content)
            .await
    }

    /// Command that runs `profile` inside this sandbox
    pub fn launch_command(
        &self,
        profile: &RuntimeProfile,
        limits: &ResourceLimits,
    ) -> Result<LaunchCommand, SandboxError> {
        self.launcher
            .inner
            .backend
            .launch_command(&self.handle, profile, limits)
    }

    /// Backend's view of the finished job; call before `release`
    pub async fn report(&self) -> SandboxReport {
        self.launcher.inner.backend.report(&self.handle).await
    }

    /// Tear the sandbox down
    pub async fn release(mut self) -> Result<(), SandboxError> {
        self.released = true;
        self.launcher.destroy(&self.handle).await.map(|_| ())
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if self.released || self.handle.is_torn_down() {
            return;
        }

        warn!(sandbox = %self.handle.name(), "sandbox guard dropped without release");
        let handle = Arc::clone(&self.handle);
        let launcher = self.launcher.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = launcher.destroy(&handle).await;
                });
            }
            Err(_) => launcher.defer(handle),
        }
    }
}
