//! Orchestrator facade
//!
//! Owns the registry, queue, sandbox launcher, a dispatcher task that feeds a
//! bounded pool of supervising tasks, the job status table and the reaper.
//!
//! ```no_run
//! use runbox::{Config, ExecutionRequest, Orchestrator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::start(Config::from_file("runbox.toml")?);
//! let result = orchestrator
//!     .execute(ExecutionRequest::new("python", "print('hi')"))
//!     .await?;
//! println!("{}", result.stdout_lossy());
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::collector;
use crate::config::{Config, RuntimeProfile};
use crate::queue::{JobQueue, QueueError, QueuedJob};
use crate::registry::{RegistryError, RuntimeRegistry};
use crate::sandbox::{
    ReapSummary, SandboxBackend, SandboxError, SandboxLauncher, SandboxStats, build_backend,
};
use crate::supervisor::{Supervisor, SupervisorState, TransitionObserver};
use crate::types::{ErrorKind, ExecutionRequest, ExecutionResult, JobId, JobStatus};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),

    #[error("orchestrator is shut down")]
    ShutDown,

    #[error("job {0} was cancelled before it started")]
    Cancelled(JobId),

    #[error("unknown job {0}")]
    UnknownJob(JobId),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::QueueFull(_) => ErrorKind::QueueFull,
            OrchestratorError::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            OrchestratorError::Cancelled(_) => ErrorKind::Killed,
            OrchestratorError::ShutDown | OrchestratorError::UnknownJob(_) => {
                ErrorKind::InternalError
            }
        }
    }
}

impl From<QueueError> for OrchestratorError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full(capacity) => OrchestratorError::QueueFull(capacity),
            QueueError::Closed => OrchestratorError::ShutDown,
        }
    }
}

impl From<RegistryError> for OrchestratorError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnsupportedLanguage(language) => {
                OrchestratorError::UnsupportedLanguage(language)
            }
        }
    }
}

/// What [`Orchestrator::cancel`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the queue before it started; it will have no result
    Cancelled,
    /// Already dequeued; it is being killed
    Signalled,
    /// Already finished; nothing to do
    AlreadyFinished,
    /// No such job
    Unknown,
}

#[derive(Debug, Clone)]
struct JobSnapshot {
    status: JobStatus,
    result: Option<Arc<ExecutionResult>>,
}

#[derive(Debug)]
struct JobEntry {
    language: String,
    cancel: CancellationToken,
    snapshot: watch::Sender<JobSnapshot>,
}

impl JobEntry {
    fn new(language: String, cancel: CancellationToken) -> Self {
        let (snapshot, _) = watch::channel(JobSnapshot {
            status: JobStatus::Pending,
            result: None,
        });
        Self {
            language,
            cancel,
            snapshot,
        }
    }

    fn status(&self) -> JobStatus {
        self.snapshot.borrow().status
    }

    fn result(&self) -> Option<Arc<ExecutionResult>> {
        self.snapshot.borrow().result.clone()
    }

    /// Move to `status` unless the job already reached a terminal one
    fn advance(&self, status: JobStatus) {
        self.snapshot.send_if_modified(|s| {
            if s.status.is_terminal() || s.status == status {
                return false;
            }
            s.status = status;
            true
        });
    }

    fn finish(&self, result: ExecutionResult) {
        let status = JobStatus::from_reason(result.reason);
        self.snapshot.send_if_modified(|s| {
            if s.status.is_terminal() {
                return false;
            }
            s.status = status;
            s.result = Some(Arc::new(result));
            true
        });
    }
}

struct Inner {
    config: Config,
    registry: RuntimeRegistry,
    queue: JobQueue,
    launcher: SandboxLauncher,
    permits: Arc<Semaphore>,
    jobs: Mutex<HashMap<JobId, Arc<JobEntry>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    fn entry(&self, id: JobId) -> Option<Arc<JobEntry>> {
        self.jobs.lock().get(&id).cloned()
    }
}

/// Runs untrusted code through a sandbox backend.
///
/// Dropping the orchestrator stops the dispatcher and kills running jobs;
/// call [`shutdown`](Self::shutdown) to also wait for their sandboxes to be
/// torn down.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("launcher", &self.inner.launcher)
            .field("pending", &self.inner.queue.len())
            .field("jobs", &self.inner.jobs.lock().len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start with the backend selected by `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: Config) -> Self {
        let backend = build_backend(&config);
        Self::with_backend(config, backend)
    }

    /// Start with an explicit backend
    pub fn with_backend(config: Config, backend: Arc<dyn SandboxBackend>) -> Self {
        let inner = Arc::new(Inner {
            registry: RuntimeRegistry::from_config(&config),
            queue: JobQueue::new(config.queue_capacity),
            launcher: SandboxLauncher::new(backend, config.name_prefix.clone()),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            jobs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            config,
        });

        info!(
            backend = inner.launcher.backend_name(),
            languages = inner.registry.len(),
            workers = inner.config.max_concurrent,
            queue_capacity = inner.config.queue_capacity,
            "orchestrator started"
        );

        inner.tracker.spawn(dispatch(Arc::clone(&inner)));
        if inner.config.reaper.enabled {
            inner.tracker.spawn(reap_periodically(Arc::clone(&inner)));
        }

        Self { inner }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Queue a job. Fails immediately if the language is unknown or the queue is full.
    #[instrument(skip(self, request), fields(language = %request.language))]
    pub fn submit(&self, request: ExecutionRequest) -> Result<JobId, OrchestratorError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShutDown);
        }

        let profile = self.inner.registry.resolve(&request.language)?;
        let limits = self.inner.config.effective_limits(&profile, &request);
        let id = JobId::new();
        let cancel = self.inner.shutdown.child_token();

        let entry = Arc::new(JobEntry::new(profile.id.clone(), cancel.clone()));
        self.inner.jobs.lock().insert(id, entry);

        let job = QueuedJob {
            id,
            request,
            profile,
            limits,
            cancel,
            enqueued_at: tokio::time::Instant::now(),
        };
        if let Err(e) = self.inner.queue.submit(job) {
            self.inner.jobs.lock().remove(&id);
            debug!(error = %e, "job rejected");
            return Err(e.into());
        }

        debug!(job = %id, "job queued");
        Ok(id)
    }

    /// Submit and wait for the result.
    ///
    /// The job is dropped from the status table once this returns, or once the
    /// returned future is dropped.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, OrchestratorError> {
        let id = self.submit(request)?;
        let _untrack = Untrack {
            inner: &self.inner,
            id,
        };
        self.wait(id).await
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.inner.entry(id).map(|entry| entry.status())
    }

    /// Result of a finished job
    pub fn result(&self, id: JobId) -> Option<Arc<ExecutionResult>> {
        self.inner.entry(id).and_then(|entry| entry.result())
    }

    /// Language id a job was submitted under, after alias resolution
    pub fn language(&self, id: JobId) -> Option<String> {
        self.inner.entry(id).map(|entry| entry.language.clone())
    }

    /// Withdraw a pending job or kill a running one
    pub fn cancel(&self, id: JobId) -> CancelOutcome {
        let Some(entry) = self.inner.entry(id) else {
            return CancelOutcome::Unknown;
        };

        if self.inner.queue.cancel(id) {
            entry.advance(JobStatus::Cancelled);
            debug!(job = %id, "pending job cancelled");
            return CancelOutcome::Cancelled;
        }

        if entry.status().is_terminal() {
            return CancelOutcome::AlreadyFinished;
        }

        entry.cancel.cancel();
        debug!(job = %id, "running job signalled");
        CancelOutcome::Signalled
    }

    /// Wait until a job reaches a terminal status
    pub async fn wait(&self, id: JobId) -> Result<ExecutionResult, OrchestratorError> {
        let entry = self
            .inner
            .entry(id)
            .ok_or(OrchestratorError::UnknownJob(id))?;
        let mut updates = entry.snapshot.subscribe();
        let snapshot = updates
            .wait_for(|s| s.status.is_terminal())
            .await
            .map_err(|_| OrchestratorError::ShutDown)?
            .clone();

        match snapshot.result {
            Some(result) => Ok(ExecutionResult::clone(&result)),
            None => Err(OrchestratorError::Cancelled(id)),
        }
    }

    /// Drop a finished job from the status table. Returns false for live or unknown jobs.
    pub fn forget(&self, id: JobId) -> bool {
        let mut jobs = self.inner.jobs.lock();
        match jobs.get(&id) {
            Some(entry) if entry.status().is_terminal() => {
                jobs.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn languages(&self) -> Vec<Arc<RuntimeProfile>> {
        self.inner.registry.languages()
    }

    /// Jobs waiting for a worker
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn sandbox_stats(&self) -> SandboxStats {
        self.inner.launcher.stats()
    }

    /// Run one reaper pass now
    pub async fn reap(&self) -> Result<ReapSummary, SandboxError> {
        self.inner.launcher.reap().await
    }

    /// Stop accepting work, cancel everything and wait for supervisors to finish
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.inner.queue.close();
        for job in self.inner.queue.drain() {
            job.cancel.cancel();
            if let Some(entry) = self.inner.entry(job.id) {
                entry.advance(JobStatus::Cancelled);
            }
        }
        self.inner.shutdown.cancel();
        self.inner.permits.close();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.inner.queue.close();
        self.inner.shutdown.cancel();
        self.inner.permits.close();
    }
}

/// Removes a job started by [`Orchestrator::execute`] from the status table
struct Untrack<'a> {
    inner: &'a Inner,
    id: JobId,
}

impl Drop for Untrack<'_> {
    fn drop(&mut self) {
        self.inner.jobs.lock().remove(&self.id);
    }
}

/// Hand queued jobs to supervising tasks, one worker permit each
async fn dispatch(inner: Arc<Inner>) {
    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            () = inner.shutdown.cancelled() => break,
        };

        let job = tokio::select! {
            job = inner.queue.dequeue() => match job {
                Some(job) => job,
                None => break,
            },
            () = inner.shutdown.cancelled() => break,
        };

        inner.tracker.spawn(supervise(Arc::clone(&inner), job, permit));
    }
    debug!("dispatcher stopped");
}

async fn supervise(inner: Arc<Inner>, job: QueuedJob, _permit: OwnedSemaphorePermit) {
    let id = job.id;
    let language = job.profile.id.clone();
    let Some(entry) = inner.entry(id) else {
        return;
    };
    debug!(job = %id, waited = ?job.enqueued_at.elapsed(), "job dequeued");

    let span = info_span!("job", %id, %language);
    let task = tokio::spawn(run_job(inner.launcher.clone(), job, Arc::clone(&entry)).instrument(span));

    // A panic inside the job still yields a result; the sandbox guard's drop
    // takes care of teardown.
    let result = match task.await {
        Ok(result) => result,
        Err(e) => {
            error!(job = %id, error = %e, "supervising task failed");
            ExecutionResult::failure(
                id,
                language,
                ErrorKind::InternalError,
                format!("supervising task failed: {e}"),
            )
        }
    };
    entry.finish(result);
}

async fn run_job(launcher: SandboxLauncher, job: QueuedJob, entry: Arc<JobEntry>) -> ExecutionResult {
    let QueuedJob {
        id,
        request,
        profile,
        limits,
        cancel,
        ..
    } = job;

    if cancel.is_cancelled() {
        return ExecutionResult::failure(id, &profile.id, ErrorKind::Killed, "Cancelled");
    }

    let guard = match launcher.create(&profile, &limits).await {
        Ok(guard) => guard,
        Err(e) => return ExecutionResult::failure(id, &profile.id, e.kind(), e.to_string()),
    };

    if let Err(e) = guard
        .stage(profile.source_name.as_str(), &request.source)
        .await
    {
        return collector::abandon(
            id,
            &profile.id,
            guard,
            ErrorKind::SandboxCreationFailed,
            format!("failed to stage source: {e}"),
        )
        .await;
    }

    let launch = match guard.launch_command(&profile, &limits) {
        Ok(launch) => launch,
        Err(e) => {
            return collector::abandon(id, &profile.id, guard, ErrorKind::LaunchFailure, e.to_string())
                .await;
        }
    };

    let observer: TransitionObserver = Arc::new(move |state| {
        if state == SupervisorState::Running {
            entry.advance(JobStatus::Running);
        }
    });
    let supervision = Supervisor::new(limits, cancel)
        .on_transition(observer)
        .run(launch, request.stdin)
        .await;

    collector::collect(id, &profile.id, supervision, guard).await
}

async fn reap_periodically(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.reaper.interval_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // The first tick fires immediately and clears what a previous run left
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = inner.launcher.reap().await {
                    warn!(error = %e, "reaper pass failed");
                }
            }
            () = inner.shutdown.cancelled() => break,
        }
    }
    debug!("reaper stopped");
}
