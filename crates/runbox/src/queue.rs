//! Bounded FIFO job queue.
//!
//! Submission never blocks: a full queue rejects the job immediately. Pending
//! jobs can be withdrawn by ID until the dispatcher takes them.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeProfile;
use crate::types::{ErrorKind, ExecutionRequest, JobId, ResourceLimits};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job queue is full (capacity {0})")]
    Full(usize),

    #[error("job queue is closed")]
    Closed,
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Full(_) => ErrorKind::QueueFull,
            QueueError::Closed => ErrorKind::InternalError,
        }
    }
}

/// A job waiting for a worker slot
#[derive(Debug)]
pub struct QueuedJob {
    pub id: JobId,
    pub request: ExecutionRequest,
    pub profile: Arc<RuntimeProfile>,
    /// Limits resolved at submission
    pub limits: ResourceLimits,
    pub cancel: CancellationToken,
    pub enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: VecDeque<QueuedJob>,
    closed: bool,
}

#[derive(Debug)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl JobQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Append a job, failing immediately if the queue is full or closed
    pub fn submit(&self, job: QueuedJob) -> Result<JobId, QueueError> {
        let id = job.id;
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if inner.jobs.len() >= self.capacity {
                return Err(QueueError::Full(self.capacity));
            }
            inner.jobs.push_back(job);
        }
        self.notify.notify_one();
        Ok(id)
    }

    /// Remove a pending job. Returns false if it was already dequeued or never existed.
    pub fn cancel(&self, id: JobId) -> bool {
        let mut inner = self.inner.lock();
        match inner.jobs.iter().position(|job| job.id == id) {
            Some(index) => {
                if let Some(job) = inner.jobs.remove(index) {
                    job.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Wait for the next job in arrival order.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<QueuedJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a submit between the check and the
            // await is not lost.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(job) = inner.jobs.pop_front() {
                    return Some(job);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting jobs and wake every waiting consumer
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Remove and return every pending job
    pub fn drain(&self) -> Vec<QueuedJob> {
        self.inner.lock().jobs.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
