use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use runbox::{
    CancelOutcome, ErrorKind, ExecutionRequest, JobId, JobStatus, Orchestrator, OrchestratorError,
    TerminationReason,
};

use super::{local_orchestrator, scratch_entries, sh};

async fn wait_until_running(orchestrator: &Orchestrator, id: JobId) {
    for _ in 0..200 {
        if orchestrator.status(id) == Some(JobStatus::Running) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never started");
}

#[tokio::test]
async fn test_unsupported_language_creates_no_sandbox() {
    let (orchestrator, scratch) = local_orchestrator(|_| {});

    let err = orchestrator
        .submit(ExecutionRequest::new("cobol", "DISPLAY 'HELLO'."))
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::UnsupportedLanguage(ref l) if l == "cobol"));
    assert_eq!(err.kind(), ErrorKind::UnsupportedLanguage);
    assert_eq!(orchestrator.sandbox_stats().created, 0);
    assert!(scratch_entries(scratch.path()).is_empty());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_rejects_without_blocking() {
    let (orchestrator, _scratch) = local_orchestrator(|config| {
        config.max_concurrent = 1;
        config.queue_capacity = 2;
    });

    let running = orchestrator.submit(sh("sleep 5")).unwrap();
    wait_until_running(&orchestrator, running).await;
    orchestrator.submit(sh("true")).unwrap();
    orchestrator.submit(sh("true")).unwrap();

    let started = Instant::now();
    let err = orchestrator.submit(sh("true")).unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(matches!(err, OrchestratorError::QueueFull(2)));
    assert_eq!(err.kind(), ErrorKind::QueueFull);
    assert_eq!(orchestrator.pending(), 2);

    orchestrator.cancel(running);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let (orchestrator, _scratch) = local_orchestrator(|config| config.max_concurrent = 1);

    let running = orchestrator.submit(sh("sleep 5")).unwrap();
    wait_until_running(&orchestrator, running).await;
    let pending = orchestrator.submit(sh("echo never")).unwrap();

    assert_eq!(orchestrator.cancel(pending), CancelOutcome::Cancelled);
    assert_eq!(orchestrator.status(pending), Some(JobStatus::Cancelled));
    assert!(orchestrator.result(pending).is_none());
    assert!(matches!(
        orchestrator.wait(pending).await,
        Err(OrchestratorError::Cancelled(id)) if id == pending
    ));

    // Cancelling twice is harmless
    assert_eq!(orchestrator.cancel(pending), CancelOutcome::AlreadyFinished);

    orchestrator.cancel(running);
    orchestrator.shutdown().await;
    assert_eq!(orchestrator.sandbox_stats().created, 1);
}

#[tokio::test]
async fn test_cancel_running_job_is_killed() {
    let (orchestrator, scratch) = local_orchestrator(|_| {});

    let id = orchestrator.submit(sh("echo started; sleep 10")).unwrap();
    wait_until_running(&orchestrator, id).await;

    let started = Instant::now();
    assert_eq!(orchestrator.cancel(id), CancelOutcome::Signalled);
    let result = orchestrator.wait(id).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.reason, TerminationReason::Killed);
    assert_eq!(result.error, Some(ErrorKind::Killed));
    assert_eq!(orchestrator.status(id), Some(JobStatus::Killed));

    orchestrator.shutdown().await;
    assert!(scratch_entries(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_each_job_gets_exactly_one_outcome() {
    let (orchestrator, _scratch) = local_orchestrator(|config| {
        config.max_concurrent = 2;
        config.queue_capacity = 32;
    });
    let orchestrator = Arc::new(orchestrator);

    let ids: Vec<_> = (0..12)
        .map(|i| orchestrator.submit(sh(&format!("echo {i}"))).unwrap())
        .collect();
    let cancelled: HashSet<_> = ids
        .iter()
        .skip(6)
        .step_by(2)
        .filter(|id| orchestrator.cancel(**id) == CancelOutcome::Cancelled)
        .copied()
        .collect();

    let mut waiters = Vec::new();
    for id in ids.clone() {
        let orchestrator = Arc::clone(&orchestrator);
        waiters.push(tokio::spawn(async move { (id, orchestrator.wait(id).await) }));
    }

    for waiter in waiters {
        let (id, outcome) = waiter.await.unwrap();
        match outcome {
            Ok(result) => {
                assert!(!cancelled.contains(&id));
                assert_eq!(result.job_id, id);
                assert!(orchestrator.status(id).unwrap().is_terminal());
            }
            Err(OrchestratorError::Cancelled(_)) => assert!(cancelled.contains(&id)),
            Err(e) => panic!("unexpected error for {id}: {e}"),
        }
    }

    orchestrator.shutdown().await;
    let stats = orchestrator.sandbox_stats();
    // A job signalled between dequeue and sandbox creation never gets one
    assert!(stats.created as usize <= ids.len() - cancelled.len());
    assert_eq!(stats.teardowns, stats.created);
}

#[tokio::test]
async fn test_forget_finished_job() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let id = orchestrator.submit(sh("true")).unwrap();
    orchestrator.wait(id).await.unwrap();

    assert!(orchestrator.result(id).is_some());
    assert!(orchestrator.forget(id));
    assert_eq!(orchestrator.status(id), None);
    assert!(!orchestrator.forget(id));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_pending_and_kills_running() {
    let (orchestrator, scratch) = local_orchestrator(|config| config.max_concurrent = 1);

    let running = orchestrator.submit(sh("sleep 10")).unwrap();
    wait_until_running(&orchestrator, running).await;
    let pending = orchestrator.submit(sh("true")).unwrap();

    let started = Instant::now();
    orchestrator.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(orchestrator.status(running), Some(JobStatus::Killed));
    assert_eq!(orchestrator.status(pending), Some(JobStatus::Cancelled));
    assert!(matches!(
        orchestrator.submit(sh("true")),
        Err(OrchestratorError::ShutDown)
    ));
    assert!(scratch_entries(scratch.path()).is_empty());
}
