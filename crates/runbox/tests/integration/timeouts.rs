use std::time::{Duration, Instant};

use runbox::{ErrorKind, JobStatus, LimitExceeded, ResourceLimits, TerminationReason};

use super::{local_orchestrator, process_gone, sh_with_limits, sh_with_timeout};

#[tokio::test]
async fn test_wall_timeout_kills_within_grace() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let started = Instant::now();
    let result = orchestrator
        .execute(sh_with_timeout("sleep 10", 1.0))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.reason, TerminationReason::TimedOut);
    assert_eq!(result.error, Some(ErrorKind::TimedOut));
    assert_eq!(result.limit_exceeded, LimitExceeded::WallTime);
    // 1s limit + 0.5s grace, with slack for sandbox setup
    assert!(elapsed < Duration::from_millis(2500), "took {elapsed:?}");
    assert!(result.wall_time >= 1.0);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_timeout_leaves_no_process_behind() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    // The background sleep would outlive its parent without a group kill
    let id = orchestrator
        .submit(sh_with_timeout("sleep 10 & echo $!; wait", 1.0))
        .unwrap();
    let result = orchestrator.wait(id).await.unwrap();

    assert_eq!(result.reason, TerminationReason::TimedOut);
    assert_eq!(orchestrator.status(id), Some(JobStatus::TimedOut));
    let pid: u32 = result.stdout_lossy().trim().parse().unwrap();
    assert!(process_gone(pid).await, "background process {pid} survived");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_sigterm_ignored_is_force_killed() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let limits = ResourceLimits::unset()
        .with_wall_time(0.5)
        .with_grace_period(0.5);
    let started = Instant::now();
    let result = orchestrator
        .execute(sh_with_limits("trap '' TERM; sleep 10", limits))
        .await
        .unwrap();

    assert_eq!(result.reason, TerminationReason::TimedOut);
    assert_eq!(result.signal, Some(9));
    assert!(started.elapsed() < Duration::from_secs(3));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cpu_limit_is_timeout() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let limits = ResourceLimits::unset().with_cpu_time(1.0).with_wall_time(10.0);
    let result = orchestrator
        .execute(sh_with_limits("while :; do :; done", limits))
        .await
        .unwrap();

    assert_eq!(result.reason, TerminationReason::TimedOut);
    assert_eq!(result.limit_exceeded, LimitExceeded::Time);
    assert!(result.wall_time < 5.0);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_timeout_is_clamped_to_ceiling() {
    let (orchestrator, _scratch) = local_orchestrator(|config| {
        config.max_limits.wall_time = Some(0.5);
    });

    let started = Instant::now();
    let result = orchestrator
        .execute(sh_with_timeout("sleep 10", 60.0))
        .await
        .unwrap();

    assert_eq!(result.reason, TerminationReason::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(3));

    orchestrator.shutdown().await;
}
