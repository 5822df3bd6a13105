//! Requires isolate installed and runnable by the test user

use runbox::{BackendKind, LimitExceeded, Orchestrator, ResourceLimits, TerminationReason};

use super::{sh, sh_with_limits, test_config};

fn isolate_orchestrator() -> (Orchestrator, tempfile::TempDir) {
    let scratch = tempfile::tempdir().unwrap();
    let mut config = test_config(scratch.path());
    config.backend.kind = BackendKind::Isolate;
    config.backend.isolate.first_box_id = 900;
    config.backend.isolate.box_count = 4;
    (Orchestrator::start(config), scratch)
}

#[tokio::test]
#[ignore = "requires isolate"]
async fn test_isolate_hello() {
    let (orchestrator, _scratch) = isolate_orchestrator();

    let result = orchestrator.execute(sh("echo hello")).await.unwrap();

    assert!(result.is_success(), "result: {result:?}");
    assert_eq!(result.stdout_lossy(), "hello\n");
    assert!(result.cpu_time.is_some());
    assert!(result.peak_memory.is_some());

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.sandbox_stats().live, 0);
}

#[tokio::test]
#[ignore = "requires isolate"]
async fn test_isolate_exit_code_from_meta() {
    let (orchestrator, _scratch) = isolate_orchestrator();

    let result = orchestrator.execute(sh("exit 3")).await.unwrap();

    assert_eq!(result.reason, TerminationReason::Completed);
    assert_eq!(result.exit_code, Some(3));
    orchestrator.shutdown().await;
}

#[tokio::test]
#[ignore = "requires isolate"]
async fn test_isolate_cpu_limit() {
    let (orchestrator, _scratch) = isolate_orchestrator();

    let limits = ResourceLimits::unset().with_cpu_time(0.5);
    let result = orchestrator
        .execute(sh_with_limits("while :; do :; done", limits))
        .await
        .unwrap();

    assert_eq!(result.reason, TerminationReason::TimedOut);
    assert!(result.limit_exceeded.is_time());
    orchestrator.shutdown().await;
}

#[tokio::test]
#[ignore = "requires isolate"]
async fn test_isolate_no_network() {
    let (orchestrator, _scratch) = isolate_orchestrator();

    let result = orchestrator
        .execute(sh("cat /sys/class/net/*/operstate 2>/dev/null | grep -c up || true"))
        .await
        .unwrap();

    assert_eq!(result.stdout_lossy().trim(), "0");
    assert_eq!(result.limit_exceeded, LimitExceeded::NotExceeded);
    orchestrator.shutdown().await;
}
