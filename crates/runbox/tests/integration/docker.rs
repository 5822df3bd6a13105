//! Requires a docker daemon and the `busybox` image

use runbox::{BackendKind, ErrorKind, Orchestrator, ResourceLimits, TerminationReason};

use super::{sh, sh_with_limits, sh_with_timeout, test_config};

fn docker_orchestrator() -> (Orchestrator, tempfile::TempDir) {
    let scratch = tempfile::tempdir().unwrap();
    let mut config = test_config(scratch.path());
    config.backend.kind = BackendKind::Docker;
    config.backend.docker.scratch_root = scratch.path().to_path_buf();
    config.languages.get_mut("sh").unwrap().image = Some("busybox:latest".to_owned());
    (Orchestrator::start(config), scratch)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_docker_hello() {
    let (orchestrator, scratch) = docker_orchestrator();

    let result = orchestrator.execute(sh("echo hello; id -u")).await.unwrap();

    assert!(result.is_success(), "result: {result:?}");
    let stdout = result.stdout_lossy();
    let mut lines = stdout.lines();
    assert_eq!(lines.next(), Some("hello"));
    assert_ne!(lines.next(), Some("0"), "program must not run as root");

    orchestrator.shutdown().await;
    assert!(super::scratch_entries(scratch.path()).is_empty());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_docker_root_filesystem_is_read_only() {
    let (orchestrator, _scratch) = docker_orchestrator();

    let result = orchestrator
        .execute(sh("touch /code/x 2>/dev/null && echo writable; touch /tmp/x && echo tmp"))
        .await
        .unwrap();

    assert_eq!(result.stdout_lossy(), "tmp\n");
    orchestrator.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_docker_wall_timeout() {
    let (orchestrator, _scratch) = docker_orchestrator();

    let result = orchestrator
        .execute(sh_with_timeout("sleep 30", 1.0))
        .await
        .unwrap();

    assert_eq!(result.reason, TerminationReason::TimedOut);
    assert_eq!(result.error, Some(ErrorKind::TimedOut));
    orchestrator.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_docker_memory_limit() {
    let (orchestrator, _scratch) = docker_orchestrator();

    let limits = ResourceLimits::unset().with_memory(32 * ResourceLimits::MB);
    let result = orchestrator
        .execute(sh_with_limits("head -c 200m /dev/zero | tail", limits))
        .await
        .unwrap();

    assert!(!result.is_success());
    orchestrator.shutdown().await;
}
