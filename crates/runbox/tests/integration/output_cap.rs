use runbox::{LimitExceeded, ResourceLimits, TerminationReason};

use super::{local_orchestrator, sh, sh_with_limits};

const MIB: usize = 1024 * 1024;

#[tokio::test]
async fn test_hundred_megabytes_capped_at_one() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let result = orchestrator
        .execute(sh("head -c 104857600 /dev/zero"))
        .await
        .unwrap();

    // The writer is drained to completion, not blocked or killed
    assert_eq!(result.reason, TerminationReason::Completed);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout.len(), MIB);
    assert!(result.stdout_truncated);
    assert!(!result.stderr_truncated);
    assert_eq!(result.limit_exceeded, LimitExceeded::Output);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_streams_are_capped_independently() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let limits = ResourceLimits::unset().with_output_limit(16);
    let result = orchestrator
        .execute(sh_with_limits(
            "echo short; head -c 1000 /dev/zero >&2",
            limits,
        ))
        .await
        .unwrap();

    assert_eq!(result.stdout_lossy(), "short\n");
    assert!(!result.stdout_truncated);
    assert_eq!(result.stderr.len(), 16);
    assert!(result.stderr_truncated);
    assert!(result.output_truncated());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_output_exactly_at_cap_is_not_truncated() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let limits = ResourceLimits::unset().with_output_limit(4);
    let result = orchestrator
        .execute(sh_with_limits("printf abcd", limits))
        .await
        .unwrap();

    assert_eq!(result.stdout, b"abcd");
    assert!(!result.stdout_truncated);
    assert_eq!(result.limit_exceeded, LimitExceeded::NotExceeded);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_binary_output_is_preserved() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let result = orchestrator
        .execute(sh("printf '\\000\\377\\001'"))
        .await
        .unwrap();

    assert_eq!(result.stdout, [0x00, 0xff, 0x01]);
    orchestrator.shutdown().await;
}
