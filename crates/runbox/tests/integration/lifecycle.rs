use runbox::{ErrorKind, ExecutionRequest, JobStatus, LimitExceeded, TerminationReason};

use super::{local_orchestrator, scratch_entries, sh};

#[tokio::test]
async fn test_hello_world() {
    let (orchestrator, scratch) = local_orchestrator(|_| {});

    let result = orchestrator.execute(sh("echo 'Hello, World!'")).await.unwrap();

    assert!(result.is_success(), "result: {result:?}");
    assert_eq!(result.stdout_lossy(), "Hello, World!\n");
    assert!(result.stderr.is_empty());
    assert_eq!(result.language, "sh");
    assert_eq!(result.limit_exceeded, LimitExceeded::NotExceeded);
    assert!(result.wall_time > 0.0);

    orchestrator.shutdown().await;
    assert!(scratch_entries(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_stdin_is_delivered() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let request = sh("read a; read b; echo $((a + b))").with_stdin("3\n4\n");
    let result = orchestrator.execute(request).await.unwrap();

    assert_eq!(result.stdout_lossy().trim(), "7");
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_nonzero_exit_is_completed() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let result = orchestrator
        .execute(sh("echo oops >&2; exit 42"))
        .await
        .unwrap();

    assert_eq!(result.reason, TerminationReason::Completed);
    assert_eq!(result.exit_code, Some(42));
    assert!(!result.is_success());
    assert_eq!(result.stderr_lossy(), "oops\n");
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_killed_by_signal() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let result = orchestrator.execute(sh("kill -SEGV $$")).await.unwrap();

    assert_eq!(result.reason, TerminationReason::Completed);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.signal, Some(11));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_environment_is_cleared() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let result = orchestrator
        .execute(sh("echo \"${CARGO:-unset}\"; echo \"$PATH\"; pwd; echo \"$HOME\""))
        .await
        .unwrap();

    let stdout = result.stdout_lossy();
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines[0], "unset");
    assert_eq!(lines[1], "/usr/bin:/bin");
    assert_eq!(lines[2], lines[3], "HOME should be the work directory");
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_source_is_staged_under_source_name() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let result = orchestrator
        .execute(sh("ls; basename \"$0\""))
        .await
        .unwrap();

    assert_eq!(result.stdout_lossy(), "main.sh\nmain.sh\n");
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_alias_and_case_insensitive_language() {
    let (orchestrator, _scratch) = local_orchestrator(|_| {});

    let result = orchestrator
        .execute(ExecutionRequest::new("SHELL", "echo ok"))
        .await
        .unwrap();

    assert_eq!(result.language, "sh");
    assert!(result.is_success());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_every_sandbox_is_torn_down_once() {
    let (orchestrator, scratch) = local_orchestrator(|config| config.max_concurrent = 3);

    let ids: Vec<_> = (0..8)
        .map(|i| orchestrator.submit(sh(&format!("echo {i}; exit {}", i % 2))).unwrap())
        .collect();
    for (i, id) in ids.iter().enumerate() {
        let result = orchestrator.wait(*id).await.unwrap();
        assert_eq!(result.stdout_lossy().trim(), i.to_string());
        assert_eq!(orchestrator.status(*id), Some(JobStatus::Completed));
    }

    orchestrator.shutdown().await;
    let stats = orchestrator.sandbox_stats();
    assert_eq!(stats.created, 8);
    assert_eq!(stats.teardowns, 8);
    assert_eq!(stats.live, 0);
    assert_eq!(stats.pending_retry, 0);
    assert!(scratch_entries(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_missing_interpreter_is_launch_failure() {
    let (orchestrator, scratch) = local_orchestrator(|config| {
        let profile = config.languages.get_mut("sh").unwrap();
        profile.entrypoint = vec!["/definitely/not/an/interpreter".to_owned(), "{source}".to_owned()];
    });

    let result = orchestrator.execute(sh("echo hi")).await.unwrap();

    assert_eq!(result.reason, TerminationReason::InternalError);
    assert_eq!(result.error, Some(ErrorKind::LaunchFailure));
    assert_eq!(orchestrator.sandbox_stats().teardowns, 1);

    orchestrator.shutdown().await;
    assert!(scratch_entries(scratch.path()).is_empty());
}

#[tokio::test]
async fn test_reaper_removes_orphans_only() {
    let (orchestrator, scratch) = local_orchestrator(|_| {});

    std::fs::create_dir_all(scratch.path().join("runbox-it-orphan/work")).unwrap();
    std::fs::create_dir_all(scratch.path().join("unrelated")).unwrap();

    let summary = orchestrator.reap().await.unwrap();

    assert_eq!(summary.swept, 1);
    assert_eq!(scratch_entries(scratch.path()), vec!["unrelated".to_owned()]);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_startup_reaper_sweeps_leftovers() {
    let scratch = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(scratch.path().join("runbox-it-leftover/work")).unwrap();

    let mut config = super::test_config(scratch.path());
    config.reaper.enabled = true;
    config.reaper.interval = 3600;
    let orchestrator = runbox::Orchestrator::start(config);

    for _ in 0..100 {
        if scratch_entries(scratch.path()).is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(scratch_entries(scratch.path()).is_empty());
    orchestrator.shutdown().await;
}
