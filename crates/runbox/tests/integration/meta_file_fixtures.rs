use runbox::LimitExceeded;
use runbox::sandbox::isolate::{IsolateStatus, MetaFile};

use super::FIXTURES_PATH;

fn read_fixture(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/meta/{name}");
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read meta fixture {path}: {e}"))
}

fn load_meta_fixture(name: &str) -> MetaFile {
    MetaFile::parse(&read_fixture(name))
}

#[test]
fn test_meta_success() {
    let meta = load_meta_fixture("success.meta");
    assert_eq!(meta.status(), IsolateStatus::Ok);
    assert_eq!(meta.exit_code(), Some(0));
    assert!((meta.time().unwrap() - 0.042).abs() < 0.001);
    assert_eq!(meta.limit_exceeded(), LimitExceeded::NotExceeded);

    let report = meta.to_report();
    assert!(report.reports_exit_status);
    assert!(!report.timed_out);
    assert_eq!(report.peak_memory, Some(3456));
}

#[test]
fn test_meta_tle() {
    let meta = load_meta_fixture("tle.meta");
    assert_eq!(meta.status(), IsolateStatus::TimedOut);
    assert_eq!(meta.limit_exceeded(), LimitExceeded::Time);
    assert!(meta.killed());
    assert!(meta.to_report().timed_out);
}

#[test]
fn test_meta_wall_tle() {
    let meta = load_meta_fixture("wall_tle.meta");
    assert_eq!(meta.status(), IsolateStatus::TimedOut);
    assert_eq!(meta.limit_exceeded(), LimitExceeded::WallTime);
}

#[test]
fn test_meta_mle() {
    let meta = load_meta_fixture("mle.meta");
    assert_eq!(meta.status(), IsolateStatus::Signaled);
    assert_eq!(meta.limit_exceeded(), LimitExceeded::Memory);
    assert_eq!(meta.signal(), Some(9));
}

#[test]
fn test_meta_ole() {
    let meta = load_meta_fixture("ole.meta");
    assert_eq!(meta.limit_exceeded(), LimitExceeded::Output);
}

#[test]
fn test_meta_signal() {
    let meta = load_meta_fixture("signal.meta");
    assert_eq!(meta.status(), IsolateStatus::Signaled);
    assert_eq!(meta.signal(), Some(11)); // SIGSEGV
    assert_eq!(meta.to_report().exit_code, None);
}

#[test]
fn test_meta_runtime_error() {
    let meta = load_meta_fixture("runtime_error.meta");
    assert_eq!(meta.status(), IsolateStatus::RuntimeError);
    assert_eq!(meta.exit_code(), Some(1));
    assert_eq!(meta.limit_exceeded(), LimitExceeded::NotExceeded);
}

#[test]
fn test_meta_internal_error() {
    let report = load_meta_fixture("internal_error.meta").to_report();
    assert!(report.internal_error);
    assert!(report.message.unwrap().contains("clone failed"));
}

#[test]
fn test_meta_cgroup_mem_priority() {
    let meta = load_meta_fixture("cgroup_mem.meta");
    // cg-mem should be preferred over max-rss
    assert_eq!(meta.memory(), Some(524288));
}

#[test]
fn test_meta_malformed_line() {
    let content = read_fixture("malformed.meta");

    let err = MetaFile::try_parse(&content).unwrap_err();
    assert_eq!(err.line_number, 2);

    // The lenient parser skips it
    let meta = MetaFile::parse(&content);
    assert_eq!(meta.exit_code(), Some(0));
}
