use runbox::{BackendKind, Config, ConfigError};

use super::FIXTURES_PATH;

fn load(name: &str) -> Result<Config, ConfigError> {
    Config::from_file(format!("{FIXTURES_PATH}/configs/{name}"))
}

#[test]
fn test_load_valid_config() {
    let config = load("valid_full.toml").expect("Failed to load config");

    assert_eq!(config.backend.kind, BackendKind::Isolate);
    assert!(config.backend.isolate.cgroup);
    assert_eq!(config.backend.isolate.first_box_id, 100);
    assert_eq!(config.backend.isolate.box_count, 8);
    assert_eq!(config.queue_capacity, 32);
    assert_eq!(config.max_concurrent, 4);
    assert_eq!(config.name_prefix, "judge-");
    assert_eq!(config.reaper.interval, 120);
    assert_eq!(config.default_limits.cpu_time, Some(2.0));
    assert_eq!(config.default_limits.stack, None);
    assert_eq!(config.max_limits.memory, Some(1048576));

    let python = &config.languages["python3"];
    assert_eq!(python.id, "python3");
    assert_eq!(python.aliases, ["python", "py"]);
    assert_eq!(python.source_name.as_str(), "solution.py");
    assert_eq!(python.env.len(), 1);
    assert_eq!(python.path, "/usr/bin:/bin");

    let node = &config.languages["node"];
    assert_eq!(node.limits.as_ref().and_then(|l| l.memory), Some(524288));
}

#[test]
fn test_load_minimal_config() {
    let config = load("valid_minimal.toml").expect("Failed to load config");

    assert_eq!(config.backend.kind, BackendKind::Local);
    assert!(config.reaper.enabled);
    assert!(config.languages.contains_key("sh"));
    assert_eq!(config.max_limits, runbox::ResourceLimits::ceiling());
}

#[test]
fn test_load_docker_config() {
    let config = load("valid_docker.toml").expect("Failed to load config");

    assert_eq!(config.backend.kind, BackendKind::Docker);
    assert_eq!(config.backend.docker.user, "1000:1000");
    assert_eq!(config.backend.docker.tmpfs_size, "32m");
    assert_eq!(config.languages["go"].image.as_deref(), Some("runbox-go:1.22"));
}

#[test]
fn test_load_missing_file() {
    assert!(matches!(load("does_not_exist.toml"), Err(ConfigError::Parse(_))));
}

#[test]
fn test_load_invalid_empty_name() {
    let err = load("invalid_empty_name.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("empty name")));
}

#[test]
fn test_load_invalid_empty_entrypoint() {
    let err = load("invalid_empty_entrypoint.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("empty entrypoint")));
}

#[test]
fn test_load_invalid_source_name() {
    assert!(load("invalid_source_name.toml").is_err());
}

#[test]
fn test_load_invalid_duplicate_alias() {
    let err = load("invalid_duplicate_alias.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("already in use")));
}

#[test]
fn test_load_invalid_docker_without_image() {
    let err = load("invalid_docker_no_image.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("no image")));
}

#[test]
fn test_load_invalid_zero_capacity() {
    let err = load("invalid_zero_capacity.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("queue_capacity")));
}

#[test]
fn test_example_config_parses() {
    let config = Config::parse_toml(runbox::EXAMPLE_CONFIG).expect("example config should parse");
    assert!(!config.languages.is_empty());
}
