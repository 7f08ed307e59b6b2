//! Configuration loading from the process environment and YAML files.

use serial_test::serial;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use writegate_core::config::{
    ENV_DB_PATH, ENV_NODE_NAME, ENV_NONCE_SCOPE, ENV_NONCE_WINDOW, ENV_RATE_LIMIT_BURST,
    ENV_RATE_LIMIT_PER_MINUTE, ENV_WRITE_TIMEOUT_MS,
};
use writegate_core::{ConfigError, RuntimeConfig};

const ALL_VARS: [&str; 10] = [
    "WRITEGATE_DB_PATH",
    "WRITEGATE_DB_BUSY_TIMEOUT_MS",
    "WRITEGATE_NODE_NAME",
    "WRITEGATE_NONCE_SCOPE",
    "WRITEGATE_NONCE_WINDOW",
    "WRITEGATE_IDEMPOTENCY_TTL_SECS",
    "WRITEGATE_WRITE_TIMEOUT_MS",
    "WRITEGATE_RATE_LIMIT_PER_MINUTE",
    "WRITEGATE_RATE_LIMIT_BURST",
    "WRITEGATE_TRUST_PROXY_HEADERS",
];

fn clean_env() {
    for var in ALL_VARS {
        std::env::remove_var(var);
    }
}

fn yaml_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_from_env_without_variables_is_default() {
    clean_env();
    assert_eq!(RuntimeConfig::from_env().unwrap(), RuntimeConfig::default());
}

#[test]
#[serial]
fn test_from_env_reads_overrides() {
    clean_env();
    std::env::set_var(ENV_NODE_NAME, "node-eu-1");
    std::env::set_var(ENV_NONCE_SCOPE, "   ");
    std::env::set_var(ENV_WRITE_TIMEOUT_MS, "2500");
    std::env::set_var(ENV_DB_PATH, "/tmp/writegate-test.db");

    let cfg = RuntimeConfig::from_env();
    clean_env();
    let cfg = cfg.unwrap();

    assert_eq!(cfg.node_name, "node-eu-1");
    assert_eq!(cfg.nonce_scope, "default");
    assert_eq!(cfg.write_timeout_ms, 2500);
    assert_eq!(cfg.db_path, PathBuf::from("/tmp/writegate-test.db"));
}

#[test]
#[serial]
fn test_from_env_rejects_malformed_number() {
    clean_env();
    std::env::set_var(ENV_NONCE_WINDOW, "-5");

    let err = RuntimeConfig::from_env().unwrap_err();
    clean_env();

    assert!(matches!(err, ConfigError::InvalidEnv { var, .. } if var == ENV_NONCE_WINDOW));
}

#[test]
#[serial]
fn test_from_env_validates_burst_against_limit() {
    clean_env();
    std::env::set_var(ENV_RATE_LIMIT_PER_MINUTE, "10");
    std::env::set_var(ENV_RATE_LIMIT_BURST, "20");

    let err = RuntimeConfig::from_env().unwrap_err();
    clean_env();

    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
#[serial]
fn test_env_wins_over_yaml_file() {
    clean_env();
    let file = yaml_file("node_name: from-file\nnonce_window: 50\n");
    std::env::set_var(ENV_NODE_NAME, "from-env");

    let cfg = RuntimeConfig::load(Some(file.path()));
    clean_env();
    let cfg = cfg.unwrap();

    assert_eq!(cfg.node_name, "from-env");
    assert_eq!(cfg.nonce_window, 50);
}

#[test]
#[serial]
fn test_invalid_yaml_file_reports_path() {
    clean_env();
    let file = yaml_file("nonce_window: [not, a, number]\n");

    let err = RuntimeConfig::load(Some(file.path())).unwrap_err();
    match err {
        ConfigError::Parse { path, .. } => assert_eq!(path, file.path()),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
#[serial]
fn test_missing_yaml_file_is_a_read_error() {
    clean_env();
    let err = RuntimeConfig::load(Some(std::path::Path::new(
        "/nonexistent/writegate/config.yaml",
    )))
    .unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}
