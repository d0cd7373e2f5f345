use config_loader::{
    ConfigError, ConfigManager, ModelKeyMode, ENV_CONTAINER_RUNTIME, ENV_STAGE_TIMEOUT,
};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn write_config(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("runlocal.json");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn full_config_file_is_loaded() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(
        &temp_dir,
        r#"{
            "sandboxRoot": "/var/tmp/runlocal",
            "containerRuntime": "podman",
            "algoTag": "my_algo",
            "metricsTag": "my_metrics",
            "stageTimeout": "90s",
            "modelKeyMode": "content",
            "hostUserns": false
        }"#,
    );

    let config = ConfigManager::with_file(&path)
        .load_with_env(|_| None)
        .unwrap();

    assert_eq!(config.sandbox_root, PathBuf::from("/var/tmp/runlocal"));
    assert_eq!(config.container_runtime, "podman");
    assert_eq!(config.algo_tag, "my_algo");
    assert_eq!(config.metrics_tag, "my_metrics");
    assert_eq!(config.stage_timeout, Some(Duration::from_secs(90)));
    assert_eq!(config.model_key_mode, ModelKeyMode::Content);
    assert!(!config.host_userns);
}

#[test]
fn explicit_missing_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    let manager = ConfigManager::with_file(temp_dir.path().join("missing.json"));

    let result = manager.load_with_env(|_| None);
    assert!(matches!(
        result,
        Err(ConfigError::ConfigFileNotFound { .. })
    ));
}

#[test]
fn wrong_types_are_rejected_with_pointer() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, r#"{"hostUserns": "yes"}"#);

    let err = ConfigManager::with_file(&path)
        .load_with_env(|_| None)
        .unwrap_err();

    match err {
        ConfigError::ValidationFailed { errors } => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].json_pointer, "/hostUserns");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn invalid_json_is_a_parse_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, "{ not json");

    let result = ConfigManager::with_file(&path).validate_config_file(&path);
    assert!(matches!(result, Err(ConfigError::JsonParsingFailed { .. })));
}

#[test]
fn unparseable_timeout_in_file_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, r#"{"stageTimeout": "whenever"}"#);

    let err = ConfigManager::with_file(&path)
        .load_with_env(|_| None)
        .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "stageTimeout"));
}

#[test]
fn env_runtime_applies_without_file() {
    let config = ConfigManager::without_file()
        .load_with_env(|key| (key == ENV_CONTAINER_RUNTIME).then(|| "podman".to_string()))
        .unwrap();
    assert_eq!(config.container_runtime, "podman");
    assert!(ConfigManager::without_file().config_path().is_none());
}

#[test]
fn zero_timeout_is_rejected_in_file_and_env() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, r#"{"stageTimeout": "0s"}"#);

    let err = ConfigManager::with_file(&path)
        .load_with_env(|_| None)
        .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "stageTimeout"));
    assert!(err.to_string().contains("greater than zero"));

    let err = ConfigManager::without_file()
        .load_with_env(|key| (key == ENV_STAGE_TIMEOUT).then(|| "0ms".to_string()))
        .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == ENV_STAGE_TIMEOUT));
}
