use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn runlocal(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("runlocal").unwrap();
    cmd.current_dir(home.path())
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"))
        .env_remove("RUNLOCAL_CONFIG")
        .env_remove("RUNLOCAL_SANDBOX_ROOT")
        .env_remove("RUNLOCAL_CONTAINER_RUNTIME")
        .env_remove("RUNLOCAL_STAGE_TIMEOUT")
        .env_remove("RUNLOCAL_MODEL_KEY_MODE")
        .env_remove("RUNLOCAL_HOST_USERNS");
    cmd
}

fn run_args<'a>(extra: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec![
        "run",
        "algo",
        "--train-opener",
        "train/opener.py",
        "--test-opener",
        "test/opener.py",
        "--metrics",
        "metrics",
    ];
    args.extend_from_slice(extra);
    args
}

#[test]
fn version_prints_package_version() {
    let home = TempDir::new().unwrap();
    runlocal(&home)
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn fake_data_with_data_dir_is_a_usage_error() {
    let home = TempDir::new().unwrap();
    runlocal(&home)
        .args(run_args(&[
            "--fake-data-samples",
            "--train-data-samples",
            "data/train",
        ]))
        .assert()
        .code(2)
        .stderr(predicate::str::contains(
            "cannot be used if --fake-data-samples is activated",
        ));

    assert!(!home.path().join("sandbox").exists());
}

#[test]
fn missing_test_data_is_a_usage_error() {
    let home = TempDir::new().unwrap();
    runlocal(&home)
        .args(run_args(&["--train-data-samples", "data/train"]))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Missing option --test-data-samples"));
}

#[test]
fn missing_config_file_fails_the_run() {
    let home = TempDir::new().unwrap();
    runlocal(&home)
        .args(run_args(&["--fake-data-samples", "--config", "nope.json"]))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn unavailable_runtime_fails_the_run_and_keeps_sandbox() {
    let home = TempDir::new().unwrap();
    runlocal(&home)
        .args(run_args(&[
            "--fake-data-samples",
            "--runtime",
            "runlocal-no-such-runtime",
        ]))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("build_algo"));

    assert!(home.path().join("sandbox/model").is_dir());
}

#[test]
fn validate_accepts_known_keys() {
    let home = TempDir::new().unwrap();
    let file = home.path().join("config.json");
    fs::write(
        &file,
        r#"{"sandboxRoot": "/tmp/sb", "stageTimeout": "10m", "modelKeyMode": "content"}"#,
    )
    .unwrap();

    runlocal(&home)
        .args(["config", "validate"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Valid config"));
}

#[test]
fn validate_rejects_unknown_keys() {
    let home = TempDir::new().unwrap();
    let file = home.path().join("config.json");
    fs::write(&file, r#"{"sandbox": "/tmp/sb"}"#).unwrap();

    runlocal(&home)
        .args(["config", "validate"])
        .arg(&file)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Config validation failed"));
}

#[test]
fn show_reports_file_and_env_layers() {
    let home = TempDir::new().unwrap();
    let file = home.path().join("config.json");
    fs::write(&file, r#"{"algoTag": "my_algo", "hostUserns": false}"#).unwrap();

    runlocal(&home)
        .env("RUNLOCAL_CONTAINER_RUNTIME", "podman")
        .args(["config", "show", "--config"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""algoTag": "my_algo""#))
        .stdout(predicate::str::contains(r#""containerRuntime": "podman""#))
        .stdout(predicate::str::contains(r#""hostUserns": false"#));
}
