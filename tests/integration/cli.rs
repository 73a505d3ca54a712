use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn cradle() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("cradle"))
}

#[test]
fn dry_run_reports_without_running() {
    let temp = tempdir().expect("failed to create tempdir");
    fs::write(
        temp.path().join("cradle.yaml"),
        r#"env:
  - name: APP_MODE
    default: batch
"#,
    )
    .expect("failed to write config");

    cradle()
        .current_dir(temp.path())
        .args(["run", "--dryrun", "touch", "ran"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK APP_MODE=batch"))
        .stdout(predicate::str::contains("(dry run) touch ran"));
    assert!(!temp.path().join("ran").exists());
}

#[test]
fn missing_required_variable_blocks_the_command() {
    let temp = tempdir().expect("failed to create tempdir");
    fs::write(
        temp.path().join("cradle.json"),
        r#"{"env":[{"name":"CRADLE_TEST_REQUIRED","required":true}]}"#,
    )
    .expect("failed to write config");

    cradle()
        .current_dir(temp.path())
        .env_remove("CRADLE_TEST_REQUIRED")
        .args(["run", "touch", "ran"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("NG CRADLE_TEST_REQUIRED"))
        .stdout(predicate::str::contains("this is required, but not specified"))
        .stdout(predicate::str::contains("Fail to run command due to configuration error."));
    assert!(!temp.path().join("ran").exists());
}

#[test]
fn dot_env_values_reach_the_child() {
    let temp = tempdir().expect("failed to create tempdir");
    fs::write(temp.path().join(".env"), "CRADLE_GREETING=\"hello from dotenv\"\n")
        .expect("failed to write dotenv");

    cradle()
        .current_dir(temp.path())
        .args(["run", "sh", "-c", "echo $CRADLE_GREETING"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello from dotenv"));
}

#[test]
fn child_exit_code_is_propagated() {
    let temp = tempdir().expect("failed to create tempdir");
    cradle()
        .current_dir(temp.path())
        .args(["run", "sh", "-c", "exit 7"])
        .assert()
        .code(7)
        .stdout(predicate::str::contains("exit status: 7"));
}

#[test]
fn unreachable_dependency_is_reported() {
    let temp = tempdir().expect("failed to create tempdir");
    fs::write(
        temp.path().join("cradle.yaml"),
        r#"dependsOn:
  - url: file:///definitely/not/present/cradle
    timeout: 0.05
    interval: 0.01
"#,
    )
    .expect("failed to write config");

    cradle()
        .current_dir(temp.path())
        .args(["run", "true"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Target service doesn't exist"));
}

#[test]
fn ambiguous_config_is_rejected() {
    let temp = tempdir().expect("failed to create tempdir");
    fs::write(temp.path().join("cradle.yaml"), "{}").unwrap();
    fs::write(temp.path().join("cradle.yml"), "{}").unwrap();

    cradle()
        .current_dir(temp.path())
        .args(["run", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Too many config file candidates"));
}

#[test]
fn init_writes_sample_once() {
    let temp = tempdir().expect("failed to create tempdir");
    cradle()
        .current_dir(temp.path())
        .args(["init", "--format", "json"])
        .assert()
        .success();
    let written = fs::read_to_string(temp.path().join("cradle.json")).unwrap();
    assert!(written.contains("dependsOn"));

    cradle()
        .current_dir(temp.path())
        .args(["init", "--format", "json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}
