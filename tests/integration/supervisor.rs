#[path = "common/mod.rs"]
mod common;

use std::{
    thread,
    time::{Duration, Instant},
};

use cradle::{
    config::{Config, LogConfig},
    env::{EnvSource, EnvStore},
    error::SupervisorError,
    logs::{ConsoleWriter, transport},
    signals::{SignalSubscription, TerminationSignal},
    supervisor::{RunState, Supervisor},
    test_utils::SharedBuffer,
};

fn base_env() -> EnvStore {
    let mut env = EnvStore::new();
    env.import(
        EnvSource::ProcessEnv,
        [format!("PATH={}", std::env::var("PATH").unwrap_or_default())],
    );
    env
}

fn shell(script: &str) -> (Supervisor, SharedBuffer, SharedBuffer) {
    let (_sender, signals) = SignalSubscription::channel();
    shell_with(script, signals)
}

fn shell_with(script: &str, signals: SignalSubscription) -> (Supervisor, SharedBuffer, SharedBuffer) {
    let stdout = SharedBuffer::default();
    let stderr = SharedBuffer::default();
    let supervisor = Supervisor::new("sh", vec!["-c".into(), script.into()], signals)
        .env(base_env())
        .consoles(
            ConsoleWriter::json(stdout.clone()),
            ConsoleWriter::json(stderr.clone()),
        );
    (supervisor, stdout, stderr)
}

#[test]
fn zero_exit_is_success() {
    let (supervisor, _, _) = shell("exit 0");
    let run = supervisor.run().expect("run");
    assert!(run.success());
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.exit_code(), 0);
    assert!(run.finished_at >= run.started_at);
    assert!(run.signal.is_none());
}

#[test]
fn non_zero_exit_is_failure_but_not_an_error() {
    let (supervisor, _, _) = shell("exit 3");
    let run = supervisor.run().expect("run");
    assert!(!run.success());
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.exit_code(), 3);
}

#[test]
fn death_by_signal_is_failure() {
    let (supervisor, _, _) = shell("kill -9 $$");
    let run = supervisor.run().expect("run");
    assert!(!run.success());
    assert_eq!(run.exit_code(), 128 + 9);
}

#[test]
fn output_lines_reach_their_streams_in_order() {
    let (supervisor, stdout, stderr) = shell("echo one; echo two; echo oops >&2");
    supervisor.run().expect("run");

    let messages: Vec<String> = stdout
        .contents()
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|value| value["message"].as_str().map(str::to_string))
        .collect();
    assert_eq!(messages, vec!["one", "two"]);
    assert!(stderr.contents().contains("\"message\":\"oops\""));
    assert!(!stdout.contents().contains("oops"));
}

#[test]
fn child_sees_only_the_composed_environment() {
    let (supervisor, stdout, _) = shell("echo \"$GREETING/$MISSING_ONE/${HOME:-unset}\"");
    let mut env = base_env();
    env.import(EnvSource::DotEnv, ["NAME=cradle", "GREETING=hi ${NAME}"]);
    supervisor.env(env).run().expect("run");
    assert!(stdout.contents().contains("\"message\":\"hi cradle//unset\""));
}

#[test]
fn working_directory_is_applied() {
    let temp = tempfile::tempdir().expect("failed to create tempdir");
    let (supervisor, stdout, _) = shell("pwd");
    let run = supervisor.working_dir(temp.path()).run().expect("run");
    assert_eq!(run.working_dir, temp.path());
    let canonical = temp.path().canonicalize().unwrap();
    assert!(stdout.contents().contains(&*canonical.to_string_lossy()));
}

#[test]
fn spawn_failure_is_an_error() {
    let (_sender, signals) = SignalSubscription::channel();
    let result = Supervisor::new("/definitely/not/a/binary", Vec::new(), signals)
        .env(base_env())
        .consoles(
            ConsoleWriter::json(std::io::sink()),
            ConsoleWriter::json(std::io::sink()),
        )
        .run();
    assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
}

#[test]
fn relayed_signal_ends_the_child() {
    let (sender, signals) = SignalSubscription::channel();
    let (supervisor, _, _) = shell_with("exec sleep 30", signals);
    let relay = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        sender.send(TerminationSignal::Terminate)
    });
    let run = supervisor.run().expect("run");
    relay.join().unwrap();

    assert_eq!(run.state, RunState::Killed);
    assert_eq!(run.signal, Some(TerminationSignal::Terminate));
    assert!(!run.force_killed);
    assert!(!run.success());
    assert!(run.wall_clock < Duration::from_secs(10));
}

#[test]
fn stubborn_child_is_killed_after_grace_period() {
    let (sender, signals) = SignalSubscription::channel();
    let (supervisor, stdout, _) = shell_with("trap '' TERM; echo ready; exec sleep 30", signals);
    let supervisor = supervisor.grace_period(Duration::from_millis(300));
    let relay = thread::spawn(move || {
        common::wait_until(|| stdout.contents().contains("ready"), "child readiness");
        sender.send(TerminationSignal::Terminate)
    });
    let run = supervisor.run().expect("run");
    relay.join().unwrap();

    assert_eq!(run.state, RunState::Killed);
    assert!(run.force_killed);
    assert_eq!(run.exit_code(), 128 + 9);
}

#[test]
fn lifecycle_events_are_exported_with_the_run() {
    let receiver = transport::subscribe("supervisor-lifecycle");
    let config = Config {
        stdout: LogConfig {
            export_config: Some("mem://supervisor-lifecycle".into()),
            ..LogConfig::default()
        },
        ..Config::default()
    };
    let (supervisor, _, _) = shell("echo hello");
    let run = supervisor.config(config).run().expect("run");

    let records: Vec<_> = receiver.try_iter().collect();
    let start = records
        .iter()
        .find(|r| r.get("cradle-log").map(String::as_str) == Some("start"))
        .expect("start event");
    assert_eq!(start["process-id"], run.pid.to_string());
    assert_eq!(start["command"], "sh");
    assert!(records.iter().any(|r| r.get("message").map(String::as_str) == Some("hello")));
    let result = records
        .iter()
        .find(|r| r.get("cradle-log").map(String::as_str) == Some("result"))
        .expect("result event");
    assert_eq!(result["process-status"], run.status_text());
}

#[test]
fn invalid_export_target_fails_before_spawn() {
    let config = Config {
        stderr: LogConfig {
            export_config: Some("pubsub://topic".into()),
            ..LogConfig::default()
        },
        ..Config::default()
    };
    let (supervisor, stdout, _) = shell("echo never");
    let result = supervisor.config(config).run();
    assert!(matches!(result, Err(SupervisorError::Log(_))));
    assert!(stdout.contents().is_empty());
}

#[test]
fn background_grandchild_does_not_hold_up_the_run() {
    let (supervisor, stdout, _) = shell("sleep 5 & echo hi");
    let start = Instant::now();
    let run = supervisor.run().expect("run");
    assert!(run.success());
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(stdout.contents().contains("\"message\":\"hi\""));
}

#[test]
fn resource_samples_are_exported_while_running() {
    let receiver = transport::subscribe("supervisor-metrics");
    let config = Config {
        stdout: LogConfig {
            export_config: Some("mem://supervisor-metrics".into()),
            ..LogConfig::default()
        },
        ..Config::default()
    };
    let (supervisor, _, _) = shell("exec sleep 0.5");
    supervisor
        .config(config)
        .sample_interval(Duration::from_millis(100))
        .run()
        .expect("run");

    let samples: Vec<_> = receiver
        .try_iter()
        .filter(|r| r.get("cradle-log").map(String::as_str) == Some("metrics"))
        .collect();
    assert!(!samples.is_empty());
    for sample in &samples {
        assert!(sample["mem-usage"].parse::<u64>().is_ok());
        assert!(sample["cpu-percent"].parse::<f64>().is_ok());
    }
}
