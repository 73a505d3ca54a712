#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    net::TcpListener,
    os::unix::net::UnixListener,
    thread,
    time::{Duration, Instant},
};

use common::{HttpStub, free_port};
use cradle::{
    cancel::CancelToken,
    depends::{DependencyTarget, wait_for, wait_for_dependencies},
    error::ProbeError,
};
use reqwest::Url;
use tempfile::tempdir;

fn target(url: &str, timeout_ms: u64, interval_ms: u64) -> DependencyTarget {
    DependencyTarget::new(Url::parse(url).expect("valid url"))
        .with_timeout(Duration::from_millis(timeout_ms))
        .with_interval(Duration::from_millis(interval_ms))
}

#[test]
fn existing_file_is_ready_immediately() {
    let temp = tempdir().expect("failed to create tempdir");
    let path = temp.path().join("ready");
    fs::write(&path, "ok").expect("failed to write file");

    let url = format!("file://{}", path.display());
    let outcome = wait_for(&target(&url, 1000, 50), &CancelToken::new());
    assert!(outcome.is_ready(), "{:?}", outcome.result);
    assert!(outcome.elapsed < Duration::from_millis(500));
}

#[test]
fn file_created_later_is_picked_up() {
    let temp = tempdir().expect("failed to create tempdir");
    let path = temp.path().join("late");
    let url = format!("file://{}", path.display());

    let writer = {
        let path = path.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            fs::write(path, "ok").expect("failed to write file");
        })
    };
    let outcome = wait_for(&target(&url, 3000, 20), &CancelToken::new());
    writer.join().unwrap();
    assert!(outcome.is_ready());
    assert!(outcome.elapsed >= Duration::from_millis(50));
}

#[test]
fn missing_file_times_out() {
    let outcome = wait_for(
        &target("file:///definitely/not/present/cradle", 50, 10),
        &CancelToken::new(),
    );
    assert!(outcome.timed_out());
}

#[test]
fn tcp_listener_is_ready() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let port = listener.local_addr().unwrap().port();
    let outcome = wait_for(
        &target(&format!("tcp://127.0.0.1:{port}"), 1000, 50),
        &CancelToken::new(),
    );
    assert!(outcome.is_ready(), "{:?}", outcome.result);

    let outcome = wait_for(
        &target(&format!("tcp4://127.0.0.1:{port}"), 1000, 50),
        &CancelToken::new(),
    );
    assert!(outcome.is_ready(), "{:?}", outcome.result);
}

#[test]
fn unix_socket_is_ready() {
    let temp = tempdir().expect("failed to create tempdir");
    let socket = temp.path().join("app.sock");
    let _listener = UnixListener::bind(&socket).expect("failed to bind socket");

    let outcome = wait_for(
        &target(&format!("unix://{}", socket.display()), 1000, 50),
        &CancelToken::new(),
    );
    assert!(outcome.is_ready(), "{:?}", outcome.result);
}

#[test]
fn http_success_sends_head_with_headers() {
    let stub = HttpStub::start(200);
    let outcome = wait_for(
        &target(&stub.url("/health"), 2000, 100).with_header("X-Probe", "cradle"),
        &CancelToken::new(),
    );
    assert!(outcome.is_ready(), "{:?}", outcome.result);

    let requests = stub.requests();
    assert!(requests[0].starts_with("HEAD /health"));
    assert!(requests[0].to_ascii_lowercase().contains("x-probe: cradle"));
}

#[test]
fn http_error_status_is_retried_until_deadline() {
    let stub = HttpStub::start(503);
    let outcome = wait_for(&target(&stub.url("/"), 300, 50), &CancelToken::new());
    assert!(outcome.timed_out());
    assert!(stub.requests().len() >= 2);
}

#[test]
fn every_target_gets_one_outcome() {
    let temp = tempdir().expect("failed to create tempdir");
    let present = temp.path().join("present");
    fs::write(&present, "").unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let open_port = listener.local_addr().unwrap().port();
    let closed_port = free_port();

    let targets = vec![
        target(&format!("file://{}", present.display()), 500, 20),
        target("file:///not/here/either", 60, 20),
        target(&format!("tcp://127.0.0.1:{open_port}"), 500, 20),
        target(&format!("tcp://127.0.0.1:{closed_port}"), 60, 20),
        target("gopher://example.com", 500, 20),
    ];
    let outcomes = wait_for_dependencies(&targets, &CancelToken::new());
    assert_eq!(outcomes.len(), targets.len());
    assert_eq!(outcomes.iter().filter(|o| o.is_ready()).count(), 2);
    assert_eq!(outcomes.iter().filter(|o| o.timed_out()).count(), 2);
    assert!(outcomes.iter().any(|o| matches!(
        o.result,
        Err(ProbeError::UnsupportedScheme(ref scheme)) if scheme == "gopher"
    )));
}

#[test]
fn short_timeout_is_isolated_from_other_targets() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let open_port = listener.local_addr().unwrap().port();
    let closed_port = free_port();

    let targets = vec![
        target(&format!("tcp://127.0.0.1:{closed_port}"), 15, 5),
        target(&format!("tcp://127.0.0.1:{open_port}"), 1000, 5),
    ];
    let start = Instant::now();
    let outcomes = wait_for_dependencies(&targets, &CancelToken::new());
    assert!(start.elapsed() < Duration::from_secs(1));

    let slow = outcomes
        .iter()
        .find(|o| o.url.port() == Some(closed_port))
        .expect("outcome for closed port");
    assert!(slow.timed_out());
    assert!(slow.elapsed >= Duration::from_millis(15));
    assert!(slow.elapsed < Duration::from_millis(15 + 5 + 200));

    let fast = outcomes
        .iter()
        .find(|o| o.url.port() == Some(open_port))
        .expect("outcome for open port");
    assert!(fast.is_ready());
}

#[test]
fn cancelling_stops_all_probes() {
    let cancel = CancelToken::new();
    let targets = vec![
        target("file:///never/appears/1", 10_000, 20),
        target("file:///never/appears/2", 10_000, 20),
    ];
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        })
    };
    let start = Instant::now();
    let outcomes = wait_for_dependencies(&targets, &cancel);
    canceller.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(
        outcomes
            .iter()
            .all(|o| matches!(o.result, Err(ProbeError::Cancelled)))
    );
}
