#[path = "common/mod.rs"]
mod common;

use std::{
    collections::BTreeMap,
    net::TcpListener,
    time::{Duration, Instant},
};

use common::HttpStub;
use cradle::{
    config::LogConfig,
    env::{EnvSource, EnvStore},
    logs::{ConsoleWriter, LogMultiplexer, MASK_PLACEHOLDER, Severity, StreamKind, transport},
    test_utils::SharedBuffer,
};

fn exporting(topic: &str) -> LogConfig {
    LogConfig {
        structured: true,
        export_config: Some(format!("mem://{topic}")),
        mask: vec!["password".into()],
        tags: BTreeMap::from([("service".to_string(), "billing".to_string())]),
        ..LogConfig::default()
    }
}

#[test]
fn mem_export_masks_and_tags_records() {
    let receiver = transport::subscribe("logs-mask-and-tag");
    let console = SharedBuffer::default();
    let mux = LogMultiplexer::new(
        StreamKind::Stdout,
        ConsoleWriter::json(console.clone()),
        Severity::Info,
        &exporting("logs-mask-and-tag"),
        &EnvStore::new(),
    )
    .expect("multiplexer");

    mux.write(r#"{"level":"warn","user":"alice","password":"hunter2"}"#);

    let record = receiver
        .recv_timeout(Duration::from_secs(1))
        .expect("exported record");
    assert_eq!(record["level"], "warn");
    assert_eq!(record["user"], "alice");
    assert_eq!(record["service"], "billing");
    assert_eq!(record["password"], MASK_PLACEHOLDER);
    assert!(!console.contents().contains("hunter2"));
}

#[test]
fn remote_export_skips_records_below_default_level() {
    let receiver = transport::subscribe("logs-remote-filter");
    let config = LogConfig {
        default_level: Severity::Warn,
        ..exporting("logs-remote-filter")
    };
    let mux = LogMultiplexer::new(
        StreamKind::Stderr,
        ConsoleWriter::json(std::io::sink()),
        Severity::Trace,
        &config,
        &EnvStore::new(),
    )
    .expect("multiplexer");

    mux.write(r#"{"level":"debug","message":"noise"}"#);
    mux.write(r#"{"level":"error","message":"boom"}"#);
    mux.write("plain line");

    let first = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    let second = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(first["message"], "boom");
    assert_eq!(second["message"], "plain line");
    assert_eq!(second["level"], "warn");
    assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn lifecycle_events_are_exported() {
    let receiver = transport::subscribe("logs-lifecycle");
    let mut mux = LogMultiplexer::new(
        StreamKind::Stdout,
        ConsoleWriter::json(std::io::sink()),
        Severity::Info,
        &exporting("logs-lifecycle"),
        &EnvStore::new(),
    )
    .expect("multiplexer");

    mux.write_process_start(
        chrono::Utc::now(),
        42,
        std::path::Path::new("/srv"),
        "server",
        &["--port".to_string(), "80".to_string()],
    );
    mux.write_metrics(1024, 0.1, 2.5);
    mux.write_process_result(
        chrono::Utc::now(),
        "exit status: 0",
        Duration::from_secs(3),
        Duration::from_millis(10),
        Duration::from_millis(5),
    );
    mux.close();

    let start = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(start["cradle-log"], "start");
    assert_eq!(start["process-id"], "42");
    assert_eq!(start["arguments"], "--port 80");

    let metrics = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(metrics["cradle-log"], "metrics");
    assert_eq!(metrics["mem-usage"], "1024");

    let result = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(result["cradle-log"], "result");
    assert_eq!(result["process-status"], "exit status: 0");
    assert_eq!(result["wallclock-time"], "3s");
}

#[test]
fn fluentd_export_posts_to_tag_path() {
    let stub = HttpStub::start(200);
    let mut env = EnvStore::new();
    env.import(
        EnvSource::ProcessEnv,
        [format!("FLUENTD_HOST={}", stub.addr)],
    );
    let config = LogConfig {
        export_config: Some("fluentd://app.stdout".into()),
        export_host: Some("${FLUENTD_HOST}".into()),
        ..LogConfig::default()
    };
    let mut mux = LogMultiplexer::new(
        StreamKind::Stdout,
        ConsoleWriter::json(std::io::sink()),
        Severity::Info,
        &config,
        &env,
    )
    .expect("multiplexer");

    mux.write("hello fluentd");
    mux.close();

    let requests = stub.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("POST /app.stdout"));
}

#[test]
fn unreachable_collector_never_fails_the_writer() {
    let config = LogConfig {
        export_config: Some("http://127.0.0.1:9/hook".into()),
        ..LogConfig::default()
    };
    let console = SharedBuffer::default();
    let mut mux = LogMultiplexer::new(
        StreamKind::Stdout,
        ConsoleWriter::json(console.clone()),
        Severity::Info,
        &config,
        &EnvStore::new(),
    )
    .expect("multiplexer");

    mux.write("still printed");
    mux.close();
    assert!(console.contents().contains("still printed"));
}

#[test]
fn close_gives_up_on_a_silent_collector() {
    // Connections queue in the backlog but no request is ever answered.
    let collector = TcpListener::bind("127.0.0.1:0").expect("failed to bind collector");
    let config = LogConfig {
        export_config: Some(format!("http://{}/hook", collector.local_addr().unwrap())),
        ..LogConfig::default()
    };
    let mut mux = LogMultiplexer::new(
        StreamKind::Stdout,
        ConsoleWriter::json(std::io::sink()),
        Severity::Info,
        &config,
        &EnvStore::new(),
    )
    .expect("multiplexer");

    for line in ["one", "two", "three"] {
        mux.write(line);
    }
    let start = Instant::now();
    mux.close();
    assert!(start.elapsed() < transport::CLOSE_TIMEOUT + Duration::from_secs(1));
}
