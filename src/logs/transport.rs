//! Remote pub/sub transports for exported log records.
//!
//! The export target URL selects the implementation:
//!
//! * `mem://<topic>`: in-process topic, mostly useful for tests and embedding.
//! * `fluentd://<tag>`: JSON POST to a Fluentd `in_http` input at the export host.
//! * `kafka://<topic>`: JSON POST to a Kafka REST proxy at the export host.
//! * `http://…` / `https://…`: JSON POST of every record to the URL itself.
//!
//! Network transports deliver from a dedicated thread fed by a bounded queue so a slow
//! collector never stalls the child's output pipes.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        LazyLock, Mutex, PoisonError,
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender, SyncSender, TrySendError},
    },
    thread,
    time::{Duration, Instant},
};

use reqwest::{Url, blocking::Client};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::LogError;

use super::record::StreamKind;

/// Flat string metadata carried by every exported record.
pub type Metadata = BTreeMap<String, String>;

/// Records queued for a network transport before new ones are dropped.
const QUEUE_CAPACITY: usize = 1024;
/// Timeout applied to every outgoing request.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest `close` waits for queued records before abandoning them.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const CLOSE_POLL: Duration = Duration::from_millis(10);

const KAFKA_CONTENT_TYPE: &str = "application/vnd.kafka.json.v2+json";

/// Where records are exported to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    Memory { topic: String },
    Fluentd { endpoint: Url },
    Kafka { endpoint: Url },
    Webhook { url: Url },
}

impl ExportTarget {
    /// Parses an already expanded export target and host.
    pub fn parse(stream: StreamKind, target: &str, host: &str) -> Result<Self, LogError> {
        let invalid = |reason: String| LogError::InvalidExportTarget {
            stream: stream.to_string(),
            target: target.to_string(),
            reason,
        };
        let url = Url::parse(target).map_err(|err| invalid(err.to_string()))?;
        let name = url.host_str().unwrap_or_default().to_string();

        match url.scheme() {
            "mem" => {
                if name.is_empty() {
                    return Err(invalid("missing topic name".into()));
                }
                Ok(ExportTarget::Memory { topic: name })
            }
            scheme @ ("fluentd" | "kafka") => {
                if name.is_empty() {
                    return Err(invalid("missing tag or topic name".into()));
                }
                let base = collector_base(stream, scheme, host)?;
                let joined = match scheme {
                    "fluentd" => base.join(&name),
                    _ => base.join(&format!("topics/{name}")),
                };
                let endpoint = joined.map_err(|err| invalid(err.to_string()))?;
                Ok(if scheme == "fluentd" {
                    ExportTarget::Fluentd { endpoint }
                } else {
                    ExportTarget::Kafka { endpoint }
                })
            }
            "http" | "https" => Ok(ExportTarget::Webhook { url }),
            scheme => Err(LogError::UnsupportedTransport {
                stream: stream.to_string(),
                scheme: scheme.to_string(),
            }),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            ExportTarget::Memory { .. } => "mem",
            ExportTarget::Fluentd { .. } => "fluentd",
            ExportTarget::Kafka { .. } => "kafka",
            ExportTarget::Webhook { .. } => "http",
        }
    }
}

/// Base URL of the collector, with a trailing slash so relative joins append.
fn collector_base(stream: StreamKind, scheme: &str, host: &str) -> Result<Url, LogError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(LogError::MissingExportHost {
            stream: stream.to_string(),
            scheme: scheme.to_string(),
        });
    }
    let mut base = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    };
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).map_err(|err| LogError::InvalidExportTarget {
        stream: stream.to_string(),
        target: host.to_string(),
        reason: err.to_string(),
    })
}

/// Handle owned by exactly one multiplexer.
pub enum Transport {
    Memory(String),
    Remote(RemoteSender),
}

impl Transport {
    pub fn open(stream: StreamKind, target: ExportTarget) -> Result<Self, LogError> {
        match target {
            ExportTarget::Memory { topic } => Ok(Transport::Memory(topic)),
            other => RemoteSender::spawn(stream, other).map(Transport::Remote),
        }
    }

    /// Hands a record to the transport. Failures are logged, never returned.
    pub fn send(&self, metadata: Metadata) {
        match self {
            Transport::Memory(topic) => publish(topic, metadata),
            Transport::Remote(sender) => sender.enqueue(metadata),
        }
    }

    /// Flushes queued records and stops the sender thread, waiting at most
    /// [`CLOSE_TIMEOUT`].
    pub fn close(&mut self) {
        if let Transport::Remote(sender) = self {
            sender.shutdown();
        }
    }
}

/// Background delivery for network transports.
pub struct RemoteSender {
    stream: StreamKind,
    queue: Option<SyncSender<Metadata>>,
    worker: Option<thread::JoinHandle<()>>,
    abandoned: Arc<AtomicBool>,
    dropped_warned: AtomicBool,
}

impl RemoteSender {
    fn spawn(stream: StreamKind, target: ExportTarget) -> Result<Self, LogError> {
        let transport_error = |source| LogError::Transport {
            stream: stream.to_string(),
            scheme: target.scheme().to_string(),
            source,
        };
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|err| transport_error(std::io::Error::other(err)))?;

        let (queue, records) = mpsc::sync_channel::<Metadata>(QUEUE_CAPACITY);
        let abandoned = Arc::new(AtomicBool::new(false));
        let worker = thread::Builder::new()
            .name(format!("cradle-export-{stream}"))
            .spawn({
                let target = target.clone();
                let abandoned = Arc::clone(&abandoned);
                move || deliver(stream, target, client, records, &abandoned)
            })
            .map_err(transport_error)?;

        Ok(Self {
            stream,
            queue: Some(queue),
            worker: Some(worker),
            abandoned,
            dropped_warned: AtomicBool::new(false),
        })
    }

    fn enqueue(&self, metadata: Metadata) {
        let Some(queue) = &self.queue else {
            return;
        };
        match queue.try_send(metadata) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !self.dropped_warned.swap(true, Ordering::Relaxed) {
                    warn!("Export queue for {} is full; dropping records", self.stream);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Export worker for {} is gone", self.stream);
            }
        }
    }

    fn shutdown(&mut self) {
        self.queue.take();
        let Some(worker) = self.worker.take() else {
            return;
        };
        let deadline = Instant::now() + CLOSE_TIMEOUT;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                self.abandoned.store(true, Ordering::Relaxed);
                warn!(
                    "Export for {} did not drain within {CLOSE_TIMEOUT:?}; dropping the rest",
                    self.stream
                );
                return;
            }
            thread::sleep(CLOSE_POLL);
        }
        let _ = worker.join();
    }
}

impl Drop for RemoteSender {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deliver(
    stream: StreamKind,
    target: ExportTarget,
    client: Client,
    records: Receiver<Metadata>,
    abandoned: &AtomicBool,
) {
    let mut warned = false;
    for metadata in records {
        if abandoned.load(Ordering::Relaxed) {
            debug!("Export for {stream} abandoned");
            return;
        }
        let request = match &target {
            ExportTarget::Fluentd { endpoint } => client.post(endpoint.clone()).json(&metadata),
            ExportTarget::Kafka { endpoint } => client
                .post(endpoint.clone())
                .header(reqwest::header::CONTENT_TYPE, KAFKA_CONTENT_TYPE)
                .body(json!({ "records": [{ "value": metadata }] }).to_string()),
            ExportTarget::Webhook { url } => client.post(url.clone()).json(&metadata),
            ExportTarget::Memory { .. } => continue,
        };
        let failure = match request.send() {
            Ok(response) if response.status().is_success() => None,
            Ok(response) => Some(format!("collector answered {}", response.status())),
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = failure {
            if warned {
                debug!("Export for {stream} failed: {reason}");
            } else {
                warn!("Export for {stream} failed: {reason}");
                warned = true;
            }
        }
    }
}

type Subscribers = HashMap<String, Vec<Sender<Metadata>>>;

static TOPICS: LazyLock<Mutex<Subscribers>> = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Subscribes to an in-process `mem://<topic>`.
///
/// Only records published after the call are received.
pub fn subscribe(topic: &str) -> Receiver<Metadata> {
    let (tx, rx) = mpsc::channel();
    TOPICS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(topic.to_string())
        .or_default()
        .push(tx);
    rx
}

fn publish(topic: &str, metadata: Metadata) {
    let mut topics = TOPICS.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(subscribers) = topics.get_mut(topic) {
        subscribers.retain(|subscriber| subscriber.send(metadata.clone()).is_ok());
    }
}
