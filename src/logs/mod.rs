//! Log multiplexing for the supervised child's output.
//!
//! One [`LogMultiplexer`] is attached to each captured stream. It classifies every line
//! (see [`LogRecord`]), resolves its severity, merges static tags, masks configured field
//! names and hands the result to the console and/or a remote [`Transport`].
use std::{
    collections::{BTreeMap, HashSet},
    io::{BufRead, BufReader, Read},
    path::Path,
    str::FromStr,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{config::LogConfig, env::EnvStore, error::LogError};

pub mod console;
pub mod record;
pub mod transport;

pub use console::{ConsoleFormat, ConsoleWriter};
pub use record::{LogRecord, Severity, StreamKind};
pub use transport::{ExportTarget, Metadata, Transport};

/// Field carrying a record's severity.
pub const LEVEL_KEY: &str = "level";
/// Field carrying an unstructured line.
pub const MESSAGE_KEY: &str = "message";
/// Field carrying the emission time (Unix seconds).
pub const TIME_KEY: &str = "time";
/// Discriminator field on lifecycle records.
pub const EVENT_KEY: &str = "cradle-log";
/// Replacement for masked values.
pub const MASK_PLACEHOLDER: &str = "********";

/// Clock used to timestamp records.
pub type Clock = fn() -> DateTime<Utc>;

/// Fans one output stream out to the console and a remote transport.
pub struct LogMultiplexer {
    stream: StreamKind,
    console: Option<Mutex<ConsoleWriter>>,
    transport: Option<Transport>,
    default_level: Severity,
    log_level: Severity,
    structured: bool,
    tags: BTreeMap<String, String>,
    mask: HashSet<String>,
    clock: Clock,
}

impl LogMultiplexer {
    /// Builds a multiplexer for `stream`.
    ///
    /// `log_level` is the console filter. Export target and host are expanded through
    /// `env` before parsing. `writer` is only used when the sink passes records through.
    pub fn new(
        stream: StreamKind,
        writer: ConsoleWriter,
        log_level: Severity,
        config: &LogConfig,
        env: &EnvStore,
    ) -> Result<Self, LogError> {
        let transport = match config.export_config.as_deref().map(str::trim) {
            Some(target) if !target.is_empty() => {
                let target = env.expand(target);
                let host = env.expand(config.export_host.as_deref().unwrap_or_default());
                let target = ExportTarget::parse(stream, &target, &host)?;
                debug!("Exporting {stream} records via {}", target.scheme());
                Some(Transport::open(stream, target)?)
            }
            _ => None,
        };

        Ok(Self {
            stream,
            console: config.pass_through.then(|| Mutex::new(writer)),
            transport,
            default_level: config.default_level,
            log_level,
            structured: config.structured,
            tags: config.tags.clone(),
            mask: config.mask.iter().cloned().collect(),
            clock: Utc::now,
        })
    }

    /// Replaces the clock, mainly so tests get stable timestamps.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    /// Dispatches every line of `reader` until EOF.
    pub fn consume(&self, reader: impl Read) {
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer);
                    self.write(line.trim_end_matches(['\n', '\r']));
                }
                Err(err) => {
                    warn!("Reading {} failed: {err}", self.stream);
                    break;
                }
            }
        }
        debug!("{} reached EOF", self.stream);
    }

    /// Dispatches one line of child output.
    pub fn write(&self, line: &str) {
        match LogRecord::parse(line, self.structured) {
            LogRecord::Structured(fields) => self.write_map(fields),
            LogRecord::Raw(message) => {
                let mut fields = Map::new();
                fields.insert(MESSAGE_KEY.into(), Value::String(message));
                self.dispatch(self.default_level, fields);
            }
        }
    }

    /// Dispatches a structured record, honouring its own `level` field.
    pub fn write_map(&self, mut fields: Map<String, Value>) {
        let level = fields
            .remove(LEVEL_KEY)
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|label| Severity::from_str(label).ok())
            .unwrap_or(self.default_level);
        self.dispatch(level, fields);
    }

    /// Periodic resource sample of the child.
    pub fn write_metrics(&self, memory_bytes: u64, memory_percent: f32, cpu_percent: f32) {
        let mut fields = event("metrics");
        fields.insert("mem-usage".into(), Value::from(memory_bytes));
        fields.insert("mem-percent".into(), Value::from(memory_percent));
        fields.insert("cpu-percent".into(), Value::from(cpu_percent));
        self.dispatch(Severity::Info, fields);
    }

    /// Child started.
    pub fn write_process_start(
        &self,
        started_at: DateTime<Utc>,
        pid: u32,
        work_dir: &Path,
        command: &str,
        args: &[String],
    ) {
        let mut fields = event("start");
        fields.insert("start-time".into(), Value::from(started_at.timestamp()));
        fields.insert("process-id".into(), Value::from(pid));
        fields.insert(
            "work-directory".into(),
            Value::from(work_dir.display().to_string()),
        );
        fields.insert("command".into(), Value::from(command));
        fields.insert("arguments".into(), Value::from(args.join(" ")));
        self.dispatch(Severity::Info, fields);
    }

    /// Child finished.
    pub fn write_process_result(
        &self,
        exited_at: DateTime<Utc>,
        status: &str,
        wall_clock: Duration,
        user: Duration,
        system: Duration,
    ) {
        let mut fields = event("result");
        fields.insert("exit-time".into(), Value::from(exited_at.timestamp()));
        fields.insert("process-status".into(), Value::from(status));
        fields.insert("wallclock-time".into(), Value::from(format!("{wall_clock:?}")));
        fields.insert("user-time".into(), Value::from(format!("{user:?}")));
        fields.insert("system-time".into(), Value::from(format!("{system:?}")));
        self.dispatch(Severity::Info, fields);
    }

    /// Applies tags and masking, then emits to each sink that accepts `level`.
    fn dispatch(&self, level: Severity, fields: Map<String, Value>) {
        let mut record = Map::with_capacity(fields.len() + self.tags.len());
        for (key, value) in &self.tags {
            if !fields.contains_key(key) {
                record.insert(key.clone(), Value::from(value.as_str()));
            }
        }
        record.extend(fields);
        for key in &self.mask {
            if let Some(value) = record.get_mut(key) {
                *value = Value::from(MASK_PLACEHOLDER);
            }
        }

        let time = (self.clock)();

        if let Some(console) = &self.console
            && level >= self.log_level
        {
            let mut console = console.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = console.write_record(level, &record, time) {
                debug!("Console write for {} failed: {err}", self.stream);
            }
        }

        if let Some(transport) = &self.transport
            && level >= self.default_level
        {
            let mut metadata: Metadata = record
                .iter()
                .map(|(key, value)| (key.clone(), record::value_to_string(value)))
                .collect();
            metadata.insert(LEVEL_KEY.into(), level.to_string());
            metadata
                .entry(TIME_KEY.into())
                .or_insert_with(|| time.timestamp().to_string());
            transport.send(metadata);
        }
    }

    /// Flushes and releases the remote transport.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.close();
        }
    }
}

fn event(kind: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(EVENT_KEY.into(), Value::from(kind));
    fields
}
