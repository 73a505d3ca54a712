//! Record model shared by the console and remote sinks.
use serde::Deserialize;
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};

/// Severity attached to every emitted record.
///
/// Ordered from most to least verbose so filters can compare with `>=`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    AsRefStr,
    Display,
    EnumString,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Severity {
    /// Three-letter tag used by the human-readable console format.
    pub fn short(self) -> &'static str {
        match self {
            Severity::Trace => "TRC",
            Severity::Debug => "DBG",
            Severity::Info => "INF",
            Severity::Warn => "WRN",
            Severity::Error => "ERR",
        }
    }
}

/// Output stream a multiplexer is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One line of child output.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// A line that parsed as a JSON object.
    Structured(Map<String, Value>),
    /// Anything else, kept verbatim.
    Raw(String),
}

impl LogRecord {
    /// Classifies a line. Only JSON objects count as structured.
    pub fn parse(line: &str, structured: bool) -> Self {
        if structured && let Ok(Value::Object(fields)) = serde_json::from_str(line) {
            return LogRecord::Structured(fields);
        }
        LogRecord::Raw(line.to_string())
    }
}

/// Renders a field value as the flat string carried by remote transports.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
