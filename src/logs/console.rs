//! Local console sink.
use std::io::{self, IsTerminal, Write};

use chrono::{DateTime, Local, Utc};
use serde_json::{Map, Value};

use super::record::{Severity, value_to_string};

const GRAY: &str = "\x1b[90m";
const CYAN: &str = "\x1b[36m";
const GREEN_BOLD: &str = "\x1b[1;32m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const RED_BOLD: &str = "\x1b[1;31m";
const MAGENTA: &str = "\x1b[35m";
const RESET: &str = "\x1b[0m";

/// How records are rendered on the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleFormat {
    /// One JSON object per line.
    Json,
    /// Coloured, human-readable line for interactive terminals.
    Pretty,
}

/// Writer used when a sink passes records through to the console.
pub struct ConsoleWriter {
    out: Box<dyn Write + Send>,
    format: ConsoleFormat,
}

impl ConsoleWriter {
    pub fn new(out: impl Write + Send + 'static, format: ConsoleFormat) -> Self {
        Self {
            out: Box::new(out),
            format,
        }
    }

    /// JSON lines to any writer.
    pub fn json(out: impl Write + Send + 'static) -> Self {
        Self::new(out, ConsoleFormat::Json)
    }

    /// The supervisor's stdout, pretty when attached to a terminal.
    pub fn stdout() -> Self {
        let stdout = io::stdout();
        let format = detect(stdout.is_terminal());
        Self::new(stdout, format)
    }

    /// The supervisor's stderr, pretty when attached to a terminal.
    pub fn stderr() -> Self {
        let stderr = io::stderr();
        let format = detect(stderr.is_terminal());
        Self::new(stderr, format)
    }

    pub fn format(&self) -> ConsoleFormat {
        self.format
    }

    /// Writes one record. `fields` must already be tagged and masked.
    pub(crate) fn write_record(
        &mut self,
        level: Severity,
        fields: &Map<String, Value>,
        time: DateTime<Utc>,
    ) -> io::Result<()> {
        let line = match self.format {
            ConsoleFormat::Json => render_json(level, fields, time)?,
            ConsoleFormat::Pretty => render_pretty(level, fields, time),
        };
        self.out.write_all(line.as_bytes())?;
        self.out.flush()
    }
}

fn detect(is_terminal: bool) -> ConsoleFormat {
    if is_terminal {
        ConsoleFormat::Pretty
    } else {
        ConsoleFormat::Json
    }
}

/// `{"level":..,<fields>..,"time":<unix seconds>}`
fn render_json(
    level: Severity,
    fields: &Map<String, Value>,
    time: DateTime<Utc>,
) -> io::Result<String> {
    let mut record = Map::with_capacity(fields.len() + 2);
    record.insert(super::LEVEL_KEY.into(), Value::from(level.as_ref()));
    for (key, value) in fields {
        if key != super::LEVEL_KEY && key != super::TIME_KEY {
            record.insert(key.clone(), value.clone());
        }
    }
    record.insert(super::TIME_KEY.into(), Value::from(time.timestamp()));
    let mut line = serde_json::to_string(&record)?;
    line.push('\n');
    Ok(line)
}

fn render_pretty(level: Severity, fields: &Map<String, Value>, time: DateTime<Utc>) -> String {
    let color = match level {
        Severity::Trace => MAGENTA,
        Severity::Debug => GRAY,
        Severity::Info => GREEN_BOLD,
        Severity::Warn => YELLOW_BOLD,
        Severity::Error => RED_BOLD,
    };
    let mut line = format!(
        "{GRAY}{}{RESET} {color}{}{RESET}",
        time.with_timezone(&Local).format("%H:%M:%S"),
        level.short()
    );
    if let Some(message) = fields.get(super::MESSAGE_KEY) {
        line.push(' ');
        line.push_str(&value_to_string(message));
    }
    for (key, value) in fields {
        if key == super::MESSAGE_KEY || key == super::LEVEL_KEY {
            continue;
        }
        line.push_str(&format!(" {CYAN}{key}={RESET}{}", value_to_string(value)));
    }
    line.push('\n');
    line
}
