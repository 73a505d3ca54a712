//! Command-line interface for cradle.
use std::str::FromStr;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::config::DEFAULT_CONFIG_CANDIDATES;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" | "information" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// Format of the file written by `cradle init`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum InitFormat {
    #[default]
    Yaml,
    Json,
}

impl InitFormat {
    pub fn file_name(self) -> &'static str {
        match self {
            InitFormat::Yaml => "cradle.yaml",
            InitFormat::Json => "cradle.json",
        }
    }
}

/// Command-line interface for cradle.
#[derive(Parser)]
#[command(name = "cradle", version, author)]
#[command(
    about = "Checks the environment, waits for dependencies, then runs and observes a command",
    long_about = None
)]
pub struct Cli {
    /// Verbosity of cradle's own diagnostics (written to stderr).
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for cradle.
#[derive(Subcommand)]
pub enum Commands {
    /// Check the environment and dependencies, then run a command.
    Run {
        /// Comma separated configuration file candidates; at most one may exist.
        #[arg(short, long, default_value = DEFAULT_CONFIG_CANDIDATES)]
        config: String,

        /// Only check environment variables and dependencies.
        #[arg(short, long = "dryrun")]
        dryrun: bool,

        /// Dot-env file merged below the process environment.
        #[arg(short = 'e', long, default_value = ".env")]
        dotenv: String,

        /// Command to run.
        command: String,

        /// Arguments passed to the command.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Generate a sample configuration file in the current directory.
    Init {
        /// Format of the generated file.
        #[arg(short, long, value_enum, default_value_t = InitFormat::default())]
        format: InitFormat,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
