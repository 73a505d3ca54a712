//! Error handling for cradle.
use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Top-level error returned by the `cradle` binary flow.
#[derive(Debug, Error)]
pub enum CradleError {
    /// Configuration could not be located, read or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A log sink could not be constructed.
    #[error(transparent)]
    Log(#[from] LogError),

    /// The supervised process could not be run.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// One or more environment checks or dependency probes failed.
    #[error("Fail to run command due to configuration error")]
    Preflight,
}

/// Errors raised while locating or decoding the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading a configuration or dot-env file.
    #[error("Failed to read '{path}': {source}")]
    Read {
        /// File that could not be read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error writing a generated configuration file.
    #[error("Failed to write '{path}': {source}")]
    Write {
        /// File that could not be written.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// `init` refuses to overwrite an existing file.
    #[error("'{0}' already exists")]
    AlreadyExists(PathBuf),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error parsing JSON configuration.
    #[error("Invalid JSON format: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file has an extension we do not know how to decode.
    #[error("Unsupported config format '{0}' (expected .yaml, .yml or .json)")]
    UnsupportedFormat(String),

    /// More than one configuration file matched the search list.
    #[error("Too many config file candidates to read: {0:?}")]
    Ambiguous(Vec<PathBuf>),

    /// A dependency URL could not be parsed.
    #[error("dependsOn's URL '{url}' is invalid: {reason}")]
    InvalidUrl {
        /// Raw URL from the configuration.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// A dependency header is not in `Name: value` form.
    #[error("dependsOn header '{0}' must look like 'Name: value'")]
    InvalidHeader(String),

    /// A timeout or interval is negative or not finite.
    #[error("dependsOn '{url}' has an invalid {field}: {value}")]
    InvalidDuration {
        /// Dependency the value belongs to.
        url: String,
        /// `timeout` or `interval`.
        field: &'static str,
        /// Offending value in seconds.
        value: f64,
    },
}

/// Reason a declared environment variable failed its check.
#[derive(Debug, Error)]
pub enum EnvCheckError {
    /// The variable is required but no source provided it.
    #[error("this is required, but not specified")]
    Missing,

    /// The declared pattern is not a valid regular expression.
    #[error("pattern {pattern:?} can't be compiled: {source}")]
    InvalidPattern {
        /// Pattern from the configuration.
        pattern: String,
        /// The underlying error that occurred.
        #[source]
        source: regex::Error,
    },

    /// The resolved value does not match the declared pattern.
    #[error("the value is not matched with pattern {0:?}")]
    Mismatch(String),
}

/// Terminal failure of a single dependency probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The dependency did not become reachable before its deadline.
    #[error("timeout after {0:?}")]
    DeadlineExceeded(Duration),

    /// Probing was cancelled by the caller before the target became ready.
    #[error("probe cancelled")]
    Cancelled,

    /// The URL scheme does not map to a supported protocol.
    #[error(
        "invalid host protocol provided: {0}. supported protocols are: file, tcp, tcp4, tcp6, unix, http and https"
    )]
    UnsupportedScheme(String),

    /// The URL is missing the parts its protocol needs.
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    /// A configured header cannot be sent over HTTP.
    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    /// A file status query failed for a reason other than absence.
    #[error("file check error {path}: {source}")]
    File {
        /// Path being checked.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The HTTP client could not be initialised.
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Errors raised while building a log multiplexer.
#[derive(Debug, Error)]
pub enum LogError {
    /// The export target could not be parsed as a URL.
    #[error("Can't parse export target '{target}' for {stream}: {reason}")]
    InvalidExportTarget {
        /// Stream the sink belongs to.
        stream: String,
        /// Expanded export target.
        target: String,
        /// Parser message.
        reason: String,
    },

    /// The export target scheme has no transport implementation.
    #[error("Unsupported export scheme '{scheme}' for {stream}")]
    UnsupportedTransport {
        /// Stream the sink belongs to.
        stream: String,
        /// Scheme found in the export target.
        scheme: String,
    },

    /// The transport needs an export host but none was configured.
    #[error("Export scheme '{scheme}' for {stream} requires exportHost")]
    MissingExportHost {
        /// Stream the sink belongs to.
        stream: String,
        /// Scheme found in the export target.
        scheme: String,
    },

    /// The background sender could not be started.
    #[error("Can't init {scheme} exporter for {stream}: {source}")]
    Transport {
        /// Stream the sink belongs to.
        stream: String,
        /// Scheme found in the export target.
        scheme: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },
}

/// Errors emitted by the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The child process could not be spawned.
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        /// Command that failed to start.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Waiting on the child failed.
    #[error("Failed to wait for PID {pid}: {source}")]
    Wait {
        /// PID of the child.
        pid: u32,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// A log sink for the child could not be built.
    #[error(transparent)]
    Log(#[from] LogError),

    /// The OS signal handler could not be installed.
    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}
