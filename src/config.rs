//! Configuration management for cradle.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use reqwest::Url;
use serde::Deserialize;
use strum_macros::{AsRefStr, EnumString};
use tracing::debug;

use crate::{depends::DependencyTarget, error::ConfigError, logs::Severity};

/// Default comma separated list of configuration file candidates.
pub const DEFAULT_CONFIG_CANDIDATES: &str = "cradle.yaml,cradle.yml,cradle.json";

/// Represents the structure of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Environment variables the command expects.
    pub env: Vec<EnvSpec>,
    /// Sink for the child's standard output.
    pub stdout: LogConfig,
    /// Sink for the child's standard error.
    pub stderr: LogConfig,
    /// Services that must be reachable before the command starts.
    pub depends_on: Vec<DependsOnConfig>,
    /// Minimum severity printed on the console.
    pub log_level: Severity,
}

/// A declared environment variable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvSpec {
    pub name: String,
    /// Literal or `${VAR}` referencing value used when the variable is absent.
    pub default: Option<String>,
    pub required: bool,
    /// Regular expression the resolved value must match.
    pub pattern: Option<String>,
    pub mask: MaskMode,
}

/// Whether an environment value is hidden in reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MaskMode {
    /// Hide when the name looks like a credential.
    #[default]
    Auto,
    Hide,
    Show,
}

/// Sink configuration for one output stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    /// Parse lines as JSON objects.
    pub structured: bool,
    /// Severity for lines that don't carry their own.
    pub default_level: Severity,
    /// Export target URL, e.g. `fluentd://app.stdout` or `mem://stdout`.
    pub export_config: Option<String>,
    /// Collector address used by `fluentd` and `kafka` targets.
    pub export_host: Option<String>,
    /// Echo records to the console.
    pub pass_through: bool,
    /// Field names whose values are masked.
    pub mask: Vec<String>,
    /// Static fields added to every record.
    pub tags: BTreeMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            structured: false,
            default_level: Severity::Info,
            export_config: None,
            export_host: None,
            pass_through: true,
            mask: Vec::new(),
            tags: BTreeMap::new(),
        }
    }
}

/// A declared dependency as written in the configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DependsOnConfig {
    pub url: String,
    /// `Name: value` strings, HTTP only.
    pub headers: Vec<String>,
    /// Seconds.
    pub timeout: f64,
    /// Seconds.
    pub interval: f64,
}

impl Default for DependsOnConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: Vec::new(),
            timeout: 10.0,
            interval: 1.0,
        }
    }
}

impl DependsOnConfig {
    /// Validates the entry and converts it into a probe target.
    pub fn to_target(&self) -> Result<DependencyTarget, ConfigError> {
        let url = Url::parse(&self.url).map_err(|err| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: err.to_string(),
        })?;
        let timeout = self.seconds("timeout", self.timeout)?;
        let interval = self.seconds("interval", self.interval)?;

        let mut target = DependencyTarget::new(url)
            .with_timeout(timeout)
            .with_interval(interval);
        for header in &self.headers {
            let (name, value) = header
                .split_once(':')
                .filter(|(name, _)| !name.trim().is_empty())
                .ok_or_else(|| ConfigError::InvalidHeader(header.clone()))?;
            target = target.with_header(name.trim(), value.trim());
        }
        Ok(target)
    }

    fn seconds(&self, field: &'static str, value: f64) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration {
            url: self.url.clone(),
            field,
            value,
        })
    }
}

impl Config {
    /// Converts every `dependsOn` entry, failing on the first invalid one.
    pub fn dependency_targets(&self) -> Result<Vec<DependencyTarget>, ConfigError> {
        self.depends_on
            .iter()
            .map(DependsOnConfig::to_target)
            .collect()
    }
}

/// Expands a comma separated candidate list against `base` and keeps existing files.
pub fn search_config_files(candidates: &str, base: &Path) -> Vec<PathBuf> {
    candidates
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .map(|candidate| {
            let path = Path::new(candidate);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
        .filter(|path| path.is_file())
        .collect()
}

/// Resolves the configuration file to read.
///
/// Returns `None` when no candidate exists, in which case defaults apply.
pub fn resolve_config_path(candidates: &str, base: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let mut found = search_config_files(candidates, base);
    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        _ => Err(ConfigError::Ambiguous(found)),
    }
}

/// Decodes a configuration file, picking the format from its extension.
pub fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    debug!("Reading {} config from {}", extension, path.display());

    match extension.as_str() {
        "yaml" | "yml" => Ok(serde_yaml::from_str(&content)?),
        "json" => Ok(serde_json::from_str(&content)?),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Locates and reads the configuration, falling back to defaults.
pub fn load_config(candidates: &str, base: &Path) -> Result<(Option<PathBuf>, Config), ConfigError> {
    match resolve_config_path(candidates, base)? {
        Some(path) => {
            let config = read_config(&path)?;
            Ok((Some(path), config))
        }
        None => Ok((None, Config::default())),
    }
}

/// Reads a dot-env file into `KEY=VALUE` pairs.
///
/// A missing file yields an empty list.
pub fn load_dot_env(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }
            if !key.is_empty() {
                pairs.push(format!("{key}={value}"));
            }
        } else {
            debug!("Skipping malformed dot-env line in {}", path.display());
        }
    }
    Ok(pairs)
}

/// Sample configuration written by `cradle init`.
pub const SAMPLE_YAML: &str = r#"# cradle configuration
env:
  - name: APP_ENV
    default: development
  - name: DATABASE_URL
    required: true
    pattern: "^postgres://"
  - name: API_TOKEN
    mask: hide
stdout:
  structured: true
  defaultLevel: info
  passThrough: true
  mask:
    - password
  tags:
    app: my-service
stderr:
  defaultLevel: error
dependsOn:
  - url: tcp://localhost:5432
    timeout: 30
    interval: 1
logLevel: info
"#;

/// Sample configuration in JSON form.
pub const SAMPLE_JSON: &str = r#"{
  "env": [
    { "name": "APP_ENV", "default": "development" },
    { "name": "DATABASE_URL", "required": true, "pattern": "^postgres://" },
    { "name": "API_TOKEN", "mask": "hide" }
  ],
  "stdout": {
    "structured": true,
    "defaultLevel": "info",
    "passThrough": true,
    "mask": ["password"],
    "tags": { "app": "my-service" }
  },
  "stderr": { "defaultLevel": "error" },
  "dependsOn": [
    { "url": "tcp://localhost:5432", "timeout": 30, "interval": 1 }
  ],
  "logLevel": "info"
}
"#;
