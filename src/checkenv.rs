//! Validation of declared environment variables.
use regex::Regex;

use crate::{
    config::{Config, MaskMode},
    env::{EnvSource, EnvStore},
    error::EnvCheckError,
};

/// Name fragments that mark a variable as a credential.
const SENSITIVE_WORDS: [&str; 5] = ["CREDENTIAL", "PASSWORD", "SECRET", "_TOKEN", "_KEY"];

/// Where a checked value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvOrigin {
    /// Registered by a source in the store.
    Store(EnvSource),
    /// Declared but absent everywhere.
    NotFound,
    /// Present in the store but not declared in the configuration.
    Unspecified,
}

/// Result of checking one variable.
#[derive(Debug, Clone)]
pub struct EnvCheck {
    pub key: String,
    pub required: bool,
    /// Hide the value in reports.
    pub masked: bool,
    pub pattern: Option<String>,
    /// Expanded value.
    pub value: String,
    /// Value before expansion.
    pub raw_value: String,
    pub origin: EnvOrigin,
    /// Closest registered name when the variable was not found.
    pub suggest: Option<String>,
}

impl EnvCheck {
    /// Returns the first failed rule, if any.
    pub fn error(&self) -> Option<EnvCheckError> {
        if self.required && self.origin == EnvOrigin::NotFound {
            return Some(EnvCheckError::Missing);
        }
        let pattern = self.pattern.as_deref().filter(|pattern| !pattern.is_empty())?;
        match Regex::new(pattern) {
            Err(source) => Some(EnvCheckError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }),
            Ok(regex) if !regex.is_match(&self.value) => {
                Some(EnvCheckError::Mismatch(pattern.to_string()))
            }
            Ok(_) => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error().is_none()
    }
}

/// Whether a value should be hidden in reports.
pub fn should_mask(name: &str, mode: MaskMode) -> bool {
    match mode {
        MaskMode::Hide => true,
        MaskMode::Show => false,
        MaskMode::Auto => {
            let name = name.to_ascii_uppercase();
            SENSITIVE_WORDS.iter().any(|word| name.contains(word))
        }
    }
}

/// Builds the store from the process environment and dot-env pairs, then checks every
/// declared variable.
///
/// The process environment wins over the dot-env file. Absent variables with a default
/// are registered as [`EnvSource::DeclaredDefault`] so the child sees them. With
/// `include_unspecified`, every other stored variable is appended sorted by name.
pub fn check_env<O, D>(
    config: &Config,
    os_envs: O,
    dot_envs: D,
    include_unspecified: bool,
) -> (Vec<EnvCheck>, EnvStore)
where
    O: IntoIterator,
    O::Item: AsRef<str>,
    D: IntoIterator,
    D::Item: AsRef<str>,
{
    let mut store = EnvStore::new();
    store.import(EnvSource::ProcessEnv, os_envs);
    store.import(EnvSource::DotEnv, dot_envs);

    let mut results = Vec::with_capacity(config.env.len());
    for spec in &config.env {
        let mut check = EnvCheck {
            key: spec.name.clone(),
            required: spec.required,
            masked: should_mask(&spec.name, spec.mask),
            pattern: spec.pattern.clone(),
            value: String::new(),
            raw_value: String::new(),
            origin: EnvOrigin::NotFound,
            suggest: None,
        };

        if let Some(entry) = store.get(&spec.name) {
            check.value = entry.expanded;
            check.raw_value = entry.raw;
            check.origin = EnvOrigin::Store(entry.source);
        } else if let Some(default) = spec.default.as_deref().filter(|value| !value.is_empty()) {
            check.raw_value = default.to_string();
            check.value = store
                .register(EnvSource::DeclaredDefault, &spec.name, default)
                .and_then(|index| store.expanded_at(index))
                .unwrap_or_default();
            check.origin = EnvOrigin::Store(EnvSource::DeclaredDefault);
        } else {
            check.suggest = store.find_suggest(&spec.name).into_iter().next();
        }
        results.push(check);
    }

    if include_unspecified {
        let mut extra: Vec<EnvCheck> = store
            .keys()
            .filter(|key| !config.env.iter().any(|spec| spec.name == *key))
            .filter_map(|key| {
                let entry = store.get(key)?;
                Some(EnvCheck {
                    key: key.to_string(),
                    required: false,
                    masked: should_mask(key, MaskMode::Auto),
                    pattern: None,
                    value: entry.expanded,
                    raw_value: entry.raw,
                    origin: EnvOrigin::Unspecified,
                    suggest: None,
                })
            })
            .collect();
        extra.sort_by(|a, b| a.key.cmp(&b.key));
        results.extend(extra);
    }

    (results, store)
}
