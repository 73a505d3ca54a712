//! Environment variable store used to compose the child's environment.
use std::{cmp::Ordering, collections::HashMap, sync::LazyLock};

use regex::{Captures, Regex};
use strum_macros::{AsRefStr, Display};
use tracing::warn;

/// Matches `${NAME}` and `$NAME` references.
static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("reference pattern is valid")
});

/// Suggestions must be strictly closer than this weighted distance.
const SUGGEST_THRESHOLD: f64 = 1.6;
const INSERT_COST: f64 = 0.5;
const DELETE_COST: f64 = 1.0;
const REPLACE_COST: f64 = 0.5;

/// Where a variable was first registered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "camelCase")]
pub enum EnvSource {
    /// The supervisor's own process environment.
    ProcessEnv,
    /// A dot-env file next to the configuration.
    DotEnv,
    /// A default declared in the configuration.
    DeclaredDefault,
}

/// A resolved lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    /// Value as registered, before expansion.
    pub raw: String,
    /// Value after one level of `${VAR}` expansion.
    pub expanded: String,
    /// Source that registered the key.
    pub source: EnvSource,
}

#[derive(Debug, Clone)]
struct Slot {
    key: String,
    raw: String,
    source: EnvSource,
}

/// Ordered, first-writer-wins environment store.
///
/// Keys keep the order they were first registered in, which is also the order of
/// [`EnvStore::export_for_exec`]. Priority between sources is expressed purely by the
/// order of the `import` calls.
#[derive(Debug, Clone, Default)]
pub struct EnvStore {
    indexes: HashMap<String, usize>,
    slots: Vec<Slot>,
}

impl EnvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every `KEY=VALUE` pair. Malformed entries are skipped.
    pub fn import<I, S>(&mut self, source: EnvSource, pairs: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pair in pairs {
            let pair = pair.as_ref();
            match pair.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    self.register(source, key, value);
                }
                _ => warn!("Ignoring malformed {source} entry: {pair:?}"),
            }
        }
    }

    /// Registers a key if it is absent and returns its insertion index.
    pub fn register(&mut self, source: EnvSource, key: &str, value: &str) -> Option<usize> {
        if self.indexes.contains_key(key) {
            return None;
        }
        let index = self.slots.len();
        self.indexes.insert(key.to_string(), index);
        self.slots.push(Slot {
            key: key.to_string(),
            raw: value.to_string(),
            source,
        });
        Some(index)
    }

    /// Looks a key up, returning both raw and expanded forms.
    pub fn get(&self, key: &str) -> Option<EnvEntry> {
        let slot = &self.slots[*self.indexes.get(key)?];
        Some(EnvEntry {
            raw: slot.raw.clone(),
            expanded: self.expand(&slot.raw),
            source: slot.source,
        })
    }

    /// Expanded value of the key registered at `index`.
    pub fn expanded_at(&self, index: usize) -> Option<String> {
        self.slots.get(index).map(|slot| self.expand(&slot.raw))
    }

    fn raw(&self, key: &str) -> Option<&str> {
        self.indexes
            .get(key)
            .map(|&index| self.slots[index].raw.as_str())
    }

    /// Substitutes `${NAME}` and `$NAME` with the stored raw value of `NAME`.
    ///
    /// Substituted text is not expanded again. Unknown names become empty.
    pub fn expand(&self, text: &str) -> String {
        REFERENCE
            .replace_all(text, |caps: &Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                self.raw(name).unwrap_or_default().to_string()
            })
            .into_owned()
    }

    /// Every registered key in insertion order as expanded `KEY=VALUE` strings.
    pub fn export_for_exec(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|slot| format!("{}={}", slot.key, self.expand(&slot.raw)))
            .collect()
    }

    /// Same as [`EnvStore::export_for_exec`] but split into pairs for `Command::envs`.
    pub fn export_pairs(&self) -> Vec<(String, String)> {
        self.slots
            .iter()
            .map(|slot| (slot.key.clone(), self.expand(&slot.raw)))
            .collect()
    }

    /// Registered keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|slot| slot.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Keys that look like a typo of `missing`, closest first.
    pub fn find_suggest(&self, missing: &str) -> Vec<String> {
        let mut near: Vec<(f64, &str)> = self
            .keys()
            .map(|key| (weighted_distance(missing, key), key))
            .filter(|(distance, _)| *distance < SUGGEST_THRESHOLD)
            .collect();
        // Stable sort keeps insertion order between equal distances.
        near.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        near.into_iter().map(|(_, key)| key.to_string()).collect()
    }
}

/// Edit distance from `from` to `to` with per-operation weights.
fn weighted_distance(from: &str, to: &str) -> f64 {
    let from: Vec<char> = from.chars().collect();
    let to: Vec<char> = to.chars().collect();

    let mut previous: Vec<f64> = (0..=to.len()).map(|j| j as f64 * INSERT_COST).collect();
    let mut current = vec![0.0; to.len() + 1];

    for (i, a) in from.iter().enumerate() {
        current[0] = (i + 1) as f64 * DELETE_COST;
        for (j, b) in to.iter().enumerate() {
            let replace = if a == b { 0.0 } else { REPLACE_COST };
            current[j + 1] = (previous[j] + replace)
                .min(previous[j + 1] + DELETE_COST)
                .min(current[j] + INSERT_COST);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[to.len()]
}
