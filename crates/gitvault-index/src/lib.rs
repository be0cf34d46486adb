//! Registry and per-repository index documents.
//!
//! Two levels of JSON documents keep the hot paths off bucket listing: one
//! registry enumerating every known per-repository index key, and one index
//! per tracked repository holding its ordered snapshot list.
//!
//! Reads are tolerant — a corrupt document is data, not a failure — and
//! writes are conditional: a document whose freshly serialized form equals
//! the content originally read is never uploaded again.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use gitvault_keys::{JobMode, REGISTRY_KEY};
use gitvault_storage::ObjectStore;

/// The registry document: every per-repository index key known to exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepositoryRegistry {
    pub index_keys: BTreeSet<String>,
}

impl RepositoryRegistry {
    /// Insert a key, normalized; returns whether it was newly added.
    pub fn insert(&mut self, key: &str) -> bool {
        let key = key.trim_matches('/');
        if key.is_empty() {
            return false;
        }
        self.index_keys.insert(key.to_string())
    }

    /// Drop blank entries and surrounding slashes from every key.
    pub fn normalized(&self) -> RepositoryRegistry {
        let index_keys = self
            .index_keys
            .iter()
            .map(|k| k.trim_matches('/').to_string())
            .filter(|k| !k.is_empty())
            .collect();
        RepositoryRegistry { index_keys }
    }
}

/// One snapshot archive reference inside an index document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRef {
    /// Full object key of the archive, ending in `.tar.gz`.
    pub root_prefix: String,
    pub timestamp_unix_seconds: i64,
}

impl SnapshotRef {
    pub fn is_valid(&self) -> bool {
        !self.root_prefix.trim().is_empty() && self.timestamp_unix_seconds > 0
    }
}

/// The per-repository index document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryIndex {
    pub mode: JobMode,
    pub repository_identity: String,
    #[serde(default, deserialize_with = "snapshots_or_empty")]
    pub snapshots: Vec<SnapshotRef>,
}

fn snapshots_or_empty<'de, D>(deserializer: D) -> Result<Vec<SnapshotRef>, D::Error>
where
    D: Deserializer<'de>,
{
    let snapshots = Option::<Vec<SnapshotRef>>::deserialize(deserializer)?;
    Ok(snapshots.unwrap_or_default())
}

impl RepositoryIndex {
    pub fn new(mode: JobMode, repository_identity: impl Into<String>) -> Self {
        Self {
            mode,
            repository_identity: repository_identity.into(),
            snapshots: Vec::new(),
        }
    }
}

/// Drop invalid entries, keep the newest timestamp per `rootPrefix`, and
/// sort descending by timestamp (key as the tiebreak).
pub fn normalize_snapshots(snapshots: Vec<SnapshotRef>) -> Vec<SnapshotRef> {
    let mut newest: std::collections::BTreeMap<String, SnapshotRef> = Default::default();
    for snapshot in snapshots.into_iter().filter(SnapshotRef::is_valid) {
        match newest.get(&snapshot.root_prefix) {
            Some(existing) if existing.timestamp_unix_seconds >= snapshot.timestamp_unix_seconds => {}
            _ => {
                newest.insert(snapshot.root_prefix.clone(), snapshot);
            }
        }
    }
    let mut out: Vec<SnapshotRef> = newest.into_values().collect();
    out.sort_by(|a, b| {
        b.timestamp_unix_seconds
            .cmp(&a.timestamp_unix_seconds)
            .then_with(|| a.root_prefix.cmp(&b.root_prefix))
    });
    out
}

/// A registry document together with the raw content it was read from.
#[derive(Debug, Clone)]
pub struct LoadedRegistry {
    pub registry: RepositoryRegistry,
    /// Exactly what the store returned, for the conditional write later.
    pub raw: Option<String>,
}

/// Outcome of reading one per-repository index.
#[derive(Debug, Clone)]
pub enum IndexReadOutcome {
    /// No object at the key.
    Missing,
    /// The object exists but does not parse; preserved for triage.
    Corrupt { raw: String },
    /// Parsed, with invalid snapshot entries already dropped.
    Loaded { index: RepositoryIndex, raw: String },
}

/// Load the registry; a corrupt document becomes an empty registry that is
/// rebuilt from discovered state over the run.
pub fn load_registry(store: &dyn ObjectStore) -> Result<LoadedRegistry> {
    let raw = store.get_text_if_exists(REGISTRY_KEY)?;
    let registry = match &raw {
        None => RepositoryRegistry::default(),
        Some(content) => match serde_json::from_str::<RepositoryRegistry>(content) {
            Ok(parsed) => parsed.normalized(),
            Err(err) => {
                warn!("registry document is unparseable ({err}); starting from an empty registry");
                RepositoryRegistry::default()
            }
        },
    };
    Ok(LoadedRegistry { registry, raw })
}

/// Load one index document, distinguishing missing, corrupt, and parsed.
pub fn load_index(store: &dyn ObjectStore, key: &str) -> Result<IndexReadOutcome> {
    let Some(raw) = store.get_text_if_exists(key)? else {
        return Ok(IndexReadOutcome::Missing);
    };
    match serde_json::from_str::<RepositoryIndex>(&raw) {
        Ok(mut index) => {
            index.snapshots.retain(SnapshotRef::is_valid);
            Ok(IndexReadOutcome::Loaded { index, raw })
        }
        Err(err) => {
            warn!("index document {key} is unparseable: {err}");
            Ok(IndexReadOutcome::Corrupt { raw })
        }
    }
}

pub fn serialize_registry(registry: &RepositoryRegistry) -> Result<String> {
    serde_json::to_string(&registry.normalized()).context("failed to serialize registry")
}

pub fn serialize_index(index: &RepositoryIndex) -> Result<String> {
    serde_json::to_string(index).context("failed to serialize index")
}

/// Write the registry unless its serialized form equals the prior read.
/// Returns whether a PUT was issued.
pub fn save_registry_if_changed(
    store: &dyn ObjectStore,
    registry: &RepositoryRegistry,
    prior_raw: Option<&str>,
) -> Result<bool> {
    let serialized = serialize_registry(registry)?;
    if prior_raw == Some(serialized.as_str()) {
        return Ok(false);
    }
    store.upload_text(REGISTRY_KEY, &serialized)?;
    Ok(true)
}

/// Write an index unless its serialized form equals the prior read.
/// Returns whether a PUT was issued.
pub fn save_index_if_changed(
    store: &dyn ObjectStore,
    key: &str,
    index: &RepositoryIndex,
    prior_raw: Option<&str>,
) -> Result<bool> {
    let serialized = serialize_index(index)?;
    if prior_raw == Some(serialized.as_str()) {
        return Ok(false);
    }
    store.upload_text(key, &serialized)?;
    Ok(true)
}
