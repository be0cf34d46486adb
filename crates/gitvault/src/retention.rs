//! The registry-driven retention engine.
//!
//! Retention walks the registry — never the bucket — and for each index
//! deletes snapshots older than the cutoff, always keeping the newest
//! `retentionMinimum` entries regardless of age. Documents are rewritten
//! only when their retained list differs from what was read, so a second
//! pass over unchanged state performs zero deletions and zero writes.
//!
//! Unparseable index documents are left untouched for operator triage;
//! missing or emptied ones fall out of the registry.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use gitvault_config::Settings;
use gitvault_index::{IndexReadOutcome, SnapshotRef};
use gitvault_storage::ObjectStore;

/// What one retention pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Snapshot objects deleted.
    pub deleted: usize,
    /// Index documents rewritten.
    pub indexes_rewritten: usize,
    /// Whether the registry document was rewritten.
    pub registry_changed: bool,
    /// Corrupt index documents skipped and preserved.
    pub corrupt_skipped: usize,
}

impl RetentionReport {
    pub fn is_noop(&self) -> bool {
        *self == RetentionReport::default()
    }
}

/// Run retention under the configured policy. Disabled (absent or
/// non-positive `retention`) is a successful no-op.
pub fn run_retention(settings: &Settings, store: &dyn ObjectStore) -> Result<RetentionReport> {
    let Some(days) = settings.storage.retention.filter(|days| *days > 0) else {
        debug!("retention disabled");
        return Ok(RetentionReport::default());
    };
    let cutoff = (Utc::now() - chrono::Duration::days(days)).timestamp();
    let minimum = settings.storage.retention_minimum as usize;
    run_retention_with_cutoff(store, cutoff, minimum)
}

/// Retention with an explicit cutoff instant and minimum-kept floor.
pub fn run_retention_with_cutoff(
    store: &dyn ObjectStore,
    cutoff: i64,
    minimum: usize,
) -> Result<RetentionReport> {
    let mut report = RetentionReport::default();

    let loaded = gitvault_index::load_registry(store).context("failed to load registry")?;
    let mut registry = loaded.registry;
    let registry_raw = loaded.raw;
    let mut first_delete_error: Option<anyhow::Error> = None;

    for index_key in registry.index_keys.clone() {
        match gitvault_index::load_index(store, &index_key)? {
            IndexReadOutcome::Missing => {
                debug!("index {index_key} is gone, dropping it from the registry");
                registry.index_keys.remove(&index_key);
            }
            IndexReadOutcome::Corrupt { .. } => {
                warn!("index {index_key} is unparseable, skipping it during retention");
                report.corrupt_skipped += 1;
            }
            IndexReadOutcome::Loaded { index: mut document, raw } => {
                let normalized = gitvault_index::normalize_snapshots(document.snapshots.clone());
                if normalized.is_empty() {
                    registry.index_keys.remove(&index_key);
                    continue;
                }

                let protected = minimum.min(normalized.len());
                let mut retained: Vec<SnapshotRef> = normalized[..protected].to_vec();
                for snapshot in &normalized[protected..] {
                    if snapshot.timestamp_unix_seconds >= cutoff {
                        retained.push(snapshot.clone());
                        continue;
                    }
                    match store.delete_objects(std::slice::from_ref(&snapshot.root_prefix)) {
                        Ok(()) => {
                            debug!("deleted expired snapshot {}", snapshot.root_prefix);
                            report.deleted += 1;
                        }
                        Err(err) => {
                            tracing::error!(
                                "failed to delete snapshot {}: {err:#}",
                                snapshot.root_prefix
                            );
                            retained.push(snapshot.clone());
                            if first_delete_error.is_none() {
                                first_delete_error = Some(err);
                            }
                        }
                    }
                }
                let retained = gitvault_index::normalize_snapshots(retained);

                if retained.is_empty() {
                    registry.index_keys.remove(&index_key);
                }
                if retained != document.snapshots {
                    document.snapshots = retained;
                    gitvault_index::save_index_if_changed(
                        store,
                        &index_key,
                        &document,
                        Some(raw.as_str()),
                    )?;
                    report.indexes_rewritten += 1;
                }
            }
        }
    }

    report.registry_changed = if registry.index_keys.is_empty() && registry_raw.is_none() {
        false
    } else {
        gitvault_index::save_registry_if_changed(store, &registry, registry_raw.as_deref())
            .context("failed to write registry")?
    };

    if let Some(err) = first_delete_error {
        return Err(err.context("retention finished with snapshot deletion failures"));
    }
    if !report.is_noop() {
        info!(
            "retention removed {} snapshots, rewrote {} indexes",
            report.deleted, report.indexes_rewritten
        );
    }
    Ok(report)
}
