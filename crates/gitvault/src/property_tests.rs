//! Property-based tests for the retention and index-store invariants.
//!
//! These verify the guarantees the engine makes for all inputs:
//! - the newest snapshot of a non-empty index survives every retention pass
//! - at least `min(retentionMinimum, #snapshots)` entries remain
//! - only snapshots older than the cutoff and outside the protected head
//!   are ever deleted
//! - a second pass over unchanged state issues zero deletions and writes

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use gitvault_index::{RepositoryIndex, SnapshotRef, normalize_snapshots};
    use gitvault_keys::JobMode;
    use gitvault_storage::MemoryStore;

    use crate::retention::run_retention_with_cutoff;

    fn snapshot_strategy() -> impl Strategy<Value = SnapshotRef> {
        (0u32..40, 1i64..1000).prop_map(|(n, timestamp_unix_seconds)| SnapshotRef {
            root_prefix: format!("repositories/url/h/a/b/{n}_repo.tar.gz"),
            timestamp_unix_seconds,
        })
    }

    fn seeded_store(snapshots: &[SnapshotRef]) -> (MemoryStore, String) {
        let store = MemoryStore::new();
        let index_key = "indexes/repositories/url/h/a/b/index.json".to_string();

        let index = RepositoryIndex {
            mode: JobMode::Url,
            repository_identity: "url/h/a/b".to_string(),
            snapshots: snapshots.to_vec(),
        };
        store.seed_text(&index_key, &gitvault_index::serialize_index(&index).expect("serialize"));
        store.seed_text(
            gitvault_keys::REGISTRY_KEY,
            &format!(r#"{{"indexKeys":["{index_key}"]}}"#),
        );
        for snapshot in normalize_snapshots(snapshots.to_vec()) {
            store.seed_text(&snapshot.root_prefix, "archive-bytes");
        }
        (store, index_key)
    }

    fn surviving_snapshots(store: &MemoryStore, index_key: &str) -> Vec<SnapshotRef> {
        match gitvault_index::load_index(store, index_key).expect("load") {
            gitvault_index::IndexReadOutcome::Loaded { index, .. } => index.snapshots,
            gitvault_index::IndexReadOutcome::Missing => Vec::new(),
            gitvault_index::IndexReadOutcome::Corrupt { .. } => panic!("index became corrupt"),
        }
    }

    proptest! {
        /// The newest snapshot is never deleted.
        #[test]
        fn newest_snapshot_survives(
            snapshots in proptest::collection::vec(snapshot_strategy(), 1..20),
            cutoff in 0i64..1200,
            minimum in 0usize..5,
        ) {
            let normalized = normalize_snapshots(snapshots.clone());
            prop_assume!(!normalized.is_empty());
            let (store, index_key) = seeded_store(&snapshots);

            run_retention_with_cutoff(&store, cutoff, minimum.max(1)).expect("retention");

            let survivors = surviving_snapshots(&store, &index_key);
            prop_assert!(survivors.contains(&normalized[0]));
            prop_assert!(store.contains(&normalized[0].root_prefix));
        }

        /// The minimum-kept floor holds.
        #[test]
        fn minimum_floor_holds(
            snapshots in proptest::collection::vec(snapshot_strategy(), 1..20),
            cutoff in 0i64..1200,
            minimum in 0usize..5,
        ) {
            let normalized = normalize_snapshots(snapshots.clone());
            prop_assume!(!normalized.is_empty());
            let (store, index_key) = seeded_store(&snapshots);

            run_retention_with_cutoff(&store, cutoff, minimum).expect("retention");

            let survivors = surviving_snapshots(&store, &index_key);
            prop_assert!(survivors.len() >= minimum.min(normalized.len()));
        }

        /// Every removed snapshot was expired and unprotected.
        #[test]
        fn only_expired_unprotected_snapshots_are_removed(
            snapshots in proptest::collection::vec(snapshot_strategy(), 1..20),
            cutoff in 0i64..1200,
            minimum in 0usize..5,
        ) {
            let normalized = normalize_snapshots(snapshots.clone());
            prop_assume!(!normalized.is_empty());
            let (store, index_key) = seeded_store(&snapshots);

            run_retention_with_cutoff(&store, cutoff, minimum).expect("retention");

            let survivors = surviving_snapshots(&store, &index_key);
            let protected = minimum.min(normalized.len());
            for (position, snapshot) in normalized.iter().enumerate() {
                let removed = !survivors.contains(snapshot);
                if removed {
                    prop_assert!(position >= protected);
                    prop_assert!(snapshot.timestamp_unix_seconds < cutoff);
                    prop_assert!(!store.contains(&snapshot.root_prefix));
                } else {
                    prop_assert!(store.contains(&snapshot.root_prefix));
                }
            }
        }

        /// A second pass with the same inputs is a no-op.
        #[test]
        fn second_pass_is_a_noop(
            snapshots in proptest::collection::vec(snapshot_strategy(), 0..20),
            cutoff in 0i64..1200,
            minimum in 0usize..5,
        ) {
            let (store, _index_key) = seeded_store(&snapshots);

            run_retention_with_cutoff(&store, cutoff, minimum).expect("first pass");
            let puts = store.put_count();
            let deletes = store.delete_count();

            let report = run_retention_with_cutoff(&store, cutoff, minimum).expect("second pass");

            prop_assert_eq!(store.put_count(), puts);
            prop_assert_eq!(store.delete_count(), deletes);
            prop_assert!(report.is_noop());
        }

        /// Writing a document equal to the prior read issues no PUT.
        #[test]
        fn unchanged_documents_are_not_rewritten(
            snapshots in proptest::collection::vec(snapshot_strategy(), 0..12),
        ) {
            let store = MemoryStore::new();
            let index = RepositoryIndex {
                mode: JobMode::Url,
                repository_identity: "url/h/a/b".to_string(),
                snapshots: normalize_snapshots(snapshots),
            };

            gitvault_index::save_index_if_changed(&store, "indexes/x", &index, None)
                .expect("first write");
            let puts = store.put_count();
            let raw = store.text("indexes/x");

            let written =
                gitvault_index::save_index_if_changed(&store, "indexes/x", &index, raw.as_deref())
                    .expect("second write");
            prop_assert!(!written);
            prop_assert_eq!(store.put_count(), puts);
        }
    }
}
