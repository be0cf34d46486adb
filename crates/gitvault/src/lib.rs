//! # gitvault
//!
//! Core engine for scheduled Git repository snapshots.
//!
//! gitvault periodically mirrors remote repositories, uploads each mirror as
//! a compressed `tar.gz` snapshot to an object store, and prunes old
//! snapshots under a retention policy — all driven by a hot-reloaded
//! settings file and without ever listing the bucket on a scheduled path.
//!
//! ## Pipeline
//!
//! The flow per scheduled run is **discover → mirror → archive → index →
//! retain**:
//!
//! 1. [`sync::run_repositories`] walks the enabled repository jobs,
//!    enumerating provider accounts through their forge API and syncing a
//!    bare mirror per clone URL.
//! 2. Each mirror is uploaded as `<prefix>/<unix>_repo.tar.gz` and recorded
//!    in the repository's index document; the registry document tracks every
//!    index so later runs never enumerate the bucket.
//! 3. [`retention::run_retention`] walks the registry, deletes snapshots
//!    older than the cutoff while always keeping the newest
//!    `retentionMinimum` per repository, and rewrites only documents whose
//!    content changed.
//! 4. [`scheduler::Scheduler`] drives the loop from a cron expression,
//!    reacting to settings changes mid-wait and to cooperative shutdown.
//!
//! ## Modules
//!
//! - [`sync`] — the per-run pipeline across all configured repositories
//! - [`retention`] — the registry-driven retention engine
//! - [`scheduler`] — cron evaluation, the three-way wait, run orchestration
//!
//! External collaborators are consumed through traits: object storage
//! (`gitvault-storage`), mirror sync (`gitvault-git`), and forge
//! enumeration (`gitvault-forge`); settings come from `gitvault-config`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The per-run pipeline across all configured repositories.
pub mod sync;

/// The registry-driven retention engine.
pub mod retention;

/// Cron evaluation, the three-way wait, run orchestration.
pub mod scheduler;

/// Property-based tests for the engine invariants.
#[cfg(test)]
mod property_tests;

/// Cooperative cancellation shared by the scheduler, the pipeline, and the
/// process signal handlers.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown; idempotent.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// The underlying atomic, for signal-handler registration.
    pub fn atomic(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}
