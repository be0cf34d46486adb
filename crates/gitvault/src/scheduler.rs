//! Cron evaluation and the run loop.
//!
//! A single cooperative loop drives the `repositories` job family:
//! evaluate the cron expression from the live settings, wait for the next
//! occurrence in short slices, run the sync pipeline, then run retention
//! under a mutex. The wait is three-way — it ends when the target instant
//! arrives, when shutdown is signaled, or when the cron expression in the
//! live settings no longer matches the one the wait was scheduled for.
//!
//! All schedule evaluation happens in UTC; an invalid expression is logged
//! once per distinct value and rechecked every second.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use gitvault_config::SettingsHandle;
use gitvault_forge::ForgeClientFactory;
use gitvault_git::MirrorSync;
use gitvault_storage::ObjectStore;

use crate::ShutdownFlag;
use crate::{retention, sync};

/// Tunables for the loop; production uses the defaults.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Upper bound on one wait slice.
    pub wait_slice: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            wait_slice: Duration::from_secs(1),
        }
    }
}

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The target instant arrived.
    Due,
    /// The live cron expression changed; recompute the target.
    Reschedule,
    /// Shutdown was signaled.
    Shutdown,
}

/// The cooperative scheduler for the `repositories` job family.
#[derive(Debug, Default)]
pub struct Scheduler {
    options: SchedulerOptions,
    retention_gate: Mutex<()>,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self {
            options,
            retention_gate: Mutex::new(()),
        }
    }

    /// Run until shutdown is signaled or the schedule has no next
    /// occurrence.
    pub fn run(
        &self,
        settings: &SettingsHandle,
        store: &dyn ObjectStore,
        git: &dyn MirrorSync,
        forges: &dyn ForgeClientFactory,
        shutdown: &ShutdownFlag,
    ) {
        let mut last_invalid_cron: Option<String> = None;
        let mut warned_zero_minimum = false;

        loop {
            if shutdown.is_triggered() {
                info!("scheduler shutting down");
                return;
            }

            let snapshot = settings.current();
            warn_on_zero_minimum(&snapshot, &mut warned_zero_minimum);

            let expression = snapshot.schedule.repositories.cron.clone();
            let cron = match gitvault_config::parse_cron(&expression) {
                Ok(cron) => {
                    last_invalid_cron = None;
                    cron
                }
                Err(err) => {
                    if last_invalid_cron.as_deref() != Some(expression.as_str()) {
                        warn!("{err:#}; holding the schedule until it changes");
                        last_invalid_cron = Some(expression);
                    }
                    std::thread::sleep(self.options.wait_slice.min(Duration::from_secs(1)));
                    continue;
                }
            };

            let from = Utc::now() + chrono::Duration::milliseconds(1);
            let target = match cron.find_next_occurrence(&from, false) {
                Ok(target) => target,
                Err(err) => {
                    error!("cron {expression:?} has no next occurrence: {err}");
                    return;
                }
            };
            debug!("next repositories run scheduled for {target}");

            match self.wait_until(target, &expression, settings, shutdown) {
                WaitOutcome::Shutdown => {
                    info!("scheduler shutting down");
                    return;
                }
                WaitOutcome::Reschedule => {
                    info!("schedule changed while waiting, recomputing next run");
                    continue;
                }
                WaitOutcome::Due => {}
            }

            let run_settings = settings.current();
            let started = Instant::now();
            match sync::run_repositories(&run_settings, store, git, forges, shutdown) {
                Ok(summary) => info!(
                    "repositories run finished in {:.1?}: {} synced, {} skipped, {} failed",
                    started.elapsed(),
                    summary.synced,
                    summary.skipped,
                    summary.failed
                ),
                Err(err) => error!(
                    "repositories run failed after {:.1?}: {err:#}",
                    started.elapsed()
                ),
            }

            if shutdown.is_triggered() {
                info!("scheduler shutting down");
                return;
            }

            let _gate = match self.retention_gate.lock() {
                Ok(gate) => gate,
                Err(poisoned) => poisoned.into_inner(),
            };
            match retention::run_retention(&settings.current(), store) {
                Ok(report) if report.is_noop() => debug!("retention made no changes"),
                Ok(_) => {}
                Err(err) => error!("retention failed: {err:#}"),
            }
        }
    }

    /// Sleep in slices until the target arrives, shutdown is signaled, or
    /// the live cron expression diverges from the scheduled one.
    pub fn wait_until(
        &self,
        target: DateTime<Utc>,
        scheduled_expression: &str,
        settings: &SettingsHandle,
        shutdown: &ShutdownFlag,
    ) -> WaitOutcome {
        loop {
            if shutdown.is_triggered() {
                return WaitOutcome::Shutdown;
            }
            if settings.current().schedule.repositories.cron != scheduled_expression {
                return WaitOutcome::Reschedule;
            }
            let now = Utc::now();
            if now >= target {
                return WaitOutcome::Due;
            }
            let remaining = (target - now).to_std().unwrap_or(Duration::ZERO);
            std::thread::sleep(remaining.min(self.options.wait_slice));
        }
    }
}

fn warn_on_zero_minimum(settings: &gitvault_config::Settings, warned: &mut bool) {
    if settings.storage.retention_minimum == 0 {
        if !*warned {
            warn!(
                "retentionMinimum is 0: repositories removed from the configuration can have \
                 every snapshot purged"
            );
            *warned = true;
        }
    } else {
        *warned = false;
    }
}
