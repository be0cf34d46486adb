//! Live settings handle and the file watcher that refreshes it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::warn;

use crate::Settings;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Shared, swappable view of the current settings.
///
/// Readers take a cheap snapshot per loop iteration; the watcher thread
/// swaps in a fresh snapshot when the file changes and still validates.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<Settings>>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    /// The current settings snapshot.
    pub fn current(&self) -> Arc<Settings> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Swap in a new snapshot.
    pub fn replace(&self, settings: Settings) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(settings);
    }
}

/// Watch a settings file and refresh the handle on every change.
///
/// The parent directory is watched (editors and config tooling replace the
/// file through renames); events for other files are ignored. A change that
/// fails to load or validate is logged and leaves the previous settings in
/// place. The thread exits once `shutdown` is set.
pub fn spawn_settings_watcher(
    path: PathBuf,
    handle: SettingsHandle,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .context("settings path has no file name")?;

    let (events_tx, events_rx) = channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                let _ = events_tx.send(event);
            }
            Err(err) => warn!("settings watcher error: {err}"),
        },
        notify::Config::default(),
    )
    .context("failed to create settings watcher")?;
    watcher
        .watch(&directory, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", directory.display()))?;

    let thread = std::thread::Builder::new()
        .name("gitvault-settings".to_string())
        .spawn(move || {
            // Owns the watcher for the lifetime of the thread.
            let _watcher = watcher;
            loop {
                match events_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(event) => {
                        if shutdown.load(Ordering::Relaxed) {
                            return;
                        }
                        let relevant = event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(file_name.as_os_str()));
                        if relevant {
                            crate::reload_into(&path, &handle);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if shutdown.load(Ordering::Relaxed) {
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })
        .context("failed to spawn settings watcher thread")?;
    Ok(thread)
}
