//! The `gitvault` binary: load settings, wire the services, run the
//! scheduler until a signal arrives.
//!
//! Exit codes: 0 for a normal shutdown, 1 when the settings fail to load or
//! validate (or any other startup wiring fails).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use gitvault::ShutdownFlag;
use gitvault::scheduler::{Scheduler, SchedulerOptions};
use gitvault_config::{LogLevel, SettingsHandle};
use gitvault_forge::HttpForgeFactory;
use gitvault_git::CliGit;

#[derive(Parser, Debug)]
#[command(name = "gitvault", version)]
#[command(about = "Scheduled Git repository snapshots to object storage")]
struct Cli {
    /// Path to the settings file; default locations are probed when omitted.
    settings: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("gitvault: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings_path = gitvault_config::resolve_settings_path(cli.settings.as_deref())?;
    let settings = gitvault_config::load_settings(&settings_path)?;

    init_tracing(settings.logging.log_level);
    info!(
        "gitvault {} ({} {})",
        env!("CARGO_PKG_VERSION"),
        env!("GITVAULT_GIT_TAG"),
        env!("GITVAULT_GIT_HASH")
    );
    info!("loaded settings from {}", settings_path.display());

    let store = gitvault_storage::build_object_store(&settings.storage)?;

    let shutdown = ShutdownFlag::new();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, shutdown.atomic())
            .context("failed to register signal handler")?;
    }

    let handle = SettingsHandle::new(settings);
    let watcher = gitvault_config::spawn_settings_watcher(
        settings_path.clone(),
        handle.clone(),
        shutdown.atomic(),
    )?;

    let git = CliGit::new();
    let forges = HttpForgeFactory;
    let scheduler = Scheduler::new(SchedulerOptions::default());
    scheduler.run(&handle, store.as_ref(), &git, &forges, &shutdown);

    shutdown.trigger();
    let _ = watcher.join();
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(level: LogLevel) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
