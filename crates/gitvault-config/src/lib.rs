//! Settings file handling for gitvault.
//!
//! One YAML file drives the whole agent: storage endpoint and retention
//! policy, named credentials, repository jobs, and the cron schedule. This
//! crate owns the model, its validation, the default candidate paths probed
//! when no path is given, and the hot-reload machinery — a [`SettingsHandle`]
//! the scheduler snapshots every loop iteration, refreshed by a watcher
//! thread whenever the file changes on disk.
//!
//! Validation is strict at the edges (`ConfigInvalid` terminates startup)
//! and the deprecated `backups`/`mirrors` sections fail hard with a
//! migration hint rather than being silently ignored.

mod watcher;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use gitvault_forge::Forge;
use gitvault_keys::JobMode;
use gitvault_storage::StorageConfig;

pub use watcher::{SettingsHandle, spawn_settings_watcher};

/// Paths probed, in order, when the CLI gets no settings argument.
pub const DEFAULT_SETTINGS_CANDIDATES: &[&str] = &[
    "gitvault.yaml",
    "gitvault.yml",
    "config/gitvault.yaml",
    "/etc/gitvault/gitvault.yaml",
];

/// Log verbosity for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_level: LogLevel,
}

/// A named credential; usable for forge APIs and git HTTP auth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub api_key: String,
}

fn default_enabled() -> bool {
    true
}

/// One entry of the `repositories` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryJob {
    pub mode: JobMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Forge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub lfs: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RepositoryJob {
    fn validate(&self, position: usize) -> Result<()> {
        match self.mode {
            JobMode::Provider => {
                if self.provider.is_none() {
                    bail!("repositories[{position}]: mode `provider` requires `provider`");
                }
                if self.credential.as_deref().unwrap_or("").trim().is_empty() {
                    bail!("repositories[{position}]: mode `provider` requires `credential`");
                }
                if self.url.is_some() {
                    bail!("repositories[{position}]: mode `provider` does not accept `url`");
                }
                if self.provider == Some(Forge::Forgejo)
                    && self.base_url.as_deref().unwrap_or("").trim().is_empty()
                {
                    bail!("repositories[{position}]: forgejo requires `baseUrl`");
                }
                if let Some(base_url) = &self.base_url {
                    validate_http_url(base_url)
                        .with_context(|| format!("repositories[{position}].baseUrl"))?;
                }
            }
            JobMode::Url => {
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow!("repositories[{position}]: mode `url` requires `url`"))?;
                validate_http_url(url).with_context(|| format!("repositories[{position}].url"))?;
                if self.provider.is_some() {
                    bail!("repositories[{position}]: mode `url` does not accept `provider`");
                }
                if self.base_url.is_some() {
                    bail!("repositories[{position}]: mode `url` does not accept `baseUrl`");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSchedule {
    #[serde(default)]
    pub cron: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    #[serde(default)]
    pub repositories: JobSchedule,
    #[serde(default, skip_serializing)]
    backups: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing)]
    mirrors: Option<serde_yaml::Value>,
}

fn default_working_root() -> PathBuf {
    PathBuf::from("./gitvault-work")
}

/// The whole settings file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub credentials: BTreeMap<String, Credential>,
    #[serde(default)]
    pub repositories: Vec<RepositoryJob>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Local root under which bare mirrors are kept between runs.
    #[serde(default = "default_working_root")]
    pub working_root: PathBuf,
    #[serde(default, skip_serializing)]
    backups: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing)]
    mirrors: Option<serde_yaml::Value>,
}

impl Settings {
    /// Look up a credential by case-insensitive name.
    pub fn credential(&self, name: &str) -> Option<&Credential> {
        self.credentials.get(&name.trim().to_ascii_lowercase())
    }

    /// Fold credential names to lowercase; duplicate names after folding
    /// are a configuration error.
    fn normalize(&mut self) -> Result<()> {
        let mut folded = BTreeMap::new();
        for (name, credential) in std::mem::take(&mut self.credentials) {
            let key = name.trim().to_ascii_lowercase();
            if key.is_empty() {
                bail!("credentials: names must not be blank");
            }
            if folded.insert(key.clone(), credential).is_some() {
                bail!("credentials: duplicate name {key:?} (names are case-insensitive)");
            }
        }
        self.credentials = folded;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.backups.is_some() || self.mirrors.is_some() {
            bail!(
                "the `backups` and `mirrors` sections were removed; move each entry into \
                 `repositories` with `mode: provider` or `mode: url`"
            );
        }
        if self.schedule.backups.is_some() || self.schedule.mirrors.is_some() {
            bail!(
                "`schedule.backups` and `schedule.mirrors` were removed; configure \
                 `schedule.repositories.cron` instead"
            );
        }

        self.storage.validate()?;

        for credential in self.credentials.values() {
            if credential.api_key.trim().is_empty() {
                bail!("credentials: apiKey must not be blank");
            }
        }

        for (position, job) in self.repositories.iter().enumerate() {
            job.validate(position)?;
        }

        let cron = &self.schedule.repositories.cron;
        if cron.trim().is_empty() {
            bail!("schedule.repositories.cron is required");
        }
        parse_cron(cron)?;

        if self.working_root.as_os_str().is_empty() {
            bail!("workingRoot must not be blank");
        }
        Ok(())
    }
}

fn validate_http_url(raw: &str) -> Result<()> {
    let url = url::Url::parse(raw).with_context(|| format!("{raw:?} is not a valid URL"))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("{raw:?} must be an absolute http or https URL");
    }
    Ok(())
}

/// Parse a cron expression, 5-field first, then 6-field (seconds first).
/// Evaluation is always in UTC.
pub fn parse_cron(expression: &str) -> Result<croner::Cron> {
    let expression = expression.trim();
    if let Ok(cron) = croner::Cron::new(expression).parse() {
        return Ok(cron);
    }
    croner::Cron::new(expression)
        .with_seconds_required()
        .parse()
        .map_err(|err| anyhow!("invalid cron expression {expression:?}: {err}"))
}

/// Load, normalize, and validate a settings file.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    let mut settings: Settings = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse settings YAML {}", path.display()))?;
    settings.normalize()?;
    settings
        .validate()
        .with_context(|| format!("invalid settings in {}", path.display()))?;
    Ok(settings)
}

/// Resolve the settings path: the explicit argument, or the first default
/// candidate that exists.
pub fn resolve_settings_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_file() {
            bail!("settings file {} does not exist", path.display());
        }
        return Ok(path.to_path_buf());
    }
    for candidate in DEFAULT_SETTINGS_CANDIDATES {
        let path = Path::new(candidate);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
    }
    bail!(
        "no settings file found; pass a path or create one of: {}",
        DEFAULT_SETTINGS_CANDIDATES.join(", ")
    )
}

/// Reload a settings file into a handle, keeping the old snapshot when the
/// new content fails to load or validate.
pub(crate) fn reload_into(path: &Path, handle: &SettingsHandle) {
    match load_settings(path) {
        Ok(settings) => {
            if *handle.current() == settings {
                return;
            }
            tracing::info!("settings file {} changed, applying new configuration", path.display());
            handle.replace(settings);
        }
        Err(err) => {
            warn!(
                "ignoring settings change in {}: {err:#}",
                path.display()
            );
        }
    }
}
