//! The per-run sync pipeline.
//!
//! One invocation walks every enabled repository job sequentially: provider
//! jobs are expanded through their forge API, url jobs carry a single clone
//! URL. Each repository goes through mirror → archive upload → index append
//! → marker write, and the registry is written once at the end of the run if
//! the set of known indexes changed.
//!
//! Failure semantics follow the job boundaries: a bad URL or a missing
//! credential skips that repository, a forge enumeration failure aborts that
//! provider job only, and any per-repository error is logged with the clone
//! URL while the run continues. Only storage failures around the registry
//! itself abort the run.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::{info, warn};

use gitvault_config::{Credential, RepositoryJob, Settings};
use gitvault_forge::{Forge, ForgeClientFactory};
use gitvault_git::{BasicCredential, MirrorSync, SyncRequest};
use gitvault_index::{IndexReadOutcome, RepositoryIndex, RepositoryRegistry, SnapshotRef};
use gitvault_keys::{JobMode, KeyError};
use gitvault_storage::ObjectStore;

use crate::ShutdownFlag;

/// Outcome counts for one run across all jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Repositories synced and recorded.
    pub synced: usize,
    /// Repositories skipped before any work (blank URL, bad URL, missing
    /// credential).
    pub skipped: usize,
    /// Repositories or provider jobs that failed mid-work.
    pub failed: usize,
}

/// Run the pipeline once across all enabled repository jobs.
pub fn run_repositories(
    settings: &Settings,
    store: &dyn ObjectStore,
    git: &dyn MirrorSync,
    forges: &dyn ForgeClientFactory,
    shutdown: &ShutdownFlag,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();

    let loaded = gitvault_index::load_registry(store).context("failed to load registry")?;
    let mut registry = loaded.registry;
    let registry_raw = loaded.raw;

    for job in settings.repositories.iter().filter(|job| job.enabled) {
        if shutdown.is_triggered() {
            info!("shutdown requested, ending run early");
            break;
        }
        match job.mode {
            JobMode::Url => sync_url_job(settings, store, git, &mut registry, job, &mut summary),
            JobMode::Provider => sync_provider_job(
                settings,
                store,
                git,
                forges,
                &mut registry,
                job,
                shutdown,
                &mut summary,
            ),
        }
    }

    if !registry.index_keys.is_empty() || registry_raw.is_some() {
        gitvault_index::save_registry_if_changed(store, &registry, registry_raw.as_deref())
            .context("failed to write registry")?;
    }

    Ok(summary)
}

fn sync_url_job(
    settings: &Settings,
    store: &dyn ObjectStore,
    git: &dyn MirrorSync,
    registry: &mut RepositoryRegistry,
    job: &RepositoryJob,
    summary: &mut RunSummary,
) {
    let Some(url) = job.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        warn!("url job has a blank url, skipping");
        summary.skipped += 1;
        return;
    };
    let credential = match resolve_credential(settings, job) {
        Ok(credential) => credential,
        Err(missing) => {
            warn!("credential {missing:?} is not configured, skipping {url}");
            summary.skipped += 1;
            return;
        }
    };
    record(
        sync_one(
            settings, store, git, registry, JobMode::Url, None, url, credential, false, job.lfs,
        ),
        url,
        summary,
    );
}

#[allow(clippy::too_many_arguments)]
fn sync_provider_job(
    settings: &Settings,
    store: &dyn ObjectStore,
    git: &dyn MirrorSync,
    forges: &dyn ForgeClientFactory,
    registry: &mut RepositoryRegistry,
    job: &RepositoryJob,
    shutdown: &ShutdownFlag,
    summary: &mut RunSummary,
) {
    let Some(forge) = job.provider else {
        warn!("provider job has no provider, skipping");
        summary.skipped += 1;
        return;
    };
    let credential = match resolve_credential(settings, job) {
        Ok(Some(credential)) => credential,
        Ok(None) => {
            warn!("provider job for {forge} names no credential, skipping");
            summary.skipped += 1;
            return;
        }
        Err(missing) => {
            warn!("credential {missing:?} is not configured, skipping {forge} job");
            summary.skipped += 1;
            return;
        }
    };

    let repositories = match forges
        .client(forge, job.base_url.as_deref())
        .and_then(|client| client.list_owned_repositories(&credential.api_key))
    {
        Ok(repositories) => repositories,
        Err(err) => {
            tracing::error!("repository enumeration failed for {forge}: {err:#}");
            summary.failed += 1;
            return;
        }
    };
    info!("{forge} reported {} repositories", repositories.len());

    for repository in &repositories {
        if shutdown.is_triggered() {
            info!("shutdown requested, ending {forge} job early");
            return;
        }
        record(
            sync_one(
                settings,
                store,
                git,
                registry,
                JobMode::Provider,
                Some(forge),
                &repository.clone_url,
                Some(credential.clone()),
                true,
                job.lfs,
            ),
            &repository.clone_url,
            summary,
        );
    }
}

/// Resolve the job's credential reference; `Err` carries the missing name.
fn resolve_credential(
    settings: &Settings,
    job: &RepositoryJob,
) -> Result<Option<Credential>, String> {
    match job.credential.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        None => Ok(None),
        Some(name) => settings
            .credential(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| name.to_string()),
    }
}

fn record(result: Result<()>, url: &str, summary: &mut RunSummary) {
    match result {
        Ok(()) => summary.synced += 1,
        Err(err) if err.downcast_ref::<KeyError>().is_some() => {
            warn!("skipping {url}: {err}");
            summary.skipped += 1;
        }
        Err(err) => {
            tracing::error!("failed to sync {url}: {err:#}");
            summary.failed += 1;
        }
    }
}

/// Sync one repository: mirror, archive, index, marker.
#[allow(clippy::too_many_arguments)]
fn sync_one(
    settings: &Settings,
    store: &dyn ObjectStore,
    git: &dyn MirrorSync,
    registry: &mut RepositoryRegistry,
    mode: JobMode,
    provider: Option<Forge>,
    clone_url: &str,
    credential: Option<Credential>,
    force: bool,
    include_lfs: bool,
) -> Result<()> {
    let info = gitvault_keys::parse_repository_url(clone_url)?;
    let provider_name = provider.map(|f| f.as_str());
    let prefix = gitvault_keys::repository_prefix(mode, provider_name, &info);
    let identity = gitvault_keys::repository_identity(mode, provider_name, &info);
    let index_key = gitvault_keys::index_object_key(&identity);
    let local_path = gitvault_keys::local_mirror_path(
        &settings.working_root,
        mode,
        provider_name,
        clone_url,
        &info,
    );

    let (mut index, prior_raw) = match gitvault_index::load_index(store, &index_key)? {
        IndexReadOutcome::Loaded { index, raw } => (index, Some(raw)),
        IndexReadOutcome::Missing => (RepositoryIndex::new(mode, identity.clone()), None),
        IndexReadOutcome::Corrupt { raw } => {
            warn!("index {index_key} is unparseable, rebuilding it from this sync");
            (RepositoryIndex::new(mode, identity.clone()), Some(raw))
        }
    };

    git.sync_bare_repository(&SyncRequest {
        remote_url: clone_url,
        local_path: &local_path,
        credential: credential.map(|c| BasicCredential {
            username: c.username.unwrap_or_default(),
            api_key: c.api_key,
        }),
        force,
        include_lfs,
    })
    .with_context(|| format!("mirror sync failed for {clone_url}"))?;

    let timestamp = Utc::now().timestamp();
    let archive_key = gitvault_keys::archive_object_key(&prefix, timestamp);
    store
        .upload_directory_tar_gz(&local_path, &archive_key)
        .with_context(|| format!("archive upload failed for {clone_url}"))?;

    index
        .snapshots
        .retain(|snapshot| snapshot.is_valid() && snapshot.root_prefix != archive_key);
    index.snapshots.push(SnapshotRef {
        root_prefix: archive_key.clone(),
        timestamp_unix_seconds: timestamp,
    });
    index.snapshots = gitvault_index::normalize_snapshots(std::mem::take(&mut index.snapshots));
    index.mode = mode;
    index.repository_identity = identity;
    gitvault_index::save_index_if_changed(store, &index_key, &index, prior_raw.as_deref())?;

    registry.insert(&index_key);

    let marker = format!(
        "mode={mode}\nrepository={clone_url}\nupdatedAt={}\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    store.upload_text(&gitvault_keys::marker_object_key(&prefix), &marker)?;

    info!("synced {clone_url} -> {archive_key}");
    Ok(())
}
