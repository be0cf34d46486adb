//! Shared fakes for the end-to-end pipeline tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, bail};

use gitvault_config::{Credential, RepositoryJob, Settings};
use gitvault_forge::{Forge, ForgeClient, ForgeClientFactory, RemoteRepository};
use gitvault_git::{MirrorSync, SyncRequest};
use gitvault_keys::JobMode;

/// Mirror-sync fake: materializes a tiny bare-repo-shaped directory so the
/// archive upload has real content.
#[derive(Debug, Default)]
pub struct FakeGit {
    pub synced: Mutex<Vec<String>>,
}

impl MirrorSync for FakeGit {
    fn sync_bare_repository(&self, request: &SyncRequest<'_>) -> Result<()> {
        fs::create_dir_all(request.local_path)?;
        fs::write(request.local_path.join("HEAD"), "ref: refs/heads/main\n")?;
        fs::write(request.local_path.join("description"), request.remote_url)?;
        self.synced
            .lock()
            .expect("lock")
            .push(request.remote_url.to_string());
        Ok(())
    }
}

/// Mirror-sync fake that always fails.
#[derive(Debug, Default)]
pub struct BrokenGit;

impl MirrorSync for BrokenGit {
    fn sync_bare_repository(&self, request: &SyncRequest<'_>) -> Result<()> {
        bail!("refusing to sync {}", request.remote_url)
    }
}

struct FakeForgeClient {
    repositories: Vec<RemoteRepository>,
}

impl ForgeClient for FakeForgeClient {
    fn list_owned_repositories(&self, _token: &str) -> Result<Vec<RemoteRepository>> {
        Ok(self.repositories.clone())
    }
}

/// Forge factory returning a fixed repository list, or failing outright.
#[derive(Debug, Default)]
pub struct FakeForgeFactory {
    pub repositories: Vec<RemoteRepository>,
    pub fail_enumeration: bool,
}

impl FakeForgeFactory {
    pub fn with_clone_urls(urls: &[&str]) -> Self {
        Self {
            repositories: urls
                .iter()
                .map(|url| RemoteRepository {
                    clone_url: (*url).to_string(),
                    web_url: None,
                })
                .collect(),
            fail_enumeration: false,
        }
    }
}

impl ForgeClientFactory for FakeForgeFactory {
    fn client(&self, _forge: Forge, _base_url: Option<&str>) -> Result<Box<dyn ForgeClient>> {
        if self.fail_enumeration {
            bail!("enumeration endpoint is down");
        }
        Ok(Box::new(FakeForgeClient {
            repositories: self.repositories.clone(),
        }))
    }
}

pub fn provider_job(forge: Forge, credential: &str) -> RepositoryJob {
    RepositoryJob {
        mode: JobMode::Provider,
        provider: Some(forge),
        credential: Some(credential.to_string()),
        url: None,
        base_url: None,
        lfs: false,
        enabled: true,
    }
}

pub fn url_job(url: &str) -> RepositoryJob {
    RepositoryJob {
        mode: JobMode::Url,
        provider: None,
        credential: None,
        url: Some(url.to_string()),
        base_url: None,
        lfs: false,
        enabled: true,
    }
}

/// Settings with a working root under the given directory and one named
/// credential (`main`).
pub fn settings(working_root: &Path, jobs: Vec<RepositoryJob>) -> Settings {
    let mut credentials = BTreeMap::new();
    credentials.insert(
        "main".to_string(),
        Credential {
            username: None,
            api_key: "token".to_string(),
        },
    );

    let mut settings = Settings::default();
    settings.credentials = credentials;
    settings.repositories = jobs;
    settings.working_root = working_root.to_path_buf();
    settings.schedule.repositories.cron = "* * * * *".to_string();
    settings
}
