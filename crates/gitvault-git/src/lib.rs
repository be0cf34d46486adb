//! Bare-mirror synchronization via the git CLI.
//!
//! The sync pipeline needs exactly one git capability: make sure an
//! up-to-date bare mirror of a remote exists at a local path. [`CliGit`]
//! provides it by shelling out to `git` — `clone --mirror` for a fresh
//! mirror, `remote set-url` + `fetch --all --prune` for an existing one,
//! `git lfs fetch --all` when LFS objects are wanted.
//!
//! Credentials ride on an `Authorization: Basic` header passed through
//! `-c http.extraHeader=…`; the child always runs with
//! `GIT_TERMINAL_PROMPT=0` so a missing credential fails instead of
//! blocking the scheduler on a prompt. The header value never appears in
//! errors or logs.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;

/// Username + API key pair injected as HTTP basic auth.
#[derive(Debug, Clone)]
pub struct BasicCredential {
    /// May be empty; some forges ignore the username for token auth.
    pub username: String,
    pub api_key: String,
}

impl BasicCredential {
    fn header(&self) -> String {
        let token = BASE64.encode(format!("{}:{}", self.username, self.api_key));
        format!("Authorization: Basic {token}")
    }
}

/// One mirror-sync invocation.
#[derive(Debug)]
pub struct SyncRequest<'a> {
    pub remote_url: &'a str,
    pub local_path: &'a Path,
    pub credential: Option<BasicCredential>,
    /// Delete a directory that exists but holds no bare repository before
    /// cloning. An existing bare mirror is always reused.
    pub force: bool,
    pub include_lfs: bool,
}

/// Ensures a bare mirror is up to date; failure is an error.
pub trait MirrorSync: Send + Sync {
    fn sync_bare_repository(&self, request: &SyncRequest<'_>) -> Result<()>;
}

/// Whether a directory looks like a bare git repository.
pub fn is_bare_repository(path: &Path) -> bool {
    path.join("HEAD").is_file() && path.join("objects").is_dir() && path.join("refs").is_dir()
}

/// [`MirrorSync`] implementation over the `git` binary on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CliGit;

impl CliGit {
    pub fn new() -> Self {
        Self
    }

    fn run(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
        credential: Option<&BasicCredential>,
    ) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(credential) = credential {
            cmd.arg("-c");
            cmd.arg(format!("http.extraHeader={}", credential.header()));
        }
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        debug!("running git {}", args.join(" "));
        let output = cmd
            .output()
            .with_context(|| format!("failed to run git {}", args.first().unwrap_or(&"")))?;
        if !output.status.success() {
            bail!(
                "git {} failed ({}): {}",
                args.first().unwrap_or(&""),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl MirrorSync for CliGit {
    fn sync_bare_repository(&self, request: &SyncRequest<'_>) -> Result<()> {
        let path = request.local_path;
        let credential = request.credential.as_ref();

        if is_bare_repository(path) {
            self.run(
                &["remote", "set-url", "origin", request.remote_url],
                Some(path),
                None,
            )?;
            self.run(&["fetch", "--all", "--prune"], Some(path), credential)?;
        } else {
            if path.exists() {
                if !request.force {
                    bail!(
                        "local path {} exists but is not a bare repository",
                        path.display()
                    );
                }
                fs::remove_dir_all(path)
                    .with_context(|| format!("failed to clear {}", path.display()))?;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let path_str = path.to_string_lossy();
            self.run(
                &["clone", "--mirror", request.remote_url, path_str.as_ref()],
                None,
                credential,
            )?;
        }

        if request.include_lfs {
            self.run(&["lfs", "fetch", "--all"], Some(path), credential)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn init_source(dir: &Path) {
        git(dir, &["init", "--initial-branch=main"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "user.name", "Test User"]);
        git(dir, &["commit", "--allow-empty", "-m", "first"]);
    }

    fn head_of(dir: &Path) -> String {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir)
            .output()
            .expect("rev-parse");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn file_url(dir: &Path) -> String {
        format!("file://{}", dir.display())
    }

    #[test]
    fn clones_a_fresh_mirror() {
        let td = tempdir().expect("tempdir");
        let source = td.path().join("source");
        fs::create_dir_all(&source).expect("mkdir");
        init_source(&source);

        let mirror = td.path().join("mirrors/demo");
        CliGit::new()
            .sync_bare_repository(&SyncRequest {
                remote_url: &file_url(&source),
                local_path: &mirror,
                credential: None,
                force: false,
                include_lfs: false,
            })
            .expect("sync");

        assert!(is_bare_repository(&mirror));
        assert_eq!(head_of(&mirror), head_of(&source));
    }

    #[test]
    fn fetches_into_an_existing_mirror() {
        let td = tempdir().expect("tempdir");
        let source = td.path().join("source");
        fs::create_dir_all(&source).expect("mkdir");
        init_source(&source);

        let mirror = td.path().join("mirror");
        let request = SyncRequest {
            remote_url: &file_url(&source),
            local_path: &mirror,
            credential: None,
            force: false,
            include_lfs: false,
        };
        let git_service = CliGit::new();
        git_service.sync_bare_repository(&request).expect("first sync");

        git(&source, &["commit", "--allow-empty", "-m", "second"]);
        git_service.sync_bare_repository(&request).expect("second sync");

        assert_eq!(head_of(&mirror), head_of(&source));
    }

    #[test]
    fn refuses_non_repo_debris_without_force() {
        let td = tempdir().expect("tempdir");
        let source = td.path().join("source");
        fs::create_dir_all(&source).expect("mkdir");
        init_source(&source);

        let blocked = td.path().join("blocked");
        fs::create_dir_all(&blocked).expect("mkdir");
        fs::write(blocked.join("junk.txt"), "junk").expect("write");

        let err = CliGit::new()
            .sync_bare_repository(&SyncRequest {
                remote_url: &file_url(&source),
                local_path: &blocked,
                credential: None,
                force: false,
                include_lfs: false,
            })
            .expect_err("must fail");
        assert!(err.to_string().contains("not a bare repository"));
    }

    #[test]
    fn force_clears_non_repo_debris() {
        let td = tempdir().expect("tempdir");
        let source = td.path().join("source");
        fs::create_dir_all(&source).expect("mkdir");
        init_source(&source);

        let blocked = td.path().join("blocked");
        fs::create_dir_all(&blocked).expect("mkdir");
        fs::write(blocked.join("junk.txt"), "junk").expect("write");

        CliGit::new()
            .sync_bare_repository(&SyncRequest {
                remote_url: &file_url(&source),
                local_path: &blocked,
                credential: None,
                force: true,
                include_lfs: false,
            })
            .expect("sync");
        assert!(is_bare_repository(&blocked));
    }

    #[test]
    fn sync_failure_carries_stderr() {
        let td = tempdir().expect("tempdir");
        let missing = td.path().join("does-not-exist");

        let err = CliGit::new()
            .sync_bare_repository(&SyncRequest {
                remote_url: &format!("file://{}", missing.display()),
                local_path: &td.path().join("mirror"),
                credential: None,
                force: false,
                include_lfs: false,
            })
            .expect_err("must fail");
        assert!(err.to_string().contains("git clone failed"));
    }

    #[test]
    fn basic_credential_header_is_base64() {
        let credential = BasicCredential {
            username: "user".to_string(),
            api_key: "secret".to_string(),
        };
        assert_eq!(credential.header(), "Authorization: Basic dXNlcjpzZWNyZXQ=");
    }

    #[test]
    fn bare_detection_rejects_plain_directories() {
        let td = tempdir().expect("tempdir");
        assert!(!is_bare_repository(td.path()));
        assert!(!is_bare_repository(&td.path().join("missing")));
    }
}
