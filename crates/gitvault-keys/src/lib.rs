//! Repository URL parsing and object key derivation.
//!
//! Everything in this crate is a pure function: a clone URL plus a job mode
//! deterministically produces the storage prefix, the repository identity,
//! the index object key, and the local mirror path. Two URLs that name the
//! same repository after normalization (`http` vs `https`, case, a `.git`
//! suffix, a trailing slash) intentionally collide so that republishing the
//! same repository reuses the same storage location.
//!
//! # Example
//!
//! ```
//! use gitvault_keys::{JobMode, parse_repository_url, repository_identity};
//!
//! let info = parse_repository_url("https://github.com/Acme/Widget.git").expect("parse");
//! let identity = repository_identity(JobMode::Provider, Some("github"), &info);
//! assert_eq!(identity, "provider/github/github.com/acme/widget");
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

/// Fixed object key of the repository registry document.
pub const REGISTRY_KEY: &str = "indexes/repositories/registry.json";

/// File name of the diagnostic marker object at each repository prefix.
pub const MARKER_FILE: &str = ".repository-root";

/// Suffix shared by every snapshot archive key.
pub const ARCHIVE_SUFFIX: &str = "_repo.tar.gz";

/// Failure to derive storage keys from a clone URL.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The URL is unparseable, non-HTTP, or has too few path segments.
    #[error("invalid repository url {url:?}: {reason}")]
    InvalidRepositoryUrl { url: String, reason: String },
}

impl KeyError {
    fn invalid(url: &str, reason: impl Into<String>) -> Self {
        KeyError::InvalidRepositoryUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// How a repository job names its repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    /// A forge account is enumerated through its API.
    Provider,
    /// A single clone URL.
    Url,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Provider => "provider",
            JobMode::Url => "url",
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized path components of a repository clone URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryPathInfo {
    /// Registered domain: the last two dot-separated host labels, lowercase.
    pub base_domain: String,
    /// The entire host, lowercase.
    pub full_domain: String,
    /// First path segment.
    pub owner: String,
    /// Second path segment, when present.
    pub group: Option<String>,
    /// Remaining middle segments joined with `-`, when present.
    pub secondary_group: Option<String>,
    /// Last path segment with any `.git` suffix stripped.
    pub repository_name: String,
}

impl RepositoryPathInfo {
    /// Ordered hierarchy used in storage prefixes and identities.
    pub fn hierarchy(&self) -> Vec<&str> {
        let mut parts = vec![self.owner.as_str()];
        if let Some(group) = &self.group {
            parts.push(group.as_str());
        }
        if let Some(secondary) = &self.secondary_group {
            parts.push(secondary.as_str());
        }
        parts.push(self.repository_name.as_str());
        parts
    }
}

/// Parse an absolute http/https clone URL into its normalized components.
pub fn parse_repository_url(raw: &str) -> Result<RepositoryPathInfo, KeyError> {
    let url = Url::parse(raw.trim()).map_err(|err| KeyError::invalid(raw, err.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(KeyError::invalid(raw, format!("unsupported scheme {other:?}"))),
    }

    let host = url
        .host_str()
        .ok_or_else(|| KeyError::invalid(raw, "missing host"))?
        .to_ascii_lowercase();

    let segments: Vec<&str> = url.path().split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return Err(KeyError::invalid(
            raw,
            "expected at least an owner and a repository path segment",
        ));
    }

    let labels: Vec<&str> = host.split('.').collect();
    let base_domain = if labels.len() > 2 {
        labels[labels.len() - 2..].join(".")
    } else {
        host.clone()
    };

    let last = segments[segments.len() - 1];
    let name_raw = if last.to_ascii_lowercase().ends_with(".git") {
        &last[..last.len() - 4]
    } else {
        last
    };

    let middle = &segments[1..segments.len() - 1];
    let group = middle.first().map(|s| sanitize_segment(s));
    let secondary_group = if middle.len() > 1 {
        Some(sanitize_segment(&middle[1..].join("-")))
    } else {
        None
    };

    Ok(RepositoryPathInfo {
        base_domain,
        full_domain: host,
        owner: sanitize_segment(segments[0]),
        group,
        secondary_group,
        repository_name: sanitize_segment(name_raw),
    })
}

/// Normalize one path segment: runs of characters outside `[a-zA-Z0-9._-]`
/// collapse to a single `-`, the result is lowercased and trimmed of
/// leading/trailing `-`; an empty result becomes `unknown`.
pub fn sanitize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Blank input yields `""`; anything else is trimmed of surrounding `/` and
/// gets exactly one trailing `/`.
pub fn ensure_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Storage prefix under which a repository's archives and marker live.
pub fn repository_prefix(mode: JobMode, provider: Option<&str>, info: &RepositoryPathInfo) -> String {
    let hierarchy = info.hierarchy().join("/");
    match mode {
        JobMode::Provider => {
            let provider = sanitize_segment(provider.unwrap_or(""));
            format!("repositories/provider/{provider}/{hierarchy}")
        }
        JobMode::Url => format!("repositories/url/{}/{hierarchy}", info.full_domain),
    }
}

/// Canonical identity string; feeds both the index key and the index
/// document's `repositoryIdentity` field.
pub fn repository_identity(
    mode: JobMode,
    provider: Option<&str>,
    info: &RepositoryPathInfo,
) -> String {
    let hierarchy = info.hierarchy().join("/");
    match mode {
        JobMode::Provider => {
            let provider = sanitize_segment(provider.unwrap_or(""));
            format!("provider/{provider}/{}/{hierarchy}", info.base_domain)
        }
        JobMode::Url => format!("url/{}/{hierarchy}", info.full_domain),
    }
}

/// Object key of the per-repository index document for an identity.
pub fn index_object_key(identity: &str) -> String {
    format!("indexes/repositories/{}/index.json", identity.trim_matches('/'))
}

/// Object key of a snapshot archive.
pub fn archive_object_key(repository_prefix: &str, timestamp_unix_seconds: i64) -> String {
    format!(
        "{}{timestamp_unix_seconds}{ARCHIVE_SUFFIX}",
        ensure_prefix(repository_prefix)
    )
}

/// Object key of the diagnostic marker at a repository prefix.
pub fn marker_object_key(repository_prefix: &str) -> String {
    format!("{}{MARKER_FILE}", ensure_prefix(repository_prefix))
}

/// Local working directory for a repository's bare mirror.
///
/// Provider mode hashes `provider:url` so renamed repositories get a fresh
/// directory; url mode mirrors the storage prefix under the working root.
pub fn local_mirror_path(
    working_root: &Path,
    mode: JobMode,
    provider: Option<&str>,
    clone_url: &str,
    info: &RepositoryPathInfo,
) -> PathBuf {
    let mut path = working_root.join("repositories");
    match mode {
        JobMode::Provider => {
            let digest = Sha256::digest(
                format!("{}:{clone_url}", provider.unwrap_or("")).as_bytes(),
            );
            path.push("provider");
            path.push(hex::encode(digest));
        }
        JobMode::Url => {
            path.push("url");
            path.push(&info.full_domain);
            for segment in info.hierarchy() {
                path.push(segment);
            }
        }
    }
    path
}
