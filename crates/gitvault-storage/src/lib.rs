//! Object storage backends for gitvault.
//!
//! This crate provides the [`ObjectStore`] trait the sync pipeline and the
//! retention engine run against, plus two implementations: [`FileStore`]
//! (object keys mapped under a local directory) and [`MemoryStore`] (a
//! map with operation counters, for embedders and tests).
//!
//! The trait mirrors the cost contract of an S3-compatible bucket: reads of
//! single keys, text uploads, whole-directory `tar.gz` uploads, and key-wise
//! deletion. `list_keys` and `delete_prefix` exist for administrative
//! cleanup only and are never called from the scheduled paths.
//!
//! # Example
//!
//! ```
//! use gitvault_storage::{MemoryStore, ObjectStore};
//!
//! let store = MemoryStore::new();
//! store.upload_text("indexes/demo.json", "{}").expect("upload");
//! assert_eq!(
//!     store.get_text_if_exists("indexes/demo.json").expect("get").as_deref(),
//!     Some("{}")
//! );
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Largest number of keys a single [`ObjectStore::delete_objects`] call may
/// carry, matching the S3 batch-delete limit.
pub const MAX_DELETE_BATCH: usize = 1000;

/// Storage operations the snapshot engine consumes.
pub trait ObjectStore: Send + Sync {
    /// Read an object as UTF-8 text; a missing key is `None`, not an error.
    fn get_text_if_exists(&self, key: &str) -> Result<Option<String>>;

    /// Write an object from UTF-8 text.
    fn upload_text(&self, key: &str, content: &str) -> Result<()>;

    /// Pack a local directory (no base directory entry) into a `tar.gz`
    /// object. Implementations may suppress the upload when the remote
    /// already holds an archive with a matching content hash, but must
    /// still report success.
    fn upload_directory_tar_gz(&self, local_path: &Path, key: &str) -> Result<()>;

    /// Delete objects by key. Missing keys are not an error.
    fn delete_objects(&self, keys: &[String]) -> Result<()>;

    /// Delete every object under a prefix. Cleanup paths only.
    fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// List keys under a prefix. Administrative use only; forbidden on the
    /// sync and retention paths.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// How request payloads are signed against the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadSignatureMode {
    /// Full payload SHA-256 signing.
    #[default]
    Full,
    /// Chunked streaming signatures.
    Streaming,
    /// `UNSIGNED-PAYLOAD`.
    Unsigned,
}

/// Which backend serves the configured bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// An S3-compatible endpoint.
    #[default]
    S3,
    /// A local directory, keys mapped to file paths.
    File,
}

/// The `storage` section of the settings file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub payload_signature_mode: PayloadSignatureMode,
    #[serde(default)]
    pub always_calculate_content_md5: bool,
    /// Object root directory for the file backend.
    #[serde(default)]
    pub root: String,
    /// Snapshot age cutoff in days; absent disables retention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<i64>,
    /// Newest snapshots kept per repository regardless of age.
    #[serde(default = "default_retention_minimum")]
    pub retention_minimum: u32,
}

fn default_retention_minimum() -> u32 {
    1
}

impl StorageConfig {
    /// Validate the section for the selected backend.
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            StorageBackendKind::S3 => {
                if self.endpoint.trim().is_empty() {
                    bail!("storage.endpoint is required");
                }
                let endpoint = url::Url::parse(&self.endpoint)
                    .with_context(|| format!("storage.endpoint {:?} is not a valid URL", self.endpoint))?;
                if endpoint.scheme() != "http" && endpoint.scheme() != "https" {
                    bail!("storage.endpoint must be an absolute http or https URL");
                }
                if self.region.trim().is_empty() {
                    bail!("storage.region is required");
                }
                if self.access_key_id.trim().is_empty() {
                    bail!("storage.accessKeyId is required");
                }
                if self.secret_access_key.trim().is_empty() {
                    bail!("storage.secretAccessKey is required");
                }
                if self.bucket.trim().is_empty() {
                    bail!("storage.bucket is required");
                }
            }
            StorageBackendKind::File => {
                if self.root.trim().is_empty() {
                    bail!("storage.root is required for the file backend");
                }
            }
        }
        if let Some(days) = self.retention
            && days < 1
        {
            bail!("storage.retention must be a positive number of days");
        }
        Ok(())
    }
}

/// Build the configured object store.
///
/// The S3 wire client (signing, multipart) is not part of this build; the
/// configuration is validated so a deployment backend can be dropped in
/// behind [`ObjectStore`].
pub fn build_object_store(config: &StorageConfig) -> Result<Box<dyn ObjectStore>> {
    config.validate()?;
    match config.backend {
        StorageBackendKind::File => Ok(Box::new(FileStore::new(PathBuf::from(&config.root)))),
        StorageBackendKind::S3 => {
            bail!("the s3 backend is not provided by this build; use `storage.backend: file`")
        }
    }
}

/// Stream a directory into `out` as a gzip-compressed tar with no base
/// directory entry, returning the writer after the stream is finished.
pub fn write_directory_tar_gz<W: Write>(local_path: &Path, out: W) -> Result<W> {
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all("", local_path)
        .with_context(|| format!("failed to archive {}", local_path.display()))?;
    let encoder = builder.into_inner().context("failed to finish tar stream")?;
    encoder.finish().context("failed to finish gzip stream")
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn check_key(key: &str) -> Result<&str> {
    let key = key.trim_matches('/');
    if key.is_empty() {
        bail!("object key must not be empty");
    }
    if key.split('/').any(|part| part.is_empty() || part == "..") {
        bail!("object key {key:?} contains an invalid path component");
    }
    Ok(key)
}

/// Filesystem-backed object store.
///
/// Object keys become paths under the root directory; writes go through a
/// temporary file and a rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(check_key(key)?))
    }

    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(key)?;
        let parent = path
            .parent()
            .with_context(|| format!("object key {key:?} has no parent directory"))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
        tmp.write_all(bytes)
            .with_context(|| format!("failed to write object {key}"))?;
        tmp.as_file().sync_all().ok();
        tmp.persist(&path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to persist object {key}"))?;
        Ok(())
    }
}

impl ObjectStore for FileStore {
    fn get_text_if_exists(&self, key: &str) -> Result<Option<String>> {
        let path = self.object_path(key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read object {}", path.display()))
            }
        }
    }

    fn upload_text(&self, key: &str, content: &str) -> Result<()> {
        if self.get_text_if_exists(key)?.as_deref() == Some(content) {
            return Ok(());
        }
        self.write_atomic(key, content.as_bytes())
    }

    fn upload_directory_tar_gz(&self, local_path: &Path, key: &str) -> Result<()> {
        let archive = write_directory_tar_gz(local_path, Vec::new())?;
        if let Some(existing) = self.object_path(key).ok().filter(|p| p.is_file()) {
            let current = fs::read(&existing)
                .with_context(|| format!("failed to read object {}", existing.display()))?;
            if sha256_hex(&current) == sha256_hex(&archive) {
                return Ok(());
            }
        }
        self.write_atomic(key, &archive)
    }

    fn delete_objects(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            let path = self.object_path(key)?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to delete object {}", path.display()));
                }
            }
        }
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let keys = self.list_keys(prefix)?;
        self.delete_objects(&keys)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        fn collect(dir: &Path, root: &Path, out: &mut Vec<String>) -> Result<()> {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    collect(&path, root, out)?;
                } else if let Ok(relative) = path.strip_prefix(root)
                    && let Some(s) = relative.to_str()
                {
                    out.push(s.replace('\\', "/"));
                }
            }
            Ok(())
        }

        let mut keys = Vec::new();
        if self.root.exists() {
            collect(&self.root, &self.root, &mut keys)?;
        }
        keys.retain(|k| k.starts_with(prefix.trim_matches('/')));
        keys.sort();
        Ok(keys)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    objects: BTreeMap<String, Vec<u8>>,
    puts: u64,
    deletes: u64,
}

/// In-memory object store with PUT/DELETE counters.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of object writes issued so far.
    pub fn put_count(&self) -> u64 {
        self.locked().puts
    }

    /// Number of single-key deletions attempted so far.
    pub fn delete_count(&self) -> u64 {
        self.locked().deletes
    }

    pub fn contains(&self, key: &str) -> bool {
        self.locked().objects.contains_key(key)
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.locked()
            .objects
            .get(key)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn keys(&self) -> Vec<String> {
        self.locked().objects.keys().cloned().collect()
    }

    /// Seed an object without touching the PUT counter.
    pub fn seed_text(&self, key: &str, content: &str) {
        self.locked()
            .objects
            .insert(key.trim_matches('/').to_string(), content.as_bytes().to_vec());
    }
}

impl ObjectStore for MemoryStore {
    fn get_text_if_exists(&self, key: &str) -> Result<Option<String>> {
        let key = check_key(key)?;
        Ok(self
            .locked()
            .objects
            .get(key)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
    }

    fn upload_text(&self, key: &str, content: &str) -> Result<()> {
        let key = check_key(key)?;
        let mut inner = self.locked();
        inner.puts += 1;
        inner.objects.insert(key.to_string(), content.as_bytes().to_vec());
        Ok(())
    }

    fn upload_directory_tar_gz(&self, local_path: &Path, key: &str) -> Result<()> {
        let key = check_key(key)?;
        let archive = write_directory_tar_gz(local_path, Vec::new())?;
        let mut inner = self.locked();
        inner.puts += 1;
        inner.objects.insert(key.to_string(), archive);
        Ok(())
    }

    fn delete_objects(&self, keys: &[String]) -> Result<()> {
        let mut inner = self.locked();
        for key in keys {
            inner.deletes += 1;
            inner.objects.remove(key.trim_matches('/'));
        }
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let prefix = prefix.trim_matches('/').to_string();
        let mut inner = self.locked();
        let doomed: Vec<String> = inner
            .objects
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in doomed {
            inner.deletes += 1;
            inner.objects.remove(&key);
        }
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_matches('/');
        Ok(self
            .locked()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn file_store_roundtrips_text() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path().to_path_buf());

        store.upload_text("indexes/a/index.json", "{}").expect("upload");
        assert_eq!(
            store.get_text_if_exists("indexes/a/index.json").expect("get").as_deref(),
            Some("{}")
        );
        assert_eq!(store.get_text_if_exists("missing").expect("get"), None);
    }

    #[test]
    fn file_store_rejects_traversal_keys() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path().to_path_buf());

        assert!(store.upload_text("../escape", "x").is_err());
        assert!(store.upload_text("", "x").is_err());
        assert!(store.upload_text("a//b", "x").is_err());
    }

    #[test]
    fn file_store_delete_tolerates_missing_keys() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path().to_path_buf());

        store.upload_text("a/b", "x").expect("upload");
        store
            .delete_objects(&["a/b".to_string(), "a/missing".to_string()])
            .expect("delete");
        assert_eq!(store.get_text_if_exists("a/b").expect("get"), None);
    }

    #[test]
    fn file_store_lists_and_deletes_prefix() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path().to_path_buf());

        store.upload_text("repo/a/1", "1").expect("upload");
        store.upload_text("repo/a/2", "2").expect("upload");
        store.upload_text("repo/b/1", "3").expect("upload");

        assert_eq!(store.list_keys("repo/a").expect("list").len(), 2);

        store.delete_prefix("repo/a").expect("delete prefix");
        assert_eq!(store.list_keys("repo").expect("list"), vec!["repo/b/1".to_string()]);
    }

    #[test]
    fn directory_archive_has_relative_entries() {
        let td = tempdir().expect("tempdir");
        let src = td.path().join("mirror");
        fs::create_dir_all(src.join("refs/heads")).expect("mkdir");
        fs::write(src.join("HEAD"), "ref: refs/heads/main\n").expect("write");
        fs::write(src.join("refs/heads/main"), "abc123\n").expect("write");

        let archive = write_directory_tar_gz(&src, Vec::new()).expect("pack");

        let decoder = flate2::read::GzDecoder::new(archive.as_slice());
        let mut tar = tar::Archive::new(decoder);
        let mut names = Vec::new();
        for entry in tar.entries().expect("entries") {
            let entry = entry.expect("entry");
            names.push(entry.path().expect("path").to_string_lossy().into_owned());
        }
        assert!(names.iter().any(|n| n == "HEAD"));
        assert!(names.iter().any(|n| n == "refs/heads/main"));
        assert!(names.iter().all(|n| !n.starts_with('/') && !n.starts_with("mirror")));
    }

    #[test]
    fn archive_contents_survive_roundtrip() {
        let td = tempdir().expect("tempdir");
        let src = td.path().join("mirror");
        fs::create_dir_all(&src).expect("mkdir");
        fs::write(src.join("packed-refs"), "# pack-refs\n").expect("write");

        let store = FileStore::new(td.path().join("bucket"));
        store
            .upload_directory_tar_gz(&src, "repo/1_repo.tar.gz")
            .expect("upload");

        let bytes = fs::read(td.path().join("bucket/repo/1_repo.tar.gz")).expect("read");
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(bytes.as_slice()));
        let mut found = String::new();
        for entry in tar.entries().expect("entries") {
            let mut entry = entry.expect("entry");
            if entry.path().expect("path").to_string_lossy() == "packed-refs" {
                entry.read_to_string(&mut found).expect("read entry");
            }
        }
        assert_eq!(found, "# pack-refs\n");
    }

    #[test]
    fn memory_store_counts_operations() {
        let store = MemoryStore::new();
        store.upload_text("a", "1").expect("upload");
        store.upload_text("b", "2").expect("upload");
        store.delete_objects(&["a".to_string()]).expect("delete");

        assert_eq!(store.put_count(), 2);
        assert_eq!(store.delete_count(), 1);
        assert!(store.contains("b"));
        assert!(!store.contains("a"));
    }

    #[test]
    fn memory_store_seed_does_not_count() {
        let store = MemoryStore::new();
        store.seed_text("a", "1");
        assert_eq!(store.put_count(), 0);
        assert_eq!(store.text("a").as_deref(), Some("1"));
    }

    #[test]
    fn storage_config_validates_s3_fields() {
        let mut config = StorageConfig {
            backend: StorageBackendKind::S3,
            endpoint: "https://s3.example.com".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: "key".to_string(),
            secret_access_key: "secret".to_string(),
            bucket: "backups".to_string(),
            ..StorageConfig::default()
        };
        config.validate().expect("valid");

        config.endpoint = "ftp://nope".to_string();
        assert!(config.validate().is_err());

        config.endpoint = "https://s3.example.com".to_string();
        config.bucket.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn storage_config_validates_file_backend() {
        let config = StorageConfig {
            backend: StorageBackendKind::File,
            root: "/tmp/objects".to_string(),
            ..StorageConfig::default()
        };
        config.validate().expect("valid");

        let empty = StorageConfig {
            backend: StorageBackendKind::File,
            ..StorageConfig::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn storage_config_rejects_non_positive_retention() {
        let config = StorageConfig {
            backend: StorageBackendKind::File,
            root: "objects".to_string(),
            retention: Some(0),
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn storage_config_parses_camel_case_yaml() {
        let config: StorageConfig = serde_yaml::from_str(
            "backend: s3\nendpoint: https://s3.example.com\nregion: eu-west-1\naccessKeyId: id\nsecretAccessKey: secret\nbucket: backups\nforcePathStyle: true\npayloadSignatureMode: streaming\nretention: 30\nretentionMinimum: 2\n",
        )
        .expect("parse");

        assert_eq!(config.payload_signature_mode, PayloadSignatureMode::Streaming);
        assert!(config.force_path_style);
        assert_eq!(config.retention, Some(30));
        assert_eq!(config.retention_minimum, 2);
        assert!(!config.always_calculate_content_md5);
    }

    #[test]
    fn build_object_store_rejects_s3() {
        let config = StorageConfig {
            backend: StorageBackendKind::S3,
            endpoint: "https://s3.example.com".to_string(),
            region: "r".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
            bucket: "b".to_string(),
            ..StorageConfig::default()
        };
        assert!(build_object_store(&config).is_err());
    }

    #[test]
    fn build_object_store_returns_file_store() {
        let td = tempdir().expect("tempdir");
        let config = StorageConfig {
            backend: StorageBackendKind::File,
            root: td.path().to_string_lossy().into_owned(),
            ..StorageConfig::default()
        };
        let store = build_object_store(&config).expect("build");
        store.upload_text("probe", "ok").expect("upload");
        assert_eq!(store.get_text_if_exists("probe").expect("get").as_deref(), Some("ok"));
    }
}
