use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;

use crate::error::{Result, UpdateError};

/// Identity of the build that is currently running, read from the
/// `version.json` shipped inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalVersionRecord {
    pub version: String,
    pub hash: String,
    pub channel: String,
    #[serde(alias = "baseUrl")]
    pub bucket_url: String,
    pub name: String,
    pub identifier: String,
}

impl LocalVersionRecord {
    pub fn is_dev(&self) -> bool {
        self.channel == "dev"
    }
}

/// Reads the local manifest once and hands out the cached record afterwards.
pub struct VersionStore {
    path: PathBuf,
    record: OnceCell<LocalVersionRecord>,
}

impl VersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            record: OnceCell::new(),
        }
    }

    /// Store pre-seeded with a known record; nothing is read from disk.
    pub fn with_record(record: LocalVersionRecord) -> Self {
        Self {
            path: PathBuf::new(),
            record: OnceCell::new_with(Some(record)),
        }
    }

    /// Default location: `../Resources/version.json` relative to the
    /// directory holding the running executable.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let exe = std::env::current_exe().context("Failed to locate running executable")?;
        let exe_dir = exe
            .parent()
            .context("Running executable has no parent directory")?;
        Ok(exe_dir.join("..").join("Resources").join("version.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<&LocalVersionRecord> {
        self.record
            .get_or_try_init(|| async {
                read_record(&self.path)
                    .await
                    .map_err(|source| UpdateError::IdentityUnavailable {
                        path: self.path.clone(),
                        source,
                    })
            })
            .await
    }
}

async fn read_record(path: &Path) -> anyhow::Result<LocalVersionRecord> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read local manifest: {}", path.display()))?;
    let record: LocalVersionRecord = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse local manifest: {}", path.display()))?;
    if record.hash.is_empty() {
        anyhow::bail!("Local manifest has an empty hash: {}", path.display());
    }
    tracing::debug!(version = %record.version, hash = %record.hash, channel = %record.channel, "loaded local build identity");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "version": "1.2.0",
        "hash": "abc",
        "channel": "canary",
        "bucketUrl": "https://cdn.example.com/myapp",
        "name": "MyApp-canary",
        "identifier": "com.example.myapp"
    }"#;

    #[tokio::test]
    async fn test_load_reads_once_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version.json");
        std::fs::write(&path, MANIFEST).unwrap();

        let store = VersionStore::new(&path);
        let first = store.load().await.unwrap().clone();
        assert_eq!(first.hash, "abc");
        assert_eq!(first.bucket_url, "https://cdn.example.com/myapp");

        // The record never changes for the process lifetime, even if the file does.
        std::fs::remove_file(&path).unwrap();
        let second = store.load().await.unwrap();
        assert_eq!(&first, second);
    }

    #[tokio::test]
    async fn test_accepts_base_url_alias() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version.json");
        std::fs::write(&path, MANIFEST.replace("bucketUrl", "baseUrl")).unwrap();

        let record = VersionStore::new(&path).load().await.unwrap().clone();
        assert_eq!(record.bucket_url, "https://cdn.example.com/myapp");
    }

    #[tokio::test]
    async fn test_missing_manifest_is_identity_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::new(dir.path().join("nope.json"));
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, UpdateError::IdentityUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_identity_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = VersionStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, UpdateError::IdentityUnavailable { .. }));
    }
}
