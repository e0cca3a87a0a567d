use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Directory name of the cache under the per-app data folder.
pub const CACHE_DIR_NAME: &str = "self-extraction";
const SCRATCH_PREFIX: &str = "tmpuntar-";

/// On-disk representations stored under a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// `{hash}.tar`: input and output of patching.
    Tar,
    /// `{hash}.tar.zst`: the full-download transfer form.
    TarZst,
    /// `{hash}.patch`: transform from the archive at `hash` to its successor.
    Patch,
    /// `from-{hash}.tar`: patch output before its identity is known.
    Patched,
}

impl ArtifactKind {
    fn file_name(self, hash: &str) -> String {
        match self {
            ArtifactKind::Tar => format!("{hash}.tar"),
            ArtifactKind::TarZst => format!("{hash}.tar.zst"),
            ArtifactKind::Patch => format!("{hash}.patch"),
            ArtifactKind::Patched => format!("from-{hash}.tar"),
        }
    }
}

/// Content-addressed cache of archives and patches for one application.
#[derive(Debug, Clone)]
pub struct ArchiveCache {
    root: PathBuf,
}

impl ArchiveCache {
    /// `{app_data}/{identifier}/{name}/self-extraction`.
    pub fn for_app(app_data: &Path, identifier: &str, name: &str) -> Self {
        Self::at(app_data.join(identifier).join(name).join(CACHE_DIR_NAME))
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create cache dir: {}", self.root.display()))
    }

    pub fn path(&self, hash: &str, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.file_name(hash))
    }

    pub async fn exists(&self, hash: &str, kind: ArtifactKind) -> bool {
        tokio::fs::try_exists(self.path(hash, kind))
            .await
            .unwrap_or(false)
    }

    pub async fn put(&self, hash: &str, kind: ArtifactKind, bytes: &[u8]) -> Result<PathBuf> {
        self.ensure_root().await?;
        let path = self.path(hash, kind);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write cache file: {}", path.display()))?;
        Ok(path)
    }

    /// Move an existing file into the cache under `hash`, replacing whatever
    /// was stored there.
    pub async fn promote(&self, from: &Path, hash: &str, kind: ArtifactKind) -> Result<PathBuf> {
        let path = self.path(hash, kind);
        tokio::fs::rename(from, &path).await.with_context(|| {
            format!("Failed to move {} to {}", from.display(), path.display())
        })?;
        Ok(path)
    }

    /// Removing a missing entry is not an error.
    pub async fn delete(&self, hash: &str, kind: ArtifactKind) -> Result<()> {
        remove_file_if_exists(&self.path(hash, kind)).await
    }

    /// A cache path that is removed when the guard drops, unless kept.
    pub fn scoped(&self, hash: &str, kind: ArtifactKind) -> ScopedFile {
        ScopedFile::new(self.path(hash, kind))
    }

    /// Fresh scratch directory under the cache root, removed recursively when
    /// the handle drops on any exit path.
    pub async fn new_scratch_dir(&self) -> Result<Workspace> {
        self.ensure_root().await?;
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&self.root)
            .with_context(|| format!("Failed to create scratch dir in {}", self.root.display()))?;
        Ok(Workspace { dir })
    }

    /// Remove every cache entry except the named ones. Best effort: entries
    /// that cannot be removed (locked on Windows) are skipped.
    pub async fn prune_except(&self, keep: &[&str]) -> Result<usize> {
        let mut removed = 0;
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(anyhow::Error::from(e))
                    .with_context(|| format!("Failed to list {}", self.root.display()))
            }
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if keep.iter().any(|k| *k == name) {
                continue;
            }
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(t) if t.is_dir() => tokio::fs::remove_dir_all(&path).await,
                _ => tokio::fs::remove_file(&path).await,
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "could not prune cache entry"),
            }
        }
        Ok(removed)
    }
}

/// Scratch directory handle. Dropping it removes the tree.
#[derive(Debug)]
pub struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Path guard that deletes its file on drop unless [`ScopedFile::keep`] ran.
#[derive(Debug)]
pub struct ScopedFile {
    path: PathBuf,
    armed: bool,
}

impl ScopedFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ScopedFile {
    fn drop(&mut self) {
        if self.armed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to remove temporary file")
                }
            }
        }
    }
}

pub async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::from(e))
            .with_context(|| format!("Failed to delete file: {}", path.display())),
    }
}
