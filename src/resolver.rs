use anyhow::Context;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::archive;
use crate::cache::{ArchiveCache, ArtifactKind};
use crate::error::{Result, UpdateError};
use crate::manifest::ManifestClient;
use crate::patch::PatchApplier;
use crate::status::{StatusDetails, StatusReporter, UpdateStatus};
use crate::version_store::LocalVersionRecord;

/// Progress events are emitted at most once per this many downloaded bytes.
const PROGRESS_EVERY: u64 = 512 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkState {
    Walking,
    FellBackToFullDownload,
    Resolved(String),
    Failed(String),
}

/// How the target archive ended up in the cache.
#[derive(Debug)]
pub enum ResolvedVia {
    /// Already cached before the walk started.
    Cache,
    Patches { applied: usize },
    /// Patching stopped for `reason`; the archive was downloaded whole.
    FullDownload { applied: usize, reason: UpdateError },
}

#[derive(Debug)]
pub struct Resolution {
    pub hash: String,
    pub tar: PathBuf,
    pub via: ResolvedVia,
}

impl Resolution {
    pub fn used_patches(&self) -> bool {
        matches!(self.via, ResolvedVia::Patches { .. })
    }
}

/// Walks published patches from a cached baseline toward a target archive,
/// falling back to a full download whenever the chain cannot be followed.
pub struct PatchChainResolver<'a> {
    cache: &'a ArchiveCache,
    client: &'a ManifestClient,
    applier: Arc<dyn PatchApplier>,
    local: &'a LocalVersionRecord,
    status: &'a StatusReporter,
}

impl<'a> PatchChainResolver<'a> {
    pub fn new(
        cache: &'a ArchiveCache,
        client: &'a ManifestClient,
        applier: Arc<dyn PatchApplier>,
        local: &'a LocalVersionRecord,
        status: &'a StatusReporter,
    ) -> Self {
        Self {
            cache,
            client,
            applier,
            local,
            status,
        }
    }

    /// Materialize `{target_hash}.tar` in the cache. Only a failure of the
    /// full download path is returned as an error.
    pub async fn resolve(&self, local_hash: &str, target_hash: &str) -> Result<Resolution> {
        self.cache.ensure_root().await?;

        if self.cache.exists(target_hash, ArtifactKind::Tar).await {
            if self.verify(target_hash).await.is_ok() {
                tracing::info!(hash = %target_hash, "target archive already cached");
                return Ok(self.resolution(target_hash, ResolvedVia::Cache));
            }
            tracing::warn!(hash = %target_hash, "cached target archive failed verification, discarding");
            self.cache.delete(target_hash, ArtifactKind::Tar).await?;
        }

        let mut visited: HashSet<String> = HashSet::from([local_hash.to_string()]);
        let mut current = local_hash.to_string();
        let mut applied = 0usize;
        let mut state = WalkState::Walking;
        let mut fallback_reason = None;

        while state == WalkState::Walking {
            // With nothing applied the target is the uncached baseline, so
            // stepping reports it missing and the walk falls back.
            if current == target_hash && applied > 0 {
                state = WalkState::Resolved(current.clone());
                break;
            }
            match self.step(&current, applied + 1, &visited).await {
                Ok(next) => {
                    applied += 1;
                    visited.insert(next.clone());
                    self.status.emit(
                        UpdateStatus::PatchApplied,
                        format!("Patched to {}, checking for more patches...", short(&next)),
                        StatusDetails {
                            patch_number: Some(applied),
                            ..StatusDetails::hashes(&next, target_hash)
                        },
                    );
                    current = next;
                }
                Err(reason) => {
                    tracing::warn!(hash = %current, reason = %reason, "patch walk stopped, falling back to full download");
                    fallback_reason = Some(reason);
                    state = WalkState::FellBackToFullDownload;
                }
            }
        }

        if let WalkState::Resolved(hash) = &state {
            self.status.emit(
                UpdateStatus::PatchChainComplete,
                format!("Patch chain complete! Applied {applied} patches"),
                StatusDetails {
                    patch_number: Some(applied),
                    used_patch_path: Some(true),
                    ..StatusDetails::hash(hash)
                },
            );
            return Ok(self.resolution(hash, ResolvedVia::Patches { applied }));
        }

        let reason = fallback_reason.unwrap_or(UpdateError::PatchUnavailable {
            hash: current.clone(),
        });
        match self.full_download(&current, target_hash).await {
            Ok(()) => {
                state = WalkState::Resolved(target_hash.to_string());
                tracing::debug!(state = ?state, "walk finished");
                Ok(self.resolution(target_hash, ResolvedVia::FullDownload { applied, reason }))
            }
            Err(e) => {
                state = WalkState::Failed(e.to_string());
                tracing::error!(state = ?state, "full download failed");
                self.status
                    .emit(UpdateStatus::Error, e.to_string(), StatusDetails::error(e.to_string()));
                Err(e)
            }
        }
    }

    fn resolution(&self, hash: &str, via: ResolvedVia) -> Resolution {
        Resolution {
            hash: hash.to_string(),
            tar: self.cache.path(hash, ArtifactKind::Tar),
            via,
        }
    }

    /// One hop: `{current}.tar` + `{current}.patch` -> `{next}.tar`.
    async fn step(&self, current: &str, patch_number: usize, visited: &HashSet<String>) -> Result<String> {
        if !self.cache.exists(current, ArtifactKind::Tar).await {
            self.status.emit(
                UpdateStatus::LocalTarMissing,
                format!("Local tar not found for {}, will download full bundle", short(current)),
                StatusDetails::hash(current),
            );
            return Err(UpdateError::BaselineMissing {
                hash: current.to_string(),
            });
        }
        self.status.emit(
            UpdateStatus::LocalTarFound,
            format!("Found local tar for {}", short(current)),
            StatusDetails::hash(current),
        );

        let url = self.client.patch_url(self.local, current);
        self.status.emit(
            UpdateStatus::FetchingPatch,
            format!("Checking for patch: {}", short(current)),
            StatusDetails {
                url: Some(url.clone()),
                ..StatusDetails::hash(current)
            },
        );

        // Both guards remove their files on every exit path from this step.
        let patch_file = self.cache.scoped(current, ArtifactKind::Patch);
        let patched = self.cache.scoped(current, ArtifactKind::Patched);

        if let Err(e) = self.client.download_to(&url, patch_file.path(), |_, _| {}).await {
            tracing::debug!(url = %url, error = %e, "patch download failed");
            self.status.emit(
                UpdateStatus::PatchNotFound,
                format!("No patch available for {}, will download full bundle", short(current)),
                StatusDetails::hash(current),
            );
            return Err(UpdateError::PatchUnavailable {
                hash: current.to_string(),
            });
        }

        self.status.emit(
            UpdateStatus::ApplyingPatch,
            format!("Applying patch {patch_number} for {}...", short(current)),
            StatusDetails {
                patch_number: Some(patch_number),
                ..StatusDetails::hash(current)
            },
        );
        let baseline = self.cache.path(current, ArtifactKind::Tar);
        if let Err(e) = self
            .applier
            .apply(&baseline, patch_file.path(), patched.path())
            .await
        {
            self.status.emit(
                UpdateStatus::PatchFailed,
                format!("Patch application failed: {e}"),
                StatusDetails {
                    error: Some(e.to_string()),
                    ..StatusDetails::hash(current)
                },
            );
            return Err(UpdateError::PatchApplyFailed {
                hash: current.to_string(),
                reason: e.to_string(),
            });
        }

        let next = embedded_hash(patched.path().to_path_buf())
            .await
            .ok()
            .flatten()
            .ok_or_else(|| UpdateError::PatchApplyFailed {
                hash: current.to_string(),
                reason: "patched archive carries no readable version manifest".into(),
            })?;

        if visited.contains(&next) {
            self.status.emit(
                UpdateStatus::CycleDetected,
                "Cyclical update detected, falling back to full download",
                StatusDetails::hash(&next),
            );
            return Err(UpdateError::CycleDetected { hash: next });
        }

        let promoted = self.cache.promote(patched.path(), &next, ArtifactKind::Tar).await?;
        let _ = patched.keep();
        self.cache.delete(current, ArtifactKind::Tar).await?;
        drop(patch_file);

        tracing::debug!(from = %current, to = %next, tar = %promoted.display(), "applied patch");
        Ok(next)
    }

    /// Stream `{target}.tar.zst` from the host, decompress it to
    /// `{target}.tar` and check it really is the target build.
    async fn full_download(&self, current: &str, target: &str) -> Result<()> {
        let url = self.client.tarball_url(self.local);
        self.status.emit(
            UpdateStatus::DownloadingFullBundle,
            "Downloading full update bundle...",
            StatusDetails {
                url: Some(url.clone()),
                used_patch_path: Some(false),
                ..StatusDetails::hashes(current, target)
            },
        );

        let compressed = self.cache.scoped(target, ArtifactKind::TarZst);
        let mut next_report = 0u64;
        let bytes = self
            .client
            .download_to(&url, compressed.path(), |done, total| {
                if done >= next_report {
                    next_report = done + PROGRESS_EVERY;
                    self.status.emit(
                        UpdateStatus::DownloadProgress,
                        format!("Downloading: {:.1} MB", done as f64 / 1024.0 / 1024.0),
                        StatusDetails {
                            bytes_downloaded: Some(done),
                            total_bytes: total,
                            progress: total
                                .filter(|t| *t > 0)
                                .map(|t| ((done * 100) / t).min(100) as u8),
                            ..StatusDetails::default()
                        },
                    );
                }
            })
            .await?;
        tracing::info!(url = %url, bytes, "downloaded full bundle");

        self.status.emit(
            UpdateStatus::Decompressing,
            "Decompressing update bundle...",
            StatusDetails::hash(target),
        );
        let tar = self.cache.scoped(target, ArtifactKind::Tar);
        let (src, dest) = (compressed.path().to_path_buf(), tar.path().to_path_buf());
        tokio::task::spawn_blocking(move || archive::decompress_zstd(&src, &dest))
            .await
            .context("Decompression task panicked")?
            .map_err(|e| UpdateError::DownloadCorrupt {
                hash: target.to_string(),
                reason: format!("{e:#}"),
            })?;
        drop(compressed);

        self.verify(target).await?;
        let _ = tar.keep();
        Ok(())
    }

    async fn verify(&self, hash: &str) -> Result<()> {
        let path = self.cache.path(hash, ArtifactKind::Tar);
        match embedded_hash(path).await {
            Ok(Some(found)) if found == hash => Ok(()),
            Ok(Some(found)) => Err(UpdateError::DownloadCorrupt {
                hash: hash.to_string(),
                reason: format!("archive identifies itself as {found}"),
            }),
            Ok(None) => Err(UpdateError::DownloadCorrupt {
                hash: hash.to_string(),
                reason: "archive carries no version manifest".into(),
            }),
            Err(e) => Err(UpdateError::DownloadCorrupt {
                hash: hash.to_string(),
                reason: format!("{e:#}"),
            }),
        }
    }
}

async fn embedded_hash(tar: PathBuf) -> anyhow::Result<Option<String>> {
    tokio::task::spawn_blocking(move || archive::read_embedded_hash(&tar))
        .await
        .context("Manifest scan task panicked")?
}

pub(crate) fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
