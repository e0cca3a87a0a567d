use anyhow::{anyhow, Context};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::cache::ArchiveCache;
use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};
use crate::installer::{InstallLayout, Installer};
use crate::manifest::{HttpFetcher, ManifestClient, RemoteUpdateManifest};
use crate::patch::{self, PatchApplier};
use crate::platform::{app_data_dir, Platform};
use crate::resolver::{short, PatchChainResolver, ResolvedVia};
use crate::shell::{DetachedLauncher, NativeShell, ProcessExit, Relauncher};
use crate::status::{StatusDetails, StatusReporter, UpdateStatus};
use crate::version_store::{LocalVersionRecord, VersionStore};

/// Check, download and apply updates for the running build.
///
/// Owns the result of the last check. `check_for_update` replaces it;
/// `download_update` only flips `update_ready` / `error` on the record it was
/// started for. Download and apply share one flight: a call made while either
/// is running is rejected with [`UpdateError::InProgress`] naming the running
/// one. Apply extracts from the cache that download prunes.
pub struct UpdateSession {
    store: VersionStore,
    client: ManifestClient,
    applier: Arc<dyn PatchApplier>,
    layout: InstallLayout,
    cache_root: Option<PathBuf>,
    relauncher: Arc<dyn Relauncher>,
    shell: Arc<dyn NativeShell>,
    status: StatusReporter,
    info: RwLock<Option<RemoteUpdateManifest>>,
    flight: Mutex<Option<&'static str>>,
}

/// Marks an operation as running until dropped.
struct Flight<'a> {
    slot: &'a Mutex<Option<&'static str>>,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl UpdateSession {
    pub fn new(
        store: VersionStore,
        client: ManifestClient,
        applier: Arc<dyn PatchApplier>,
        layout: InstallLayout,
    ) -> Self {
        let os = client.platform().os;
        Self {
            store,
            client,
            applier,
            layout,
            cache_root: None,
            relauncher: Arc::new(DetachedLauncher::new(os)),
            shell: Arc::new(ProcessExit),
            status: StatusReporter::default(),
            info: RwLock::new(None),
            flight: Mutex::new(None),
        }
    }

    /// Production wiring: HTTP transport, current platform, layout derived
    /// from the running executable unless overridden.
    pub fn from_config(config: &UpdaterConfig) -> anyhow::Result<Self> {
        let platform = Platform::current();
        let manifest_path = match &config.manifest_path {
            Some(p) => p.clone(),
            None => VersionStore::default_path()?,
        };
        let fetch = Arc::new(HttpFetcher::new(config)?);
        let client = ManifestClient::new(fetch, platform, config);
        let applier = patch::from_config(&config.patch_tool, platform)?;
        let layout = InstallLayout::detect(platform.os, config.install_path.clone())?;

        let mut session = Self::new(VersionStore::new(manifest_path), client, applier, layout);
        session.cache_root = config.cache_root.clone();
        Ok(session)
    }

    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    pub fn with_relauncher(mut self, relauncher: Arc<dyn Relauncher>) -> Self {
        self.relauncher = relauncher;
        self
    }

    pub fn with_shell(mut self, shell: Arc<dyn NativeShell>) -> Self {
        self.shell = shell;
        self
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub async fn local_version(&self) -> Result<&LocalVersionRecord> {
        self.store.load().await
    }

    /// Result of the last check, with download state folded in.
    pub fn update_info(&self) -> Option<RemoteUpdateManifest> {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cache(&self, local: &LocalVersionRecord) -> Result<ArchiveCache> {
        if let Some(root) = &self.cache_root {
            return Ok(ArchiveCache::at(root));
        }
        let data = app_data_dir().ok_or_else(|| anyhow!("No per-user data directory on this system"))?;
        Ok(ArchiveCache::for_app(&data, &local.identifier, &local.name))
    }

    fn installer(&self, local: &LocalVersionRecord) -> Result<Installer> {
        Ok(Installer::new(self.cache(local)?, self.layout.clone(), local))
    }

    fn fail(&self, err: UpdateError) -> UpdateError {
        self.status.emit(
            UpdateStatus::Error,
            err.to_string(),
            StatusDetails::error(err.to_string()),
        );
        err
    }

    /// Ask the host for the latest build. Network problems are reported in
    /// the returned record's `error`; only an unreadable local identity is an
    /// `Err`.
    pub async fn check_for_update(&self) -> Result<RemoteUpdateManifest> {
        let local = self.store.load().await?;
        self.status.emit(
            UpdateStatus::Checking,
            "Checking for updates...",
            StatusDetails::hash(&local.hash),
        );

        let manifest = self.client.fetch_remote_manifest(local).await;
        if !manifest.error.is_empty() {
            self.status.emit(
                UpdateStatus::Error,
                manifest.error.clone(),
                StatusDetails::error(manifest.error.clone()),
            );
        } else if manifest.update_available {
            self.status.emit(
                UpdateStatus::UpdateAvailable,
                format!("Update available: {}", short(&manifest.hash)),
                StatusDetails::hashes(&local.hash, &manifest.hash),
            );
        } else {
            self.status.emit(
                UpdateStatus::NoUpdate,
                "Already on the latest version",
                StatusDetails::hash(&local.hash),
            );
        }

        *self.info.write().unwrap_or_else(PoisonError::into_inner) = Some(manifest.clone());
        Ok(manifest)
    }

    fn begin(&self, op: &'static str) -> Result<Flight<'_>> {
        let mut slot = self.flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = *slot {
            return Err(UpdateError::InProgress(running));
        }
        *slot = Some(op);
        Ok(Flight { slot: &self.flight })
    }

    /// Materialize the checked target build in the cache and mark it ready.
    pub async fn download_update(&self) -> Result<()> {
        let _flight = self.begin("download")?;

        let info = self.update_info().ok_or(UpdateError::NotChecked)?;
        if !info.error.is_empty() || !info.update_available {
            return Err(UpdateError::NoUpdateAvailable);
        }
        if info.update_ready {
            return Ok(());
        }

        let local = self.store.load().await?;
        let installer = self.installer(local)?;
        let cache = self.cache(local)?;
        self.status.emit(
            UpdateStatus::DownloadStarting,
            format!("Starting update download to {}", short(&info.hash)),
            StatusDetails::hashes(&local.hash, &info.hash),
        );

        let resolver =
            PatchChainResolver::new(&cache, &self.client, self.applier.clone(), local, &self.status);
        let resolution = match resolver.resolve(&local.hash, &info.hash).await {
            Ok(r) => r,
            Err(e) => {
                self.record_download(&info.hash, Err(e.to_string()));
                return Err(e);
            }
        };
        match &resolution.via {
            ResolvedVia::Cache => tracing::info!(hash = %resolution.hash, "update already downloaded"),
            ResolvedVia::Patches { applied } => {
                tracing::info!(hash = %resolution.hash, applied, "update assembled from patches")
            }
            ResolvedVia::FullDownload { applied, reason } => {
                tracing::info!(hash = %resolution.hash, applied, reason = %reason, "update downloaded in full")
            }
        }

        let target_tar = format!("{}.tar", resolution.hash);
        let backup = installer.backup_file_name();
        let mut keep = vec![target_tar.as_str()];
        keep.extend(backup.as_deref());
        match cache.prune_except(&keep).await {
            Ok(removed) => tracing::debug!(removed, "pruned update cache"),
            Err(e) => tracing::warn!(error = %e, "failed to prune update cache"),
        }

        self.record_download(&info.hash, Ok(()));
        self.status.emit(
            UpdateStatus::DownloadComplete,
            "Download complete",
            StatusDetails {
                used_patch_path: Some(resolution.used_patches()),
                ..StatusDetails::hash(&resolution.hash)
            },
        );
        Ok(())
    }

    /// A newer check may have replaced the record while we were downloading;
    /// only the record for `hash` is touched.
    fn record_download(&self, hash: &str, outcome: std::result::Result<(), String>) {
        let mut info = self.info.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(info) = info.as_mut().filter(|i| i.hash == hash) {
            match outcome {
                Ok(()) => {
                    info.update_ready = true;
                    info.error.clear();
                }
                Err(error) => {
                    info.update_ready = false;
                    info.error = error;
                }
            }
        }
    }

    /// Install the downloaded build, start it and ask the shell to exit.
    ///
    /// If the swap fails the previous build is left running and the error is
    /// returned. On success this returns once termination was requested.
    pub async fn apply_update(&self) -> Result<()> {
        let _flight = self.begin("apply")?;

        let info = self.update_info().ok_or(UpdateError::NotChecked)?;
        if !info.update_ready {
            return Err(UpdateError::NotReady);
        }
        let local = self.store.load().await?;
        let installer = self.installer(local)?;
        installer.recover().await.map_err(|e| self.fail(e))?;

        self.status.emit(
            UpdateStatus::Applying,
            "Applying update...",
            StatusDetails::hashes(&local.hash, &info.hash),
        );
        self.status.emit(
            UpdateStatus::Extracting,
            "Extracting update...",
            StatusDetails::hash(&info.hash),
        );
        let unit = installer.extract(&info.hash).await.map_err(|e| self.fail(e))?;

        self.status.emit(
            UpdateStatus::ReplacingApp,
            "Replacing application...",
            StatusDetails::hash(&info.hash),
        );
        let launch = installer.swap(unit).await.map_err(|e| self.fail(e))?;

        self.status.emit(
            UpdateStatus::LaunchingNewVersion,
            "Launching updated version...",
            StatusDetails::hash(&info.hash),
        );
        self.relauncher
            .relaunch(&launch, &[])
            .with_context(|| format!("Installed {} but could not start it", short(&info.hash)))
            .map_err(|e| self.fail(e.into()))?;

        self.status.emit(
            UpdateStatus::Complete,
            "Update complete",
            StatusDetails::hash(&info.hash),
        );
        self.shell.terminate();
        Ok(())
    }

    /// Put the previous build back if an earlier apply stopped between
    /// parking it and promoting its replacement. Call before anything else
    /// at startup.
    pub async fn recover_interrupted_install(&self) -> Result<bool> {
        let local = self.store.load().await?;
        self.installer(local)?.recover().await
    }
}
