use anyhow::{bail, Context};
use rayon::prelude::*;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::archive;
use crate::cache::{ArchiveCache, ArtifactKind, Workspace};
use crate::error::{Result, UpdateError};
use crate::platform::{sanitize_app_name, windows_bundle_dir_name, Os};
use crate::version_store::LocalVersionRecord;

const LAUNCHER_SCRIPT: &str = "launcher.cmd";
const VERSIONED_PREFIX: &str = "app-";

/// Where the running build lives and how it gets replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallLayout {
    /// macOS `.app` bundle, replaced in place.
    MacBundle { running: PathBuf },
    /// Linux single-file AppImage, replaced in place.
    AppImage { running: PathBuf },
    /// Windows: each build gets its own `app-{hash}` directory under `root`
    /// and a launcher script in `root` points at the active one. A running
    /// binary cannot be renamed there, so the script is what gets swapped.
    Versioned { root: PathBuf },
}

impl InstallLayout {
    /// Layout for the running process on `os`. `install_path` overrides the
    /// location derived from the executable.
    pub fn detect(os: Os, install_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate running executable")?;
        Ok(match os {
            Os::Macos => InstallLayout::MacBundle {
                // Contents/MacOS/<exe> -> <bundle>.app
                running: match install_path {
                    Some(p) => p,
                    None => exe
                        .ancestors()
                        .nth(3)
                        .context("Executable is not inside an app bundle")?
                        .to_path_buf(),
                },
            },
            Os::Linux => InstallLayout::AppImage {
                running: install_path
                    .or_else(|| std::env::var_os("APPIMAGE").map(PathBuf::from))
                    .unwrap_or(exe),
            },
            Os::Win => InstallLayout::Versioned {
                // <root>/app-<hash>/bin/launcher.exe -> <root>
                root: match install_path {
                    Some(p) => p,
                    None => exe
                        .ancestors()
                        .nth(3)
                        .context("Executable is not inside a versioned install")?
                        .to_path_buf(),
                },
            },
        })
    }
}

/// The extracted, ready-to-promote root of a new build. Owns the scratch
/// workspace it was unpacked into, which is removed when this drops.
#[derive(Debug)]
pub struct InstallableUnit {
    pub hash: String,
    pub path: PathBuf,
    _workspace: Workspace,
}

pub struct Installer {
    cache: ArchiveCache,
    layout: InstallLayout,
    app_name: String,
}

impl Installer {
    pub fn new(cache: ArchiveCache, layout: InstallLayout, local: &LocalVersionRecord) -> Self {
        Self {
            cache,
            layout,
            app_name: local.name.clone(),
        }
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    /// Where the previous build is parked during a swap.
    pub fn backup_path(&self) -> PathBuf {
        match &self.layout {
            InstallLayout::MacBundle { .. } => self.cache.root().join("backup.app"),
            InstallLayout::AppImage { .. } => self.cache.root().join("backup.AppImage"),
            InstallLayout::Versioned { root } => root.join(format!("{LAUNCHER_SCRIPT}.bak")),
        }
    }

    /// The path swapped by the backup-then-promote protocol.
    pub fn running_path(&self) -> PathBuf {
        match &self.layout {
            InstallLayout::MacBundle { running } | InstallLayout::AppImage { running } => {
                running.clone()
            }
            InstallLayout::Versioned { root } => root.join(LAUNCHER_SCRIPT),
        }
    }

    /// Unpack `{hash}.tar` into a scratch workspace and locate the unit to
    /// install inside it.
    pub async fn extract(&self, hash: &str) -> Result<InstallableUnit> {
        let tar = self.cache.path(hash, ArtifactKind::Tar);
        let workspace = self.cache.new_scratch_dir().await?;
        let root = workspace.path().to_path_buf();

        let entries = tokio::task::spawn_blocking(move || archive::extract(&tar, &root))
            .await
            .context("Extraction task panicked")?
            .map_err(|e| UpdateError::DownloadCorrupt {
                hash: hash.to_string(),
                reason: format!("{e:#}"),
            })?;

        let rel = self
            .locate_unit(&entries, workspace.path())
            .ok_or_else(|| UpdateError::NoInstallableUnitFound {
                hash: hash.to_string(),
            })?;
        let path = workspace.path().join(&rel);
        tracing::debug!(hash = %hash, unit = %path.display(), "extracted installable unit");

        Ok(InstallableUnit {
            hash: hash.to_string(),
            path,
            _workspace: workspace,
        })
    }

    fn locate_unit(&self, entries: &[String], root: &Path) -> Option<PathBuf> {
        let fixed = match &self.layout {
            InstallLayout::MacBundle { .. } => {
                return entries.iter().find_map(|e| bundle_root(e, ".app"));
            }
            InstallLayout::AppImage { .. } => {
                PathBuf::from(format!("{}.AppImage", sanitize_app_name(&self.app_name)))
            }
            InstallLayout::Versioned { .. } => PathBuf::from(windows_bundle_dir_name(&self.app_name)),
        };
        root.join(&fixed).exists().then_some(fixed)
    }

    /// Replace the running build with `unit`.
    ///
    /// Backup-then-promote: drop any stale backup, park the running build at
    /// the backup path, move the new build into place. If promotion fails the
    /// backup is moved back. The backup is never deleted here.
    ///
    /// Returns the path to launch.
    pub async fn swap(&self, unit: InstallableUnit) -> Result<PathBuf> {
        let layout = self.layout.clone();
        let backup = self.backup_path();
        let running = self.running_path();
        let unit_path = unit.path.clone();
        let hash = unit.hash.clone();

        let launch = tokio::task::spawn_blocking(move || -> anyhow::Result<PathBuf> {
            match &layout {
                InstallLayout::MacBundle { .. } | InstallLayout::AppImage { .. } => {
                    swap_in_place(&unit_path, &running, &backup)?;
                    post_install(&layout, &running);
                    Ok(running)
                }
                InstallLayout::Versioned { root } => {
                    swap_versioned(root, &unit_path, &hash, &running, &backup)
                }
            }
        })
        .await
        .context("Swap task panicked")?
        .map_err(UpdateError::SwapFailed)?;

        // Workspace goes away only after the unit has been moved out of it.
        drop(unit);
        tracing::info!(launch = %launch.display(), "new build installed");
        Ok(launch)
    }

    /// Undo a swap interrupted between parking the old build and promoting the
    /// new one. Returns whether anything was restored.
    pub async fn recover(&self) -> Result<bool> {
        let running = self.running_path();
        let backup = self.backup_path();
        tokio::task::spawn_blocking(move || restore_orphaned_backup(&running, &backup))
        .await
        .context("Recovery task panicked")?
        .map_err(UpdateError::SwapFailed)
    }

    /// Cache file names that must survive pruning.
    pub fn backup_file_name(&self) -> Option<String> {
        match &self.layout {
            InstallLayout::Versioned { .. } => None,
            _ => self
                .backup_path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
        }
    }
}

/// `MyApp.app/Contents/Info.plist` -> `MyApp.app`.
fn bundle_root(entry: &str, suffix: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(entry).components() {
        match component {
            Component::CurDir => continue,
            Component::Normal(name) => {
                out.push(name);
                if name.to_string_lossy().ends_with(suffix) {
                    return Some(out);
                }
            }
            _ => return None,
        }
    }
    None
}

/// Move `backup` back to `running` when an earlier swap left only the backup.
fn restore_orphaned_backup(running: &Path, backup: &Path) -> anyhow::Result<bool> {
    if path_exists(running) || !path_exists(backup) {
        return Ok(false);
    }
    move_path(backup, running).context("Failed to restore previous build from backup")?;
    tracing::warn!(path = %running.display(), "restored previous build from backup");
    Ok(true)
}

fn path_exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

fn swap_in_place(unit: &Path, running: &Path, backup: &Path) -> anyhow::Result<()> {
    // 1. Stale backup from an earlier run. If the running build is gone the
    // backup is the only copy left, so it goes back into place first.
    restore_orphaned_backup(running, backup)?;
    remove_path(backup)?;

    // 2. Park the running build. Failing here changes nothing.
    if path_exists(running) {
        move_path(running, backup).context("Failed to back up running build")?;
    }

    // 3. Promote.
    if let Err(e) = move_path(unit, running) {
        if path_exists(backup) {
            if let Err(restore) = move_path(backup, running) {
                return Err(e.context(format!(
                    "restoring backup also failed ({restore:#}); previous build kept at {}",
                    backup.display()
                )));
            }
        }
        return Err(e.context("Failed to promote new build"));
    }
    Ok(())
}

fn swap_versioned(
    root: &Path,
    unit: &Path,
    hash: &str,
    launcher: &Path,
    backup: &Path,
) -> anyhow::Result<PathBuf> {
    let target = root.join(format!("{VERSIONED_PREFIX}{hash}"));
    // A launcher lost mid-swap is restored first so the build it points at
    // counts as active.
    restore_orphaned_backup(launcher, backup)?;
    let active = active_versioned_dir(launcher);

    // 1. Stale backup and builds that are neither active nor the new one.
    remove_path(backup)?;
    prune_versioned(root, &[Some(target.as_path()), active.as_deref()]);

    // The new build gets a directory of its own; nothing running is touched.
    remove_path(&target)?;
    move_path(unit, &target)?;

    // 2. Park the current launcher script.
    if launcher.exists() {
        std::fs::rename(launcher, backup)
            .with_context(|| format!("Failed to back up {}", launcher.display()))?;
    }

    // 3. Point a fresh launcher at the new build.
    if let Err(e) = write_launcher(launcher, &target) {
        if backup.exists() {
            std::fs::rename(backup, launcher).with_context(|| {
                format!("{e:#}; restoring {} also failed", launcher.display())
            })?;
        }
        return Err(e);
    }
    Ok(launcher.to_path_buf())
}

fn launcher_script(build_dir: &Path) -> String {
    let exe = build_dir.join("bin").join("launcher.exe");
    format!("@echo off\r\nstart \"\" \"{}\" %*\r\n", exe.display())
}

fn write_launcher(launcher: &Path, build_dir: &Path) -> anyhow::Result<()> {
    let tmp = launcher.with_extension("cmd.tmp");
    std::fs::write(&tmp, launcher_script(build_dir))
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, launcher)
        .with_context(|| format!("Failed to install {}", launcher.display()))
}

/// The `app-*` directory the current launcher script points at.
fn active_versioned_dir(launcher: &Path) -> Option<PathBuf> {
    let script = std::fs::read_to_string(launcher).ok()?;
    let start = script.find('"')?;
    let rest = &script[start + 1..];
    let rest = &rest[rest.find('"')? + 1..];
    let rest = &rest[rest.find('"')? + 1..];
    let exe = &rest[..rest.find('"')?];
    // <root>/app-<hash>/bin/launcher.exe
    Path::new(exe).ancestors().nth(2).map(Path::to_path_buf)
}

/// Best effort: a build still running holds its files open on Windows.
fn prune_versioned(root: &Path, keep: &[Option<&Path>]) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_build = entry
            .file_name()
            .to_string_lossy()
            .starts_with(VERSIONED_PREFIX);
        if !is_build || !path.is_dir() || keep.iter().flatten().any(|k| *k == path) {
            continue;
        }
        if let Err(e) = std::fs::remove_dir_all(&path) {
            tracing::debug!(path = %path.display(), error = %e, "could not remove old build");
        }
    }
}

fn post_install(layout: &InstallLayout, installed: &Path) {
    match layout {
        InstallLayout::MacBundle { .. } => {
            // Extraction from a downloaded archive marks the bundle quarantined;
            // the bundle is already signed.
            if cfg!(target_os = "macos") {
                match std::process::Command::new("xattr")
                    .args(["-r", "-d", "com.apple.quarantine"])
                    .arg(installed)
                    .status()
                {
                    Ok(status) if status.success() => {}
                    // Also non-zero when the attribute was never set.
                    Ok(status) => {
                        tracing::debug!(path = %installed.display(), %status, "xattr did not clear quarantine attribute");
                    }
                    Err(e) => {
                        tracing::warn!(path = %installed.display(), error = %e, "could not run xattr");
                    }
                }
            }
        }
        InstallLayout::AppImage { .. } => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) =
                    std::fs::set_permissions(installed, std::fs::Permissions::from_mode(0o755))
                {
                    tracing::warn!(path = %installed.display(), error = %e, "could not mark AppImage executable");
                }
            }
        }
        InstallLayout::Versioned { .. } => {}
    }
}

fn remove_path(path: &Path) -> anyhow::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to stat {}", path.display()));
        }
    };
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
    .with_context(|| format!("Failed to remove {}", path.display()))
}

/// Rename, or copy-and-verify then delete when the rename crosses
/// filesystems. `src` is only removed once `dst` is a verified copy.
pub fn move_path(src: &Path, dst: &Path) -> anyhow::Result<()> {
    std::fs::symlink_metadata(src)
        .with_context(|| format!("Nothing to move at {}", src.display()))?;
    match std::fs::rename(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) if crosses_devices(&e) => {
            tracing::debug!(src = %src.display(), dst = %dst.display(), error = %e, "rename crosses filesystems, copying instead");
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Failed to move {} to {}", src.display(), dst.display())
            });
        }
    }

    if let Err(e) = copy_and_verify(src, dst) {
        let _ = remove_path(dst);
        return Err(e);
    }
    remove_path(src)
}

fn crosses_devices(e: &std::io::Error) -> bool {
    // EXDEV on unix, ERROR_NOT_SAME_DEVICE on Windows.
    const EXDEV: i32 = if cfg!(windows) { 17 } else { 18 };
    e.raw_os_error() == Some(EXDEV)
}

fn copy_and_verify(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let mut files: Vec<(PathBuf, PathBuf)> = Vec::new();

    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("Failed to read directory entry in {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| "Failed to compute relative path")?;
        let target = if rel.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(rel)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
            files.push((entry.path().to_path_buf(), target));
        }
    }

    files.par_iter().try_for_each(|(from, to)| -> anyhow::Result<()> {
        if hash_file_streaming(from)? != hash_file_streaming(to)? {
            bail!("Copy verification failed for {}", to.display());
        }
        Ok(())
    })
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let link = std::fs::read_link(src)
        .with_context(|| format!("Failed to read link {}", src.display()))?;
    std::os::unix::fs::symlink(&link, dst)
        .with_context(|| format!("Failed to create link {}", dst.display()))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> anyhow::Result<()> {
    std::fs::copy(src, dst)
        .map(|_| ())
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))
}

/// Stream-hash a file using BLAKE3 with a 256 KB reader.
fn hash_file_streaming(path: &Path) -> anyhow::Result<blake3::Hash> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("Failed to hash file: {}", path.display()))?;
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bundle_tar, payload, record};

    async fn installer(dir: &Path, layout: InstallLayout, tar: &[u8]) -> Installer {
        let cache = ArchiveCache::at(dir.join("cache"));
        cache.put("h2", ArtifactKind::Tar, tar).await.unwrap();
        Installer::new(cache, layout, &record("canary", "h1"))
    }

    fn mac_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let files: [(&str, &[u8]); 2] = [
            ("./MyApp.app/Contents/MacOS/launcher", b"mac binary"),
            ("./MyApp.app/Contents/Resources/version.json", br#"{"hash":"h2"}"#),
        ];
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_bundle_root() {
        assert_eq!(
            bundle_root("MyApp.app/Contents/Info.plist", ".app"),
            Some(PathBuf::from("MyApp.app"))
        );
        assert_eq!(
            bundle_root("./MyApp.app/", ".app"),
            Some(PathBuf::from("MyApp.app"))
        );
        assert_eq!(bundle_root("MyApp/bin/launcher", ".app"), None);
    }

    #[tokio::test]
    async fn test_extract_appimage() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::AppImage {
            running: dir.path().join("MyApp.AppImage"),
        };
        let installer = installer(dir.path(), layout, &bundle_tar("h2", &payload(2))).await;

        let unit = installer.extract("h2").await.unwrap();
        assert!(unit.path.ends_with("MyApp.AppImage"));
        assert_eq!(std::fs::read(&unit.path).unwrap(), payload(2));

        let scratch = unit.path.parent().unwrap().to_path_buf();
        drop(unit);
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_extract_mac_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::MacBundle {
            running: dir.path().join("MyApp.app"),
        };
        let installer = installer(dir.path(), layout, &mac_tar()).await;

        let unit = installer.extract("h2").await.unwrap();
        assert!(unit.path.ends_with("MyApp.app"));
        assert!(unit.path.join("Contents/MacOS/launcher").is_file());
    }

    #[tokio::test]
    async fn test_extract_without_unit() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::MacBundle {
            running: dir.path().join("MyApp.app"),
        };
        let installer = installer(dir.path(), layout, &bundle_tar("h2", b"x")).await;

        let err = installer.extract("h2").await.unwrap_err();
        assert!(matches!(err, UpdateError::NoInstallableUnitFound { .. }));
    }

    #[tokio::test]
    async fn test_swap_appimage() {
        let dir = tempfile::tempdir().unwrap();
        let running = dir.path().join("MyApp.AppImage");
        std::fs::write(&running, b"old build").unwrap();
        let layout = InstallLayout::AppImage {
            running: running.clone(),
        };
        let installer = installer(dir.path(), layout, &bundle_tar("h2", &payload(2))).await;
        // Left over from an earlier update.
        std::fs::write(installer.backup_path(), b"ancient").unwrap();

        let unit = installer.extract("h2").await.unwrap();
        let launch = installer.swap(unit).await.unwrap();

        assert_eq!(launch, running);
        assert_eq!(std::fs::read(&running).unwrap(), payload(2));
        assert_eq!(std::fs::read(installer.backup_path()).unwrap(), b"old build");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&running).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn test_swap_failure_restores_backup() {
        let dir = tempfile::tempdir().unwrap();
        let running = dir.path().join("MyApp.AppImage");
        std::fs::write(&running, b"old build").unwrap();
        let layout = InstallLayout::AppImage {
            running: running.clone(),
        };
        let installer = installer(dir.path(), layout, &bundle_tar("h2", b"x")).await;

        let workspace = installer.cache.new_scratch_dir().await.unwrap();
        let unit = InstallableUnit {
            hash: "h2".into(),
            path: workspace.path().join("vanished.AppImage"),
            _workspace: workspace,
        };

        let err = installer.swap(unit).await.unwrap_err();
        assert!(matches!(err, UpdateError::SwapFailed(_)));
        assert_eq!(std::fs::read(&running).unwrap(), b"old build");
        assert!(!installer.backup_path().exists());
    }

    #[tokio::test]
    async fn test_swap_after_interrupted_swap_keeps_previous_build() {
        let dir = tempfile::tempdir().unwrap();
        let running = dir.path().join("MyApp.AppImage");
        let layout = InstallLayout::AppImage {
            running: running.clone(),
        };
        let installer = installer(dir.path(), layout, &bundle_tar("h2", b"x")).await;
        // An earlier swap parked the old build and died before promoting.
        std::fs::write(installer.backup_path(), b"old build").unwrap();

        let workspace = installer.cache.new_scratch_dir().await.unwrap();
        let unit = InstallableUnit {
            hash: "h2".into(),
            path: workspace.path().join("vanished.AppImage"),
            _workspace: workspace,
        };

        let err = installer.swap(unit).await.unwrap_err();
        assert!(matches!(err, UpdateError::SwapFailed(_)));
        assert_eq!(std::fs::read(&running).unwrap(), b"old build");
    }

    #[tokio::test]
    async fn test_swap_promotes_over_orphaned_backup() {
        let dir = tempfile::tempdir().unwrap();
        let running = dir.path().join("MyApp.AppImage");
        let layout = InstallLayout::AppImage {
            running: running.clone(),
        };
        let installer = installer(dir.path(), layout, &bundle_tar("h2", &payload(2))).await;
        std::fs::write(installer.backup_path(), b"old build").unwrap();

        let unit = installer.extract("h2").await.unwrap();
        installer.swap(unit).await.unwrap();

        assert_eq!(std::fs::read(&running).unwrap(), payload(2));
        assert_eq!(std::fs::read(installer.backup_path()).unwrap(), b"old build");
    }

    #[tokio::test]
    async fn test_swap_versioned_restores_lost_launcher() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("install");
        let active = root.join("app-h1");
        std::fs::create_dir_all(active.join("bin")).unwrap();

        let layout = InstallLayout::Versioned { root: root.clone() };
        let installer = installer(dir.path(), layout, &bundle_tar("h2", &payload(2))).await;
        // Only the parked launcher survived an interrupted swap.
        std::fs::write(installer.backup_path(), launcher_script(&active)).unwrap();

        let unit = installer.extract("h2").await.unwrap();
        let launch = installer.swap(unit).await.unwrap();

        assert_eq!(active_versioned_dir(&launch), Some(root.join("app-h2")));
        assert_eq!(
            active_versioned_dir(&installer.backup_path()),
            Some(active.clone())
        );
        assert!(active.exists());
    }

    #[tokio::test]
    async fn test_recover_interrupted_swap() {
        let dir = tempfile::tempdir().unwrap();
        let running = dir.path().join("MyApp.AppImage");
        let layout = InstallLayout::AppImage {
            running: running.clone(),
        };
        let installer = installer(dir.path(), layout, &bundle_tar("h2", b"x")).await;
        std::fs::write(installer.backup_path(), b"old build").unwrap();

        assert!(installer.recover().await.unwrap());
        assert_eq!(std::fs::read(&running).unwrap(), b"old build");
        assert!(!installer.recover().await.unwrap());
    }

    #[tokio::test]
    async fn test_swap_versioned() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("install");
        let active = root.join("app-h1");
        let stale = root.join("app-h0");
        std::fs::create_dir_all(active.join("bin")).unwrap();
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(root.join(LAUNCHER_SCRIPT), launcher_script(&active)).unwrap();

        let layout = InstallLayout::Versioned { root: root.clone() };
        let installer = installer(dir.path(), layout, &bundle_tar("h2", &payload(2))).await;

        let unit = installer.extract("h2").await.unwrap();
        let launch = installer.swap(unit).await.unwrap();

        let target = root.join("app-h2");
        assert_eq!(launch, root.join(LAUNCHER_SCRIPT));
        assert_eq!(std::fs::read(target.join("bin/launcher")).unwrap(), payload(2));
        assert_eq!(active_versioned_dir(&launch), Some(target));
        assert_eq!(
            active_versioned_dir(&installer.backup_path()),
            Some(active.clone())
        );
        assert!(active.exists());
        assert!(!stale.exists());
    }

    #[test]
    fn test_copy_and_verify_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("a/b")).unwrap();
        std::fs::write(src.join("top"), b"top").unwrap();
        std::fs::write(src.join("a/b/deep"), payload(7)).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("top", src.join("link")).unwrap();

        let dst = dir.path().join("dst");
        copy_and_verify(&src, &dst).unwrap();

        assert_eq!(std::fs::read(dst.join("top")).unwrap(), b"top");
        assert_eq!(std::fs::read(dst.join("a/b/deep")).unwrap(), payload(7));
        #[cfg(unix)]
        assert_eq!(
            std::fs::read_link(dst.join("link")).unwrap(),
            PathBuf::from("top")
        );
    }

    #[test]
    fn test_move_path_does_not_copy_on_ordinary_rename_failure() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("file"), b"new").unwrap();
        std::fs::create_dir_all(&dst).unwrap();
        std::fs::write(dst.join("other"), b"occupied").unwrap();

        // Renaming onto a non-empty directory fails on the same filesystem.
        assert!(move_path(&src, &dst).is_err());
        assert_eq!(std::fs::read(src.join("file")).unwrap(), b"new");
        assert!(!dst.join("file").exists());
        assert_eq!(std::fs::read(dst.join("other")).unwrap(), b"occupied");
    }

    #[test]
    fn test_crosses_devices() {
        let exdev = if cfg!(windows) { 17 } else { 18 };
        assert!(crosses_devices(&std::io::Error::from_raw_os_error(exdev)));
        assert!(!crosses_devices(&std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        )));
    }

    #[test]
    fn test_post_install_tolerates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone.app");
        post_install(
            &InstallLayout::MacBundle {
                running: missing.clone(),
            },
            &missing,
        );
        post_install(
            &InstallLayout::AppImage {
                running: missing.clone(),
            },
            &missing,
        );
        assert!(!missing.exists());
    }

    #[test]
    fn test_move_path_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        assert!(move_path(&dir.path().join("nope"), &dir.path().join("dst")).is_err());
    }
}
