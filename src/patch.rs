use anyhow::{bail, Context};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::mmap_file;
use crate::config::PatchTool;
use crate::platform::Platform;

/// Header of the in-process patch format: a zstd frame compressed against the
/// baseline archive as a raw-content dictionary.
pub const MAGIC: &[u8; 8] = b"ZPATCH01";
const LEVEL: i32 = 19;

#[derive(Debug, thiserror::Error)]
pub enum PatchApplyError {
    #[error("patch tool not found: {}", .0.display())]
    ToolMissing(PathBuf),
    #[error("patch tool exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("invalid patch: {0}")]
    Format(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Turns `baseline` + `patch` into `out`. The resolver only sees this seam,
/// so the transform can live in an external binary or in-process.
#[async_trait]
pub trait PatchApplier: Send + Sync {
    async fn apply(&self, baseline: &Path, patch: &Path, out: &Path)
        -> Result<(), PatchApplyError>;
}

pub fn from_config(tool: &PatchTool, platform: Platform) -> anyhow::Result<Arc<dyn PatchApplier>> {
    Ok(match tool {
        PatchTool::Zstd => Arc::new(ZstdPatch),
        PatchTool::Bspatch { path: Some(path) } => Arc::new(BspatchCommand::new(path)),
        PatchTool::Bspatch { path: None } => {
            let exe = std::env::current_exe().context("Failed to locate running executable")?;
            let dir = exe
                .parent()
                .context("Running executable has no parent directory")?;
            Arc::new(BspatchCommand::new(dir.join(platform.patch_tool_name())))
        }
    })
}

/// External bspatch-compatible binary, invoked as `tool old new patch`.
#[derive(Debug, Clone)]
pub struct BspatchCommand {
    tool: PathBuf,
}

impl BspatchCommand {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }
}

#[async_trait]
impl PatchApplier for BspatchCommand {
    async fn apply(
        &self,
        baseline: &Path,
        patch: &Path,
        out: &Path,
    ) -> Result<(), PatchApplyError> {
        if !tokio::fs::try_exists(&self.tool).await.unwrap_or(false) {
            return Err(PatchApplyError::ToolMissing(self.tool.clone()));
        }

        let output = tokio::process::Command::new(&self.tool)
            .arg(baseline)
            .arg(out)
            .arg(patch)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.tool.display()))?;

        if !output.status.success() {
            return Err(PatchApplyError::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// In-process patches built with [`create_patch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ZstdPatch;

#[async_trait]
impl PatchApplier for ZstdPatch {
    async fn apply(
        &self,
        baseline: &Path,
        patch: &Path,
        out: &Path,
    ) -> Result<(), PatchApplyError> {
        let baseline = baseline.to_path_buf();
        let patch = patch.to_path_buf();
        let out = out.to_path_buf();
        tokio::task::spawn_blocking(move || apply_zstd_patch(&baseline, &patch, &out))
            .await
            .context("Patch task panicked")?
    }
}

fn window_log(len: usize) -> u32 {
    let bits = usize::BITS - len.max(1).leading_zeros();
    bits.clamp(10, 30)
}

fn apply_zstd_patch(baseline: &Path, patch: &Path, out: &Path) -> Result<(), PatchApplyError> {
    let raw = mmap_file(patch)?;
    if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
        return Err(PatchApplyError::Format("missing magic header".into()));
    }
    let old = read_baseline(baseline)?;

    let mut decoder = zstd::Decoder::with_dictionary(&raw[MAGIC.len()..], &old)
        .context("Failed to create zstd decoder")?;
    decoder
        .window_log_max(30)
        .context("Failed to configure zstd decoder")?;

    let file = std::fs::File::create(out)
        .with_context(|| format!("Failed to create patched archive: {}", out.display()))?;
    let mut writer = std::io::BufWriter::with_capacity(256 * 1024, file);
    std::io::copy(&mut decoder, &mut writer)
        .map_err(|e| PatchApplyError::Format(format!("failed to decode patch: {e}")))?;
    writer
        .flush()
        .with_context(|| format!("Failed to write patched archive: {}", out.display()))?;
    Ok(())
}

fn read_baseline(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read baseline: {}", path.display()))
}

/// Write a patch turning `old` into `new`. Returns the patch size in bytes.
pub fn create_patch(old: &Path, new: &Path, output: &Path) -> anyhow::Result<u64> {
    let old_data = read_baseline(old)?;
    let new_data = std::fs::read(new)
        .with_context(|| format!("Failed to read new archive: {}", new.display()))?;
    if old_data.is_empty() {
        bail!("Baseline archive is empty: {}", old.display());
    }

    let mut file = std::fs::File::create(output)
        .with_context(|| format!("Failed to create output file: {}", output.display()))?;
    file.write_all(MAGIC)?;

    let mut encoder = zstd::Encoder::with_dictionary(file, LEVEL, &old_data)
        .context("Failed to create zstd encoder")?;
    encoder
        .window_log(window_log(old_data.len().max(new_data.len())))
        .context("Failed to configure zstd encoder")?;
    encoder.long_distance_matching(true)?;
    encoder.write_all(&new_data)?;
    let file = encoder.finish().context("Failed to compress patch data")?;
    file.sync_all()?;

    Ok(std::fs::metadata(output)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| ((i * 31) as u8) ^ seed).collect()
    }

    #[tokio::test]
    async fn test_zstd_patch_reconstructs_target() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.tar");
        let new = dir.path().join("new.tar");
        let patch = dir.path().join("old.patch");
        let out = dir.path().join("out.tar");

        let old_data = sample(200_000, 0);
        let mut new_data = old_data.clone();
        new_data[50_000..50_100].fill(0xEE);
        new_data.extend_from_slice(b"appended tail");
        std::fs::write(&old, &old_data).unwrap();
        std::fs::write(&new, &new_data).unwrap();

        let size = create_patch(&old, &new, &patch).unwrap();
        assert!(size < new_data.len() as u64 / 4, "patch should be far smaller than target");

        ZstdPatch.apply(&old, &patch, &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), new_data);
    }

    #[tokio::test]
    async fn test_zstd_patch_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.tar");
        let patch = dir.path().join("bad.patch");
        std::fs::write(&old, sample(1000, 1)).unwrap();
        std::fs::write(&patch, b"not a patch at all").unwrap();

        let err = ZstdPatch
            .apply(&old, &patch, &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, PatchApplyError::Format(_)));
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = BspatchCommand::new(dir.path().join("no-such-bspatch"));
        let err = cmd
            .apply(&dir.path().join("a"), &dir.path().join("b"), &dir.path().join("c"))
            .await
            .unwrap_err();
        assert!(matches!(err, PatchApplyError::ToolMissing(_)));
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-bspatch");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_tool_argument_order() {
        let dir = tempfile::tempdir().unwrap();
        // Fake tool: the "patch" is the whole new file.
        let tool = script(dir.path(), r#"cat "$3" > "$2""#);
        std::fs::write(dir.path().join("old"), b"old").unwrap();
        std::fs::write(dir.path().join("p"), b"new contents").unwrap();

        BspatchCommand::new(tool)
            .apply(
                &dir.path().join("old"),
                &dir.path().join("p"),
                &dir.path().join("out"),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("out")).unwrap(), b"new contents");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_tool_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let tool = script(dir.path(), "echo corrupt patch >&2; exit 3");
        let err = BspatchCommand::new(tool)
            .apply(&dir.path().join("a"), &dir.path().join("b"), &dir.path().join("c"))
            .await
            .unwrap_err();
        match err {
            PatchApplyError::Exit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "corrupt patch");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
