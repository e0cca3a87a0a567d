use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How published `.patch` files are applied.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PatchTool {
    /// External bspatch-compatible binary. `None` means the platform's
    /// `bspatch` next to the running executable.
    Bspatch { path: Option<PathBuf> },
    /// In-process zstd patch format.
    Zstd,
}

impl Default for PatchTool {
    fn default() -> Self {
        PatchTool::Bspatch { path: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdaterConfig {
    pub manifest_path: Option<PathBuf>,
    pub cache_root: Option<PathBuf>,
    pub install_path: Option<PathBuf>,
    pub patch_tool: PatchTool,
    #[serde(with = "secs")]
    pub manifest_timeout: Duration,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// Longest allowed gap between two body chunks of a streamed download.
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    pub user_agent: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            manifest_path: None,
            cache_root: None,
            install_path: None,
            patch_tool: PatchTool::default(),
            manifest_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
            user_agent: format!("patchup/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl UpdaterConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let cfg: UpdaterConfig =
            serde_json::from_str(r#"{ "idleTimeout": 5, "patchTool": { "kind": "zstd" } }"#)
                .unwrap();
        assert_eq!(cfg.idle_timeout, Duration::from_secs(5));
        assert_eq!(cfg.manifest_timeout, Duration::from_secs(30));
        assert_eq!(cfg.patch_tool, PatchTool::Zstd);
        assert!(cfg.cache_root.is_none());
    }

    #[test]
    fn test_bspatch_path_override() {
        let cfg: UpdaterConfig = serde_json::from_str(
            r#"{ "patchTool": { "kind": "bspatch", "path": "/opt/bin/bspatch" } }"#,
        )
        .unwrap();
        assert_eq!(
            cfg.patch_tool,
            PatchTool::Bspatch {
                path: Some(PathBuf::from("/opt/bin/bspatch"))
            }
        );
    }
}
