use std::path::PathBuf;

/// Transport-level failures. Kept apart from [`UpdateError`] so the patch walk
/// can tell "this patch was never published" from "the network is down".
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("failed writing download to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

/// Errors surfaced by the update engine.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// The local build manifest is missing or unreadable. Fatal: nothing can
    /// run without knowing which build is installed.
    #[error("local build identity unavailable ({}): {source}", path.display())]
    IdentityUnavailable {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Network(#[from] FetchError),
    #[error("no cached baseline archive for {hash}")]
    BaselineMissing { hash: String },
    #[error("no patch published for {hash}")]
    PatchUnavailable { hash: String },
    #[error("patch for {hash} failed to apply: {reason}")]
    PatchApplyFailed { hash: String, reason: String },
    #[error("patch chain revisits {hash}")]
    CycleDetected { hash: String },
    #[error("downloaded archive {hash} is corrupt: {reason}")]
    DownloadCorrupt { hash: String, reason: String },
    #[error("no installable unit found in archive {hash}")]
    NoInstallableUnitFound { hash: String },
    #[error("failed to swap in new build: {0:#}")]
    SwapFailed(#[source] anyhow::Error),
    #[error("checkForUpdate has not been run")]
    NotChecked,
    #[error("no update available")]
    NoUpdateAvailable,
    #[error("update has not been downloaded")]
    NotReady,
    #[error("{0} already in progress")]
    InProgress(&'static str),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub type Result<T, E = UpdateError> = std::result::Result<T, E>;
