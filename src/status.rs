use serde::Serialize;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
    Checking,
    NoUpdate,
    UpdateAvailable,
    DownloadStarting,
    LocalTarFound,
    LocalTarMissing,
    FetchingPatch,
    PatchNotFound,
    ApplyingPatch,
    PatchApplied,
    PatchFailed,
    CycleDetected,
    PatchChainComplete,
    DownloadingFullBundle,
    DownloadProgress,
    Decompressing,
    DownloadComplete,
    Applying,
    Extracting,
    ReplacingApp,
    LaunchingNewVersion,
    Complete,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_number: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_downloaded: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_patch_path: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusDetails {
    pub fn hash(current: &str) -> Self {
        Self {
            current_hash: Some(current.to_string()),
            ..Self::default()
        }
    }

    pub fn hashes(current: &str, target: &str) -> Self {
        Self {
            current_hash: Some(current.to_string()),
            target_hash: Some(target.to_string()),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub status: UpdateStatus,
    pub message: String,
    pub timestamp: u64,
    pub details: StatusDetails,
}

/// Collects status entries for later inspection and fans them out to live
/// subscribers. Lagging subscribers drop old entries, never block the update.
pub struct StatusReporter {
    history: Mutex<Vec<StatusEntry>>,
    tx: broadcast::Sender<StatusEntry>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            history: Mutex::new(Vec::new()),
            tx,
        }
    }
}

impl StatusReporter {
    pub fn emit(&self, status: UpdateStatus, message: impl Into<String>, details: StatusDetails) {
        let entry = StatusEntry {
            status,
            message: message.into(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            details,
        };
        tracing::debug!(status = ?entry.status, "{}", entry.message);
        if let Ok(mut history) = self.history.lock() {
            history.push(entry.clone());
        }
        // No receivers is fine.
        let _ = self.tx.send(entry);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEntry> {
        self.tx.subscribe()
    }

    pub fn history(&self) -> Vec<StatusEntry> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
    }

    pub fn statuses(&self) -> Vec<UpdateStatus> {
        self.history().into_iter().map(|e| e.status).collect()
    }
}
