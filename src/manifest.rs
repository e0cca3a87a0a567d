use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::config::UpdaterConfig;
use crate::error::FetchError;
use crate::platform::{join_url, Platform};
use crate::version_store::LocalVersionRecord;

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Upper bound on a buffered `update.json`.
pub const MAX_MANIFEST_BYTES: usize = 1024 * 1024;

pub struct FetchResponse {
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// Streamed GET against the distribution host.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchResponse, FetchError>;
}

/// `reqwest`-backed transport.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &UpdaterConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn get(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Transport {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_length = response.content_length();
        let owned_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| FetchError::Transport {
                    url: owned_url.clone(),
                    message: e.to_string(),
                })
            })
            .boxed();

        Ok(FetchResponse {
            content_length,
            body,
        })
    }
}

/// Result of the most recent update check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUpdateManifest {
    pub version: String,
    pub hash: String,
    pub update_available: bool,
    pub update_ready: bool,
    pub error: String,
}

impl RemoteUpdateManifest {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }
}

/// `update.json` as published. Anything beyond version/hash is ignored;
/// availability is always computed locally.
#[derive(Debug, Deserialize)]
struct PublishedManifest {
    #[serde(default)]
    version: String,
    #[serde(default)]
    hash: String,
}

pub struct ManifestClient {
    fetch: Arc<dyn Fetch>,
    platform: Platform,
    manifest_timeout: Duration,
    idle_timeout: Duration,
}

impl ManifestClient {
    pub fn new(fetch: Arc<dyn Fetch>, platform: Platform, config: &UpdaterConfig) -> Self {
        Self {
            fetch,
            platform,
            manifest_timeout: config.manifest_timeout,
            idle_timeout: config.idle_timeout,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    fn folder_url(&self, local: &LocalVersionRecord, file: &str) -> String {
        join_url(&local.bucket_url, &[&self.platform.folder(&local.channel), file])
    }

    pub fn update_json_url(&self, local: &LocalVersionRecord) -> String {
        format!("{}?{}", self.folder_url(local, "update.json"), cache_buster())
    }

    pub fn patch_url(&self, local: &LocalVersionRecord, source_hash: &str) -> String {
        self.folder_url(local, &format!("{source_hash}.patch"))
    }

    pub fn tarball_url(&self, local: &LocalVersionRecord) -> String {
        let name = self.platform.tarball_file_name(&local.name);
        format!("{}?{}", self.folder_url(local, &name), cache_buster())
    }

    /// Never fails: every problem is reported through the `error` field with
    /// `update_available = false`.
    pub async fn fetch_remote_manifest(&self, local: &LocalVersionRecord) -> RemoteUpdateManifest {
        if local.is_dev() {
            tracing::debug!("dev channel, skipping remote update check");
            return RemoteUpdateManifest {
                version: local.version.clone(),
                hash: local.hash.clone(),
                ..RemoteUpdateManifest::default()
            };
        }

        let url = self.update_json_url(local);
        let body = match tokio::time::timeout(self.manifest_timeout, self.fetch_all(&url)).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                tracing::warn!(url = %url, error = %e, "failed to fetch update manifest");
                return RemoteUpdateManifest::failed(format!(
                    "Failed to fetch update info from {url}: {e}"
                ));
            }
            Err(_) => {
                tracing::warn!(url = %url, "update manifest request timed out");
                return RemoteUpdateManifest::failed(format!(
                    "Failed to fetch update info from {url}: timed out"
                ));
            }
        };

        let published: PublishedManifest = match serde_json::from_slice(&body) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "update manifest is not valid JSON");
                return RemoteUpdateManifest::failed("Invalid update.json: failed to parse JSON");
            }
        };
        if published.hash.is_empty() {
            return RemoteUpdateManifest::failed("Invalid update.json: missing hash");
        }

        let update_available = published.hash != local.hash;
        if update_available {
            tracing::info!(current = %local.hash, latest = %published.hash, "update available");
        } else {
            tracing::info!(hash = %local.hash, "already on latest build");
        }

        RemoteUpdateManifest {
            version: published.version,
            hash: published.hash,
            update_available,
            update_ready: false,
            error: String::new(),
        }
    }

    /// Buffer a small document. The advertised length only sizes the first
    /// allocation; the body itself is capped at [`MAX_MANIFEST_BYTES`].
    async fn fetch_all(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut response = self.fetch.get(url).await?;
        let too_large = || FetchError::Transport {
            url: url.to_string(),
            message: format!("body exceeds {MAX_MANIFEST_BYTES} bytes"),
        };
        let hint = response.content_length.unwrap_or(0).min(MAX_MANIFEST_BYTES as u64);
        let mut body = Vec::with_capacity(hint as usize);
        while let Some(chunk) = response.body.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > MAX_MANIFEST_BYTES {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Stream `url` into `dest` chunk by chunk. `progress` receives
    /// `(bytes_so_far, content_length)` after every chunk.
    pub async fn download_to(
        &self,
        url: &str,
        dest: &Path,
        mut progress: impl FnMut(u64, Option<u64>) + Send,
    ) -> Result<u64, FetchError> {
        let write_err = |source| FetchError::Write {
            path: dest.to_path_buf(),
            source,
        };

        let mut response = tokio::time::timeout(self.idle_timeout, self.fetch.get(url))
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.to_string(),
            })??;

        let mut file = tokio::fs::File::create(dest).await.map_err(write_err)?;
        let mut written: u64 = 0;
        loop {
            let next = tokio::time::timeout(self.idle_timeout, response.body.next())
                .await
                .map_err(|_| FetchError::Timeout {
                    url: url.to_string(),
                })?;
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(write_err)?;
            written += chunk.len() as u64;
            progress(written, response.content_length);
        }
        file.flush().await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;

        tracing::debug!(url = %url, bytes = written, dest = %dest.display(), "download complete");
        Ok(written)
    }
}

fn cache_buster() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..7].to_string()
}
