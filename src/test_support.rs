use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::FetchError;
use crate::manifest::{Fetch, FetchResponse};
use crate::version_store::LocalVersionRecord;

pub const BUCKET: &str = "https://cdn.example.com/myapp";
pub const FOLDER: &str = "https://cdn.example.com/myapp/canary-linux-x64";

/// In-memory host keyed by URL (query string ignored). Records every
/// request it sees.
#[derive(Default)]
pub struct MemoryHost {
    files: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl MemoryHost {
    pub fn put(&self, url: &str, bytes: impl Into<Vec<u8>>) {
        self.files.lock().unwrap().insert(url.to_string(), bytes.into());
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requested(&self, needle: &str) -> bool {
        self.requests().iter().any(|r| r.contains(needle))
    }
}

#[async_trait]
impl Fetch for MemoryHost {
    async fn get(&self, url: &str) -> Result<FetchResponse, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        let key = url.split('?').next().unwrap_or(url);
        let bytes = self
            .files
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                url: url.to_string(),
            })?;
        let len = bytes.len() as u64;
        let chunks: Vec<Result<Bytes, FetchError>> = bytes
            .chunks(1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(FetchResponse {
            content_length: Some(len),
            body: futures::stream::iter(chunks).boxed(),
        })
    }
}

pub fn record(channel: &str, hash: &str) -> LocalVersionRecord {
    LocalVersionRecord {
        version: "1.0.0".into(),
        hash: hash.into(),
        channel: channel.into(),
        bucket_url: BUCKET.into(),
        name: "MyApp".into(),
        identifier: "com.example.myapp".into(),
    }
}

/// Tar bytes of a Linux-style bundle whose embedded manifest names `hash`.
pub fn bundle_tar(hash: &str, payload: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let manifest = format!(r#"{{"version":"1.0.0","hash":"{hash}"}}"#);
    let files: [(&str, &[u8]); 3] = [
        ("MyApp/Resources/version.json", manifest.as_bytes()),
        ("MyApp/bin/launcher", payload),
        ("MyApp.AppImage", payload),
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

pub fn payload(version: u8) -> Vec<u8> {
    let mut data: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    data[1000..1000 + 64].fill(version);
    data
}

pub fn zstd(data: &[u8]) -> Vec<u8> {
    zstd::bulk::compress(data, 3).unwrap()
}

/// In-process patch turning `old` into `new`.
pub fn make_patch(scratch: &Path, old: &[u8], new: &[u8]) -> Vec<u8> {
    let (o, n, p) = (scratch.join("o.tar"), scratch.join("n.tar"), scratch.join("x.patch"));
    std::fs::write(&o, old).unwrap();
    std::fs::write(&n, new).unwrap();
    crate::patch::create_patch(&o, &n, &p).unwrap();
    std::fs::read(&p).unwrap()
}
