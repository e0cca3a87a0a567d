use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;

/// Seed the packaging pipeline hashes bundles with.
pub const HASH_SEED: u64 = 43770;

/// Suffixes of the entry that records a bundle's own identity.
const EMBEDDED_MANIFEST_SUFFIXES: [&str; 2] = ["Resources/version.json", "metadata.json"];

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    // SAFETY: cache files are only replaced by rename, never truncated in place.
    unsafe {
        Mmap::map(&file).with_context(|| format!("Failed to memory-map file: {}", path.display()))
    }
}

/// Content hash of an archive's uncompressed bytes: 64-bit wyhash, base-36.
pub fn content_hash(data: &[u8]) -> String {
    to_base36(wyhash::wyhash(data, HASH_SEED))
}

pub fn content_hash_file(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat file: {}", path.display()))?;
    // Mapping a zero-length file fails on some platforms.
    if meta.len() == 0 {
        return Ok(content_hash(&[]));
    }
    let mmap = mmap_file(path)?;
    Ok(content_hash(&mmap))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Stream-decompress a `.tar.zst` into a plain `.tar`.
/// Uses 256 KB buffers on both sides to keep syscall counts down on large bundles.
pub fn decompress_zstd(src: &Path, dest: &Path) -> Result<u64> {
    let input = std::fs::File::open(src)
        .with_context(|| format!("Failed to open compressed archive: {}", src.display()))?;
    let reader = std::io::BufReader::with_capacity(256 * 1024, input);
    let mut decoder = zstd::Decoder::with_buffer(reader).context("Failed to create zstd decoder")?;

    let output = std::fs::File::create(dest)
        .with_context(|| format!("Failed to create archive: {}", dest.display()))?;
    let mut writer = std::io::BufWriter::with_capacity(256 * 1024, output);
    let n = std::io::copy(&mut decoder, &mut writer)
        .with_context(|| format!("Failed to decompress: {}", src.display()))?;
    let output = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("Failed to flush archive: {}", dest.display()))?;
    output.sync_all()?;
    Ok(n)
}

pub fn compress_zstd(src: &Path, dest: &Path, level: i32) -> Result<()> {
    let input = std::fs::File::open(src)
        .with_context(|| format!("Failed to open archive: {}", src.display()))?;
    let output = std::fs::File::create(dest)
        .with_context(|| format!("Failed to create compressed archive: {}", dest.display()))?;
    zstd::stream::copy_encode(input, output, level)
        .with_context(|| format!("Failed to compress: {}", src.display()))
}

#[derive(Debug, Deserialize)]
struct EmbeddedManifest {
    #[serde(default)]
    hash: String,
}

/// Read the identity hash a bundle records about itself, without unpacking
/// anything else. `Ok(None)` when the tar has no manifest entry or the entry
/// carries no usable hash.
pub fn read_embedded_hash(tar_path: &Path) -> Result<Option<String>> {
    let file = std::fs::File::open(tar_path)
        .with_context(|| format!("Failed to open archive: {}", tar_path.display()))?;
    let mut archive = tar::Archive::new(std::io::BufReader::new(file));

    for entry in archive
        .entries()
        .with_context(|| format!("Failed to read tar entries: {}", tar_path.display()))?
    {
        let mut entry = entry.context("Failed to read tar entry")?;
        let path = entry.path().context("Failed to read entry path")?;
        let path = path.to_string_lossy().replace('\\', "/");
        if !EMBEDDED_MANIFEST_SUFFIXES
            .iter()
            .any(|suffix| path.ends_with(suffix))
        {
            continue;
        }

        let mut raw = Vec::new();
        entry
            .read_to_end(&mut raw)
            .with_context(|| format!("Failed to read {path}"))?;
        return Ok(serde_json::from_slice::<EmbeddedManifest>(&raw)
            .ok()
            .map(|m| m.hash)
            .filter(|h| !h.is_empty()));
    }

    Ok(None)
}

/// Unpack a tar into `dest` and return the paths of its entries, relative to
/// `dest`, in archive order. Paths use forward slashes.
pub fn extract(tar_path: &Path, dest: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(tar_path)
        .with_context(|| format!("Failed to open archive: {}", tar_path.display()))?;
    let mut archive = tar::Archive::new(std::io::BufReader::with_capacity(256 * 1024, file));
    archive.set_preserve_permissions(true);

    let mut entries = Vec::new();
    for entry in archive
        .entries()
        .with_context(|| format!("Failed to read tar entries: {}", tar_path.display()))?
    {
        let mut entry = entry.context("Failed to read tar entry")?;
        let rel = entry
            .path()
            .context("Failed to read entry path")?
            .to_string_lossy()
            .replace('\\', "/");
        // unpack_in refuses entries that would escape `dest`.
        if !entry
            .unpack_in(dest)
            .with_context(|| format!("Failed to unpack {rel}"))?
        {
            bail!("Archive entry escapes extraction root: {rel}");
        }
        entries.push(rel);
    }
    Ok(entries)
}
