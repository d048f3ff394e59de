// crates/dispersal-core/src/io.rs

//! Serialization helpers for [`UriExtensionBlock`]s and generic CBOR/JSON payloads.
//!
//! JSON and CBOR read/write with extension-based auto-detection, matching
//! the workspace's convention for manifests and statefiles. Canonical CBOR
//! (deterministic, field-declaration order) is what `tagged_hash` binds to;
//! JSON exists for human-facing inspection only.

use crate::types::UriExtensionBlock;
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Cursor};
use std::path::Path;

/// Ensure the parent directory for `path` exists (no-op if it has none).
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating parent directory {}", display(path)))?;
        }
    }
    Ok(())
}

/// Serialize `value` to canonical CBOR bytes (deterministic field order).
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).context("serialize canonical CBOR")?;
    Ok(buf)
}

/// Deserialize `T` from CBOR bytes produced by [`to_canonical_cbor`].
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut cur = Cursor::new(bytes);
    ciborium::de::from_reader(&mut cur).context("deserialize CBOR")
}

/// Read a [`UriExtensionBlock`] from JSON.
pub fn read_uri_extension_json<P: AsRef<Path>>(path: P) -> Result<UriExtensionBlock> {
    let path_ref = path.as_ref();
    let f = File::open(path_ref).with_context(|| format!("open {}", display(path_ref)))?;
    serde_json::from_reader(BufReader::new(f)).context("deserialize JSON uri-extension")
}

/// Write a [`UriExtensionBlock`] to JSON (pretty-printed).
pub fn write_uri_extension_json<P: AsRef<Path>>(path: P, v: &UriExtensionBlock) -> Result<()> {
    let path_ref = path.as_ref();
    ensure_parent_dir(path_ref)?;
    let f = File::create(path_ref).with_context(|| format!("create {}", display(path_ref)))?;
    serde_json::to_writer_pretty(BufWriter::new(f), v).context("serialize JSON uri-extension")
}

/// Read a [`UriExtensionBlock`] from CBOR.
pub fn read_uri_extension_cbor<P: AsRef<Path>>(path: P) -> Result<UriExtensionBlock> {
    let path_ref = path.as_ref();
    let f = File::open(path_ref).with_context(|| format!("open {}", display(path_ref)))?;
    ciborium::de::from_reader(BufReader::new(f)).context("deserialize CBOR uri-extension")
}

/// Write a [`UriExtensionBlock`] to CBOR.
pub fn write_uri_extension_cbor<P: AsRef<Path>>(path: P, v: &UriExtensionBlock) -> Result<()> {
    let path_ref = path.as_ref();
    ensure_parent_dir(path_ref)?;
    let f = File::create(path_ref).with_context(|| format!("create {}", display(path_ref)))?;
    ciborium::ser::into_writer(v, BufWriter::new(f)).context("serialize CBOR uri-extension")
}

/// Read a [`UriExtensionBlock`], choosing JSON or CBOR by file extension.
pub fn read_uri_extension_auto<P: AsRef<Path>>(path: P) -> Result<UriExtensionBlock> {
    match ext_lower(path.as_ref()).as_deref() {
        Some("json") => read_uri_extension_json(path),
        Some("cbor") => read_uri_extension_cbor(path),
        Some(other) => Err(anyhow!("unsupported uri-extension extension: {other}")),
        None => Err(anyhow!("path has no extension (expected .json or .cbor)")),
    }
}

/// Write a [`UriExtensionBlock`], choosing JSON or CBOR by file extension.
/// Defaults to CBOR when the extension is missing or unrecognized, since
/// that's the form the canonical hash is computed over.
pub fn write_uri_extension_auto<P: AsRef<Path>>(path: P, v: &UriExtensionBlock) -> Result<()> {
    match ext_lower(path.as_ref()).as_deref() {
        Some("json") => write_uri_extension_json(path, v),
        _ => write_uri_extension_cbor(path, v),
    }
}

/// Write `bytes` to `path` atomically: write to a `.tmp` sibling, then
/// rename over the target. Used for checkpoint/statefile writes so a crash
/// mid-write never corrupts the previously valid state.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("write {}", display(&tmp)))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", display(&tmp), display(path)))?;
    Ok(())
}

/// Return the lowercase extension (without dot) if present.
fn ext_lower(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

/// Human-friendly path display for error messages.
fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UriExtensionBlock {
        UriExtensionBlock {
            size: 75,
            segment_size: 25,
            num_segments: 3,
            needed_shares: 25,
            total_shares: 100,
            share_root_hash: [1u8; 32],
            plaintext_root_hash: [2u8; 32],
            crypttext_root_hash: [3u8; 32],
        }
    }

    fn tmp_path(name: &str, ext: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("dispersal_core_io_{name}_{nanos}.{ext}"));
        p
    }

    #[test]
    fn uri_extension_json_roundtrip() {
        let path = tmp_path("uext", "json");
        let v = sample();
        write_uri_extension_auto(&path, &v).unwrap();
        let got = read_uri_extension_auto(&path).unwrap();
        assert_eq!(got, v);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn uri_extension_cbor_roundtrip() {
        let path = tmp_path("uext", "cbor");
        let v = sample();
        write_uri_extension_auto(&path, &v).unwrap();
        let got = read_uri_extension_auto(&path).unwrap();
        assert_eq!(got, v);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn canonical_cbor_is_deterministic() {
        let v = sample();
        let a = to_canonical_cbor(&v).unwrap();
        let b = to_canonical_cbor(&v).unwrap();
        assert_eq!(a, b);
        let back: UriExtensionBlock = from_cbor(&a).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn write_atomic_leaves_no_tmp_file_behind() {
        let path = tmp_path("atomic", "bin");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert!(!path.with_extension("tmp").exists());
        let _ = fs::remove_file(path);
    }
}
