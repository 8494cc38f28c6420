//! Atomic JSON persistence shared by every on-disk snapshot.
//!
//! Files are read whole, updated in memory, serialised, and rewritten via
//! write-new-then-rename so a crash never leaves a torn file behind.

use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Read and deserialize a whole JSON file.
pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let data = fs::read(path.as_ref())?;
    Ok(serde_json::from_slice(&data)?)
}

/// Serialize `value` and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    let data = serde_json::to_vec_pretty(value)?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// 8-byte content hash (16 hex chars) used for optimistic-concurrency checks
/// on admin-owned snapshots and for the notice identity tag.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}

/// Verify a client-supplied hash against the current file contents.
pub fn verify_hash(current: &[u8], supplied: &str) -> bool {
    content_hash(current) == supplied
}
