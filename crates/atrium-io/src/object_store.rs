//! Filesystem-backed object store laid out as `<root>/<bucket>/<key>`.
//!
//! Read URLs are signed with SHA-256 over the shared secret, bucket, key
//! and expiry; the daemon verifies them before serving the bytes.

use atrium_core::storage::validate_key;
use atrium_core::{LocalCopy, ObjectStore, StorageError};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Query parameters carried by a signed read URL.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedUrlParams {
    pub expires: i64,
    pub signature: String,
}

pub struct FsObjectStore {
    root: PathBuf,
    bucket: String,
    base_url: String,
    secret: String,
}

fn sign(secret: &str, bucket: &str, key: &str, expires: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b"\n");
    hasher.update(bucket.as_bytes());
    hasher.update(b"\n");
    hasher.update(key.as_bytes());
    hasher.update(b"\n");
    hasher.update(expires.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Check a signed read URL against `now` (unix seconds).
pub fn verify_signature(
    secret: &str,
    bucket: &str,
    key: &str,
    params: &SignedUrlParams,
    now: i64,
) -> bool {
    if now > params.expires {
        return false;
    }
    let expected = sign(secret, bucket, key, params.expires);
    // Equal-length comparison without early exit.
    expected.len() == params.signature.len()
        && expected
            .bytes()
            .zip(params.signature.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn map_not_found(key: &str, e: io::Error) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(e)
    }
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, bucket: &str, base_url: &str, secret: &str) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(&self.bucket).join(key))
    }

    /// Read a whole object into memory.
    pub fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(key)?;
        std::fs::read(&path).map_err(|e| map_not_found(key, e))
    }

    /// Remove an object. A missing object is `NotFound`.
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        std::fs::remove_file(&path).map_err(|e| map_not_found(key, e))?;
        tracing::debug!(bucket = %self.bucket, key, "object deleted");
        Ok(())
    }

    fn presign_at(&self, key: &str, expires: i64) -> String {
        format!(
            "{}/media/{}/{}?expires={}&signature={}",
            self.base_url,
            self.bucket,
            key,
            expires,
            sign(&self.secret, &self.bucket, key, expires)
        )
    }
}

impl ObjectStore for FsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        std::fs::create_dir_all(parent)?;

        // Write next to the destination, then rename into place.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(bytes)?;
        tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;

        tracing::debug!(
            bucket = %self.bucket,
            key,
            bytes = bytes.len(),
            content_type,
            "object stored"
        );
        Ok(())
    }

    fn get_to_local(&self, key: &str) -> Result<LocalCopy, StorageError> {
        let path = self.object_path(key)?;
        let mut source = std::fs::File::open(&path).map_err(|e| map_not_found(key, e))?;

        let suffix = Path::new(key)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let mut local = tempfile::Builder::new()
            .prefix("atrium-")
            .suffix(&suffix)
            .tempfile()?;
        io::copy(&mut source, &mut local)?;
        local.flush()?;

        Ok(LocalCopy::new(local.into_temp_path()))
    }

    fn presigned_read_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError> {
        validate_key(key)?;
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        let expires = chrono::Utc::now().timestamp().saturating_add(ttl);
        Ok(self.presign_at(key, expires))
    }
}
