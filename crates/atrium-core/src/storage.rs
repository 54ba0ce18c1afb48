//! Object store contract.

use crate::types::ObjectRef;
use std::path::Path;
use tempfile::TempPath;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A blob copied to local disk. The file is removed when this value is dropped.
#[derive(Debug)]
pub struct LocalCopy {
    path: TempPath,
}

impl LocalCopy {
    pub fn new(path: TempPath) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Blocking blob store scoped to a single bucket.
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError>;

    /// Copy an object to a scoped local file.
    fn get_to_local(&self, key: &str) -> Result<LocalCopy, StorageError>;

    /// Time-limited read URL for `key`.
    fn presigned_read_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError>;

    fn object_ref(&self, key: &str) -> ObjectRef {
        ObjectRef {
            bucket: self.bucket().to_string(),
            key: key.to_string(),
        }
    }
}

/// `prefix` + random UUID + `extension` (extension includes its dot).
pub fn fresh_key(prefix: &str, extension: &str) -> String {
    format!("{prefix}{}{extension}", uuid::Uuid::new_v4())
}

/// MIME type for an object, judged by the key's extension.
pub fn content_type(key: &str) -> &'static str {
    let ext = key.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

/// Reject keys that could escape the key space of a path-backed store or
/// that need escaping in a URL path. Allowed: ASCII alphanumerics and `-_./`.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
        || key.split('/').any(|seg| seg == ".." || seg == ".");
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
