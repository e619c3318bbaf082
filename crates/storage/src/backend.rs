use async_trait::async_trait;

/// A durable destination for artifact bytes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs and configuration (`local`, `s3`, ...).
    fn name(&self) -> &str;

    /// Write `bytes` under `key`, overwriting any existing object.
    /// Returns the location of the stored object.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str)
        -> Result<String, StorageError>;
}

/// Errors from a single storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem failure (local backend).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport failure (remote backends).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote service answered with a non-2xx status.
    #[error("Storage service rejected upload ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// AWS SDK failure, rendered with its full error context.
    #[error("S3 error: {0}")]
    S3(String),

    /// The key cannot be stored safely.
    #[error("Invalid storage key '{0}'")]
    InvalidKey(String),

    /// Missing or invalid backend settings.
    #[error("Storage configuration error: {0}")]
    Config(String),
}

/// Reject keys that are empty, absolute, or climb out of the store root.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if bad {
        Err(StorageError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}
