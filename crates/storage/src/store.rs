//! Ordered fallback over storage backends.

use std::fmt;
use std::sync::Arc;

use crate::backend::StorageBackend;
use crate::content_type::content_type_for;

/// Where an artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    /// Name of the backend that accepted the upload.
    pub backend: String,
    pub location: String,
}

/// Every backend refused the upload.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// No backend is configured.
    #[error("No storage backend configured")]
    NoBackends,

    /// Each backend failed, in the order they were tried.
    #[error("All storage backends failed: {}", FailureList(.0))]
    AllFailed(Vec<BackendFailure>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFailure {
    pub backend: String,
    pub error: String,
}

struct FailureList<'a>(&'a [BackendFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.backend, failure.error)?;
        }
        Ok(())
    }
}

/// Uploads artifacts to the first backend that accepts them.
#[derive(Clone)]
pub struct ArtifactStore {
    backends: Vec<Arc<dyn StorageBackend>>,
}

impl fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("backends", &self.backend_names())
            .finish()
    }
}

impl ArtifactStore {
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>) -> Self {
        Self { backends }
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Store `bytes` under `key`, trying each backend in order.
    ///
    /// The content type is derived from the key's file extension.
    pub async fn store(&self, key: &str, bytes: &[u8]) -> Result<StoredArtifact, UploadError> {
        if self.backends.is_empty() {
            return Err(UploadError::NoBackends);
        }

        let content_type = content_type_for(key);
        let mut failures = Vec::with_capacity(self.backends.len());

        for backend in &self.backends {
            match backend.put(key, bytes, content_type).await {
                Ok(location) => {
                    tracing::info!(
                        backend = backend.name(),
                        key,
                        size = bytes.len(),
                        location = %location,
                        "Artifact stored",
                    );
                    return Ok(StoredArtifact {
                        backend: backend.name().to_string(),
                        location,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        backend = backend.name(),
                        key,
                        error = %e,
                        "Storage backend failed, trying next",
                    );
                    failures.push(BackendFailure {
                        backend: backend.name().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Err(UploadError::AllFailed(failures))
    }
}
