//! Filesystem backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::backend::{validate_key, StorageBackend, StorageError};

/// Stores artifacts under a root directory, one file per key.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<String, StorageError> {
        validate_key(key)?;

        let path = self.root.join(key);
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(dir).await?;

        // Write to a sibling temp file, then rename over the target.
        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tokio::fs::rename(&tmp, &path).await?;

        let absolute = tokio::fs::canonicalize(&path).await?;
        Ok(format!("file://{}", absolute.display()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn writes_file_and_returns_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());

        let location = backend
            .put("images/job-1/out.png", b"png-bytes", "image/png")
            .await
            .unwrap();

        let written = std::fs::read(dir.path().join("images/job-1/out.png")).unwrap();
        assert_eq!(written, b"png-bytes");
        assert!(location.starts_with("file://"));
        assert!(location.ends_with("images/job-1/out.png"));
    }

    #[tokio::test]
    async fn same_key_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());

        let first = backend.put("videos/j/clip.mp4", b"one", "video/mp4").await.unwrap();
        let second = backend.put("videos/j/clip.mp4", b"two", "video/mp4").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(dir.path().join("videos/j/clip.mp4")).unwrap(), b"two");
        let entries = std::fs::read_dir(dir.path().join("videos/j")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn traversal_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());

        let result = backend.put("../escape.png", b"x", "image/png").await;
        assert_matches!(result, Err(StorageError::InvalidKey(_)));
    }
}
