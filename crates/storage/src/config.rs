//! Storage settings and construction of the backend chain.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::backend::{StorageBackend, StorageError};
use crate::local::LocalBackend;
use crate::s3::S3Backend;
use crate::store::ArtifactStore;
use crate::supabase::SupabaseBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    S3,
    Supabase,
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            "supabase" => Ok(Self::Supabase),
            other => Err(StorageError::Config(format!(
                "Unknown storage backend '{other}'. Must be one of: local, s3, supabase"
            ))),
        }
    }
}

/// Parse an ordered, comma-separated backend list such as `s3,local`.
pub fn parse_backend_list(value: &str) -> Result<Vec<BackendKind>, StorageError> {
    let kinds = value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(BackendKind::from_str)
        .collect::<Result<Vec<_>, _>>()?;
    if kinds.is_empty() {
        return Err(StorageError::Config(
            "At least one storage backend must be configured".to_string(),
        ));
    }
    Ok(kinds)
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Backends in the order they are tried.
    pub backends: Vec<BackendKind>,
    pub local_dir: PathBuf,
    pub s3_bucket: Option<String>,
    pub aws_region: String,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub supabase_bucket: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backends: vec![BackendKind::Local],
            local_dir: PathBuf::from("./storage"),
            s3_bucket: None,
            aws_region: "us-east-1".to_string(),
            supabase_url: None,
            supabase_key: None,
            supabase_bucket: None,
        }
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, StorageError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| StorageError::Config(format!("{name} is required")))
}

/// Build the configured fallback chain.
pub async fn build_store(
    config: &StorageConfig,
    http: reqwest::Client,
) -> Result<ArtifactStore, StorageError> {
    let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::with_capacity(config.backends.len());

    for kind in &config.backends {
        let backend: Arc<dyn StorageBackend> = match kind {
            BackendKind::Local => Arc::new(LocalBackend::new(config.local_dir.clone())),
            BackendKind::S3 => {
                let bucket = required(&config.s3_bucket, "S3_BUCKET")?;
                Arc::new(S3Backend::from_env(bucket, config.aws_region.as_str()).await)
            }
            BackendKind::Supabase => Arc::new(SupabaseBackend::new(
                http.clone(),
                required(&config.supabase_url, "SUPABASE_URL")?,
                required(&config.supabase_key, "SUPABASE_KEY")?,
                required(&config.supabase_bucket, "SUPABASE_BUCKET")?,
            )),
        };
        backends.push(backend);
    }

    tracing::info!(
        backends = ?config.backends,
        "Artifact store configured",
    );
    Ok(ArtifactStore::new(backends))
}
