//! Durable artifact storage.
//!
//! Finished job outputs are written through an [`ArtifactStore`], which
//! tries each configured [`StorageBackend`] in order until one accepts the
//! upload.

pub mod backend;
pub mod config;
pub mod content_type;
pub mod local;
pub mod s3;
pub mod store;
pub mod supabase;

pub use backend::{StorageBackend, StorageError};
pub use config::{build_store, parse_backend_list, BackendKind, StorageConfig};
pub use store::{ArtifactStore, StoredArtifact, UploadError};
