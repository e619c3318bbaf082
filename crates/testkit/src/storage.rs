use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use charforge_storage::{StorageBackend, StorageError};

use crate::lock;

/// In-memory backend that can be switched into a failing state.
pub struct MemoryBackend {
    name: String,
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    failing: AtomicBool,
    silent: AtomicBool,
    attempts: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Accept uploads without ever finishing them.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stored bytes and content type for `key`.
    pub fn get(&self, key: &str) -> Option<(Vec<u8>, String)> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = lock(&self.objects).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of `put` calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.silent.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected {
                status: 503,
                body: format!("{} unavailable", self.name),
            });
        }
        lock(&self.objects).insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(format!("memory://{}/{key}", self.name))
    }
}

/// Backend that rejects every upload.
pub struct FailingBackend {
    name: String,
    attempts: AtomicUsize,
}

impl FailingBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for FailingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, _key: &str, _bytes: &[u8], _ct: &str) -> Result<String, StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Rejected {
            status: 500,
            body: format!("{} is down", self.name),
        })
    }
}
