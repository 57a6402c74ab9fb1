//! Object storage for uploaded scans, Grad-CAM overlays and PDF reports.

mod gcs;
mod signing;

pub use gcs::{GcsConfig, GcsStore};
pub use signing::{signed_url, HmacKey, MAX_SIGNED_URL_EXPIRY};

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// How a stored object is exposed to the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlMode {
    /// Permanent path, readable when the bucket or object is public.
    Public,
    /// Time-limited signed link.
    Signed { expires: Duration },
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    async fn download(&self, path: &str) -> Result<Vec<u8>>;

    fn url_for(&self, path: &str, mode: UrlMode) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Process-local store for development runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    read_only: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects every upload.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn with_object(self, path: &str, bytes: Vec<u8>, content_type: &str) -> Self {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(
                path.to_string(),
                StoredObject {
                    bytes,
                    content_type: content_type.to_string(),
                },
            );
        }
        self
    }

    pub fn get(&self, path: &str) -> Option<StoredObject> {
        self.objects.lock().ok()?.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .objects
            .lock()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::Storage(format!("store is read-only, cannot write {}", path)));
        }
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| Error::Storage("store lock poisoned".to_string()))?;
        objects.insert(
            path.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        self.get(path)
            .map(|o| o.bytes)
            .ok_or_else(|| Error::Storage(format!("object {} not found", path)))
    }

    fn url_for(&self, path: &str, mode: UrlMode) -> Result<String> {
        Ok(match mode {
            UrlMode::Public => format!("memory://{}", path),
            UrlMode::Signed { expires } => {
                format!("memory://{}?expires={}", path, expires.as_secs())
            }
        })
    }
}
