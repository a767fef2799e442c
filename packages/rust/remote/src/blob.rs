//! Blob storage boundary.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use url::Url;

use pdfpipe_shared::{PipelineError, Result};

/// Object storage keyed by slash-separated paths.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob. Missing keys are a [`PipelineError::Blob`] error.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Write a blob, replacing any previous value, and return its URL.
    async fn put(&self, bytes: &[u8], key: &str) -> Result<Url>;

    /// Remove a blob. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// A time-limited read URL for an existing blob.
    async fn presign(&self, key: &str, expiry: Duration) -> Result<Url>;
}

/// Reject keys that could escape the store root.
fn validate_key(key: &str) -> Result<()> {
    let path = Path::new(key);
    let safe = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(PipelineError::validation(format!("invalid blob key: {key:?}")))
    }
}

fn missing(key: &str) -> PipelineError {
    PipelineError::Blob(format!("blob not found: {key}"))
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Blobs stored as files under a root directory.
///
/// URLs are `file://` URLs. Presigned URLs carry no expiry since a local path
/// cannot enforce one.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| PipelineError::io(root, e))?;
        let root = std::fs::canonicalize(root).map_err(|e| PipelineError::io(root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn url_for(path: &Path) -> Result<Url> {
        Url::from_file_path(path)
            .map_err(|()| PipelineError::Blob(format!("no file URL for {}", path.display())))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(missing(key)),
            Err(e) => Err(PipelineError::io(path, e)),
        }
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn put(&self, bytes: &[u8], key: &str) -> Result<Url> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::io(parent, e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::io(&path, e))?;
        debug!("stored blob");
        Self::url_for(&path)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::io(path, e)),
        }
    }

    async fn presign(&self, key: &str, expiry: Duration) -> Result<Url> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(missing(key));
        }
        debug!(key, expiry_secs = expiry.as_secs(), "presigned local blob");
        Self::url_for(&path)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local store, mainly for tests. URLs use the `memory:` scheme.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` currently holds a blob.
    pub async fn contains(&self, key: &str) -> bool {
        self.blobs.read().await.contains_key(key)
    }

    /// Stored keys starting with `prefix`, sorted.
    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .blobs
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn url_for(key: &str) -> Result<Url> {
        Url::parse(&format!("memory:///{key}"))
            .map_err(|e| PipelineError::Blob(format!("no URL for {key}: {e}")))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| missing(key))
    }

    async fn put(&self, bytes: &[u8], key: &str) -> Result<Url> {
        validate_key(key)?;
        self.blobs
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Self::url_for(key)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn presign(&self, key: &str, _expiry: Duration) -> Result<Url> {
        if !self.contains(key).await {
            return Err(missing(key));
        }
        Self::url_for(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRY: Duration = Duration::from_secs(900);

    #[tokio::test]
    async fn fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();

        let url = store.put(b"<html></html>", "documents/a/raw.html").await.unwrap();
        assert_eq!(url.scheme(), "file");
        assert_eq!(store.get("documents/a/raw.html").await.unwrap(), b"<html></html>");

        let presigned = store.presign("documents/a/raw.html", EXPIRY).await.unwrap();
        assert_eq!(presigned, url);

        store.delete("documents/a/raw.html").await.unwrap();
        assert!(matches!(
            store.get("documents/a/raw.html").await.unwrap_err(),
            PipelineError::Blob(_)
        ));
        // Deleting twice is fine.
        store.delete("documents/a/raw.html").await.unwrap();
    }

    #[tokio::test]
    async fn fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();

        for key in ["", "../outside", "/etc/passwd", "a/../../b"] {
            let err = store.put(b"x", key).await.unwrap_err();
            assert!(matches!(err, PipelineError::Validation { .. }), "key {key:?}");
        }
    }

    #[tokio::test]
    async fn presign_requires_existing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        assert!(store.presign("nope.pdf", EXPIRY).await.is_err());

        let memory = MemoryBlobStore::new();
        assert!(memory.presign("nope.pdf", EXPIRY).await.is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        let url = store.put(b"abc", "uploads/o/x.pdf").await.unwrap();
        assert_eq!(url.scheme(), "memory");
        assert!(store.contains("uploads/o/x.pdf").await);
        assert_eq!(store.get("uploads/o/x.pdf").await.unwrap(), b"abc");

        store.delete("uploads/o/x.pdf").await.unwrap();
        assert!(!store.contains("uploads/o/x.pdf").await);
    }

    #[tokio::test]
    async fn memory_store_lists_keys_by_prefix() {
        let store = MemoryBlobStore::new();
        store.put(b"2", "documents/d/b/raw.html").await.unwrap();
        store.put(b"1", "documents/d/a/raw.html").await.unwrap();
        store.put(b"x", "uploads/o/x.pdf").await.unwrap();

        assert_eq!(
            store.keys("documents/d/").await,
            vec!["documents/d/a/raw.html", "documents/d/b/raw.html"]
        );
        assert_eq!(store.keys("").await.len(), 3);
    }
}
