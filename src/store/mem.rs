//! An in-memory chunk store.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use super::{ChunkHandle, FetchError, UploadError};

/// An in-memory chunk store.
///
/// Payloads are addressed by their blake3 hash, so uploading the same payload
/// twice returns the same handle without storing it twice. Cloning shares the
/// underlying map, which makes one instance usable as the common store of
/// several replicas in one process.
#[derive(Debug, Clone, Default)]
pub struct Store {
    blobs: Arc<RwLock<HashMap<ChunkHandle, Bytes>>>,
}

impl Store {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored payloads.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Whether the store holds no payloads.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Whether a payload is stored under the given handle.
    pub fn contains(&self, handle: &ChunkHandle) -> bool {
        self.blobs.read().contains_key(handle)
    }

    /// The handle under which a payload would be stored.
    pub fn handle_for(payload: impl AsRef<[u8]>) -> ChunkHandle {
        ChunkHandle::from_bytes(*blake3::hash(payload.as_ref()).as_bytes())
    }
}

impl super::Store for Store {
    async fn upload(&self, payload: Bytes) -> Result<ChunkHandle, UploadError> {
        let handle = Self::handle_for(&payload);
        self.blobs.write().insert(handle, payload);
        Ok(handle)
    }

    async fn fetch(&self, handle: &ChunkHandle) -> Result<Bytes, FetchError> {
        self.blobs
            .read()
            .get(handle)
            .cloned()
            .ok_or(FetchError::HandleNotFound(*handle))
    }
}

#[cfg(test)]
mod tests {
    use super::super::Store as _;
    use super::*;

    #[tokio::test]
    async fn test_upload_fetch_roundtrip() {
        let store = Store::new();
        let payload = Bytes::from_static(b"some chunk payload");
        let handle = store.upload(payload.clone()).await.unwrap();
        assert_eq!(store.fetch(&handle).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_upload_is_idempotent() {
        let store = Store::new();
        let payload = Bytes::from_static(b"same bytes");
        let h1 = store.upload(payload.clone()).await.unwrap();
        let h2 = store.upload(payload).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_equal_payloads_from_clones_share_handles() {
        let store = Store::new();
        let clone = store.clone();
        let payload = Bytes::from_static(b"replicated chunk");
        let h1 = store.upload(payload.clone()).await.unwrap();
        let h2 = clone.upload(payload).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_unknown_handle() {
        let store = Store::new();
        let handle = ChunkHandle::from_bytes([0u8; 32]);
        let err = store.fetch(&handle).await.unwrap_err();
        assert!(matches!(err, FetchError::HandleNotFound(h) if h == handle));
    }
}
