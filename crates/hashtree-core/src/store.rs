//! Content-addressed blob store interface and the in-memory backend
//!
//! Every layer above (B-tree, chunker, search) reads and writes blob data
//! only through [`Store`]. Backends live in their own crates:
//! `hashtree-fs`, `hashtree-lmdb`, `hashtree-blossom`; the
//! [`crate::fallback::FallbackStore`] combinator composes two of them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::hash::sha256;
use crate::types::{to_hex, Hash};

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of items in store
    pub count: u64,
    /// Total bytes stored
    pub bytes: u64,
}

/// Store error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),
    #[error("All servers unreachable: {0}")]
    AllServersUnreachable(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Store error: {0}")]
    Other(String),
}

/// Content-addressed blob store interface
#[async_trait]
pub trait Store: Send + Sync {
    /// Store data under a hash the caller already computed
    /// Returns true if newly stored, false if already existed
    async fn put_hashed(&self, hash: Hash, data: Vec<u8>) -> Result<bool, StoreError>;

    /// Retrieve data by hash
    /// Returns data or None if not found
    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError>;

    /// Check if hash exists without fetching the blob
    async fn has(&self, hash: &Hash) -> Result<bool, StoreError>;

    /// Delete by hash
    /// Returns true if deleted, false if didn't exist
    async fn delete(&self, hash: &Hash) -> Result<bool, StoreError>;

    /// Store data by its hash and return the hash
    ///
    /// Storing the same bytes twice is a no-op the second time.
    async fn put(&self, data: Vec<u8>) -> Result<Hash, StoreError> {
        let hash = sha256(&data);
        self.put_hashed(hash, data).await?;
        Ok(hash)
    }

    /// Retrieve data, treating absence as [`StoreError::NotFound`]
    async fn get_required(&self, hash: &Hash) -> Result<Vec<u8>, StoreError> {
        self.get(hash)
            .await?
            .ok_or_else(|| StoreError::NotFound(to_hex(hash)))
    }

    /// Read bytes `[start, end)` of a blob; `end` is clamped to the blob length
    ///
    /// The default fetches the whole blob and slices it.
    async fn get_range(
        &self,
        hash: &Hash,
        start: u64,
        end: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.get(hash).await?.map(|data| {
            let end = (end as usize).min(data.len());
            let start = (start as usize).min(end);
            data[start..end].to_vec()
        }))
    }

    /// Whether `get_range` avoids reading the whole blob
    fn supports_partial_reads(&self) -> bool {
        false
    }

    // ========================================================================
    // Optional: Storage limits and eviction (default no-op implementations)
    // ========================================================================

    /// Set maximum storage size in bytes. 0 = unlimited.
    fn set_max_bytes(&self, _max: u64) {}

    /// Get maximum storage size. None = unlimited.
    fn max_bytes(&self) -> Option<u64> {
        None
    }

    /// Get storage statistics
    async fn stats(&self) -> StoreStats {
        StoreStats::default()
    }

    /// Evict items if over storage limit.
    /// Returns number of bytes freed.
    async fn evict_if_needed(&self) -> Result<u64, StoreError> {
        Ok(0)
    }
}

#[async_trait]
impl<T: Store + ?Sized> Store for Arc<T> {
    async fn put_hashed(&self, hash: Hash, data: Vec<u8>) -> Result<bool, StoreError> {
        (**self).put_hashed(hash, data).await
    }

    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(hash).await
    }

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        (**self).has(hash).await
    }

    async fn delete(&self, hash: &Hash) -> Result<bool, StoreError> {
        (**self).delete(hash).await
    }

    async fn get_range(
        &self,
        hash: &Hash,
        start: u64,
        end: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get_range(hash, start, end).await
    }

    fn supports_partial_reads(&self) -> bool {
        (**self).supports_partial_reads()
    }

    fn set_max_bytes(&self, max: u64) {
        (**self).set_max_bytes(max)
    }

    fn max_bytes(&self) -> Option<u64> {
        (**self).max_bytes()
    }

    async fn stats(&self) -> StoreStats {
        (**self).stats().await
    }

    async fn evict_if_needed(&self) -> Result<u64, StoreError> {
        (**self).evict_if_needed().await
    }
}

/// Entry in the memory store with insertion order for eviction
#[derive(Debug, Clone)]
struct MemoryEntry {
    data: Vec<u8>,
    /// Insertion order (lower = older)
    order: u64,
}

/// Internal state for MemoryStore
#[derive(Debug, Default)]
struct MemoryStoreInner {
    data: HashMap<Hash, MemoryEntry>,
    next_order: u64,
    total_bytes: u64,
    max_bytes: Option<u64>,
}

/// In-memory content-addressed store with optional size limit
///
/// Clones share the same underlying map, so a clone can be handed to a
/// [`crate::fallback::FallbackStore`] while tests keep inspecting the original.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new store with a maximum size limit
    pub fn with_max_bytes(max_bytes: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryStoreInner {
                max_bytes: if max_bytes > 0 { Some(max_bytes) } else { None },
                ..Default::default()
            })),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryStoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryStoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get number of stored items
    pub fn size(&self) -> usize {
        self.read().data.len()
    }

    /// Get total bytes stored
    pub fn total_bytes(&self) -> u64 {
        self.read().total_bytes
    }

    /// Clear all data
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.data.clear();
        inner.total_bytes = 0;
    }

    /// List all hashes
    pub fn keys(&self) -> Vec<Hash> {
        self.read().data.keys().copied().collect()
    }

    /// Evict oldest entries until under target bytes
    fn evict_to_target(&self, target_bytes: u64) -> u64 {
        let mut inner = self.write();
        if inner.total_bytes <= target_bytes {
            return 0;
        }

        let mut by_age: Vec<(Hash, u64)> = inner
            .data
            .iter()
            .map(|(hash, entry)| (*hash, entry.order))
            .collect();
        by_age.sort_by_key(|(_, order)| *order);

        let mut freed = 0u64;
        let to_free = inner.total_bytes - target_bytes;
        for (hash, _) in by_age {
            if freed >= to_free {
                break;
            }
            if let Some(entry) = inner.data.remove(&hash) {
                freed += entry.data.len() as u64;
            }
        }
        inner.total_bytes -= freed;

        tracing::debug!(freed, remaining = inner.total_bytes, "memory store evicted");
        freed
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_hashed(&self, hash: Hash, data: Vec<u8>) -> Result<bool, StoreError> {
        let mut inner = self.write();
        if inner.data.contains_key(&hash) {
            return Ok(false);
        }
        let order = inner.next_order;
        inner.next_order += 1;
        inner.total_bytes += data.len() as u64;
        inner.data.insert(hash, MemoryEntry { data, order });
        Ok(true)
    }

    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read().data.get(hash).map(|e| e.data.clone()))
    }

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.read().data.contains_key(hash))
    }

    async fn delete(&self, hash: &Hash) -> Result<bool, StoreError> {
        let mut inner = self.write();
        match inner.data.remove(hash) {
            Some(entry) => {
                inner.total_bytes -= entry.data.len() as u64;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_max_bytes(&self, max: u64) {
        self.write().max_bytes = if max > 0 { Some(max) } else { None };
    }

    fn max_bytes(&self) -> Option<u64> {
        self.read().max_bytes
    }

    async fn stats(&self) -> StoreStats {
        let inner = self.read();
        StoreStats {
            count: inner.data.len() as u64,
            bytes: inner.total_bytes,
        }
    }

    async fn evict_if_needed(&self) -> Result<u64, StoreError> {
        let (max, current) = {
            let inner = self.read();
            match inner.max_bytes {
                Some(m) => (m, inner.total_bytes),
                None => return Ok(0), // No limit set
            }
        };

        if current <= max {
            return Ok(0);
        }

        // Evict to 90% of max to avoid frequent evictions
        let target = max * 9 / 10;
        Ok(self.evict_to_target(target))
    }
}
