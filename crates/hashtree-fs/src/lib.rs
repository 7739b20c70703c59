//! Filesystem-based content-addressed blob storage.
//!
//! Stores blobs in a directory structure similar to git:
//! `{base_path}/{first 2 chars of hash}/{remaining hash chars}`
//!
//! For example, a blob with hash `abcdef123...` would be stored at:
//! `~/.hashtree/blobs/ab/cdef123...`
//!
//! Each origin (application, site, profile) can get its own root with
//! [`FsBlobStore::for_origin`]. A store may carry a byte quota; a write
//! that would exceed it fails with [`StoreError::QuotaExceeded`] and
//! nothing is written.

use async_trait::async_trait;
use hashtree_core::store::{Store, StoreError, StoreStats};
use hashtree_core::types::Hash;
use hashtree_core::sha256;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Suffix of in-progress writes; never counted as blobs
const TEMP_SUFFIX: &str = "tmp";

/// Filesystem-backed blob store implementing hashtree's Store trait.
///
/// Stores blobs in a 256-way sharded directory structure using
/// the first 2 hex characters of the hash as the directory prefix.
/// Usage is counted on open and kept current on every write and delete.
pub struct FsBlobStore {
    base_path: PathBuf,
    /// 0 = unlimited
    max_bytes: AtomicU64,
    used_bytes: AtomicU64,
    count: AtomicU64,
    /// Serializes quota checks with the writes they admit
    write_lock: Mutex<()>,
}

/// Directory name for an origin: readable prefix plus a hash suffix so
/// origins that sanitize to the same prefix stay apart
fn origin_dir_name(origin: &str) -> String {
    let readable: String = origin
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .take(48)
        .collect();
    let digest = hex::encode(&sha256(origin.as_bytes())[..6]);
    format!("{}-{}", readable.trim_matches('.'), digest)
}

impl FsBlobStore {
    /// Create a new filesystem blob store at the given path.
    ///
    /// Creates the directory if it doesn't exist, removes leftovers of
    /// interrupted writes and counts what is already stored.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let base_path = path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let store = Self {
            base_path,
            max_bytes: AtomicU64::new(0),
            used_bytes: AtomicU64::new(0),
            count: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        };
        let usage = store.scan()?;
        store.used_bytes.store(usage.total_bytes, Ordering::Relaxed);
        store.count.store(usage.count, Ordering::Relaxed);
        debug!(
            "opened blob store {} ({} blobs, {} bytes)",
            store.base_path.display(),
            usage.count,
            usage.total_bytes
        );
        Ok(store)
    }

    /// Create a new store with a maximum size limit
    pub fn with_max_bytes<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self, StoreError> {
        let store = Self::new(path)?;
        store.max_bytes.store(max_bytes, Ordering::Relaxed);
        Ok(store)
    }

    /// Store isolated to one origin under `base`
    pub fn for_origin<P: AsRef<Path>>(base: P, origin: &str) -> Result<Self, StoreError> {
        Self::new(base.as_ref().join(origin_dir_name(origin)))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the file path for a given hash.
    ///
    /// Format: `{base_path}/{first 2 hex chars}/{remaining 62 hex chars}`
    fn blob_path(&self, hash: &Hash) -> PathBuf {
        let hex = hex::encode(hash);
        let (prefix, rest) = hex.split_at(2);
        self.base_path.join(prefix).join(rest)
    }

    /// Bytes still available under the quota, None if unlimited
    pub fn available_bytes(&self) -> Option<u64> {
        let max = self.max_bytes.load(Ordering::Relaxed);
        if max == 0 {
            return None;
        }
        Some(max.saturating_sub(self.used_bytes.load(Ordering::Relaxed)))
    }

    /// Sync put operation.
    pub fn put_sync(&self, hash: Hash, data: &[u8]) -> Result<bool, StoreError> {
        let path = self.blob_path(&hash);
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Check if already exists
        if path.exists() {
            return Ok(false);
        }

        let needed = data.len() as u64;
        if let Some(available) = self.available_bytes() {
            if needed > available {
                warn!(
                    "quota exceeded in {}: need {} bytes, {} available",
                    self.base_path.display(),
                    needed,
                    available
                );
                return Err(StoreError::QuotaExceeded { needed, available });
            }
        }

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write atomically using temp file + rename
        let temp_path = path.with_extension(TEMP_SUFFIX);
        fs::write(&temp_path, data)?;
        fs::rename(&temp_path, &path)?;

        self.used_bytes.fetch_add(needed, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Sync get operation.
    pub fn get_sync(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.blob_path(hash)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read bytes `[start, end)` without loading the rest of the blob
    pub fn get_range_sync(
        &self,
        hash: &Hash,
        start: u64,
        end: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let mut file = match fs::File::open(self.blob_path(hash)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        let end = end.min(len);
        let start = start.min(end);

        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::with_capacity((end - start) as usize);
        file.take(end - start).read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    /// Check if a hash exists.
    pub fn exists(&self, hash: &Hash) -> bool {
        self.blob_path(hash).exists()
    }

    /// Sync delete operation.
    pub fn delete_sync(&self, hash: &Hash) -> Result<bool, StoreError> {
        let path = self.blob_path(hash);
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&path)?;
        // counters only change under write_lock
        let used = self.used_bytes.load(Ordering::Relaxed);
        self.used_bytes.store(used.saturating_sub(size), Ordering::Relaxed);
        let count = self.count.load(Ordering::Relaxed);
        self.count.store(count.saturating_sub(1), Ordering::Relaxed);
        Ok(true)
    }

    /// Visit every blob file as (hex hash, path, size)
    fn walk_blobs(&self, mut visit: impl FnMut(String, PathBuf, u64)) -> Result<(), StoreError> {
        // Iterate over prefix directories (00-ff)
        let entries = match fs::read_dir(&self.base_path) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for prefix_entry in entries {
            let prefix_path = prefix_entry?.path();
            if !prefix_path.is_dir() {
                continue;
            }

            let prefix = match prefix_path.file_name().and_then(|n| n.to_str()) {
                Some(p) if p.len() == 2 => p.to_string(),
                _ => continue,
            };

            // Iterate over blobs in this prefix directory
            for blob_entry in fs::read_dir(&prefix_path)? {
                let blob_entry = blob_entry?;
                let path = blob_entry.path();
                let rest = match blob_entry.file_name().to_str() {
                    Some(r) if r.len() == 62 => r.to_string(),
                    Some(r) if r.ends_with(TEMP_SUFFIX) => {
                        debug!("removing interrupted write {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    _ => continue,
                };
                let size = blob_entry.metadata()?.len();
                visit(format!("{}{}", prefix, rest), path, size);
            }
        }
        Ok(())
    }

    fn scan(&self) -> Result<FsStats, StoreError> {
        let mut stats = FsStats::default();
        self.walk_blobs(|_, _, size| {
            stats.count += 1;
            stats.total_bytes += size;
        })?;
        Ok(stats)
    }

    /// List all hashes in the store.
    pub fn list(&self) -> Result<Vec<Hash>, StoreError> {
        let mut hashes = Vec::new();
        self.walk_blobs(|hex, _, _| {
            if let Ok(hash) = hashtree_core::from_hex(&hex) {
                hashes.push(hash);
            }
        })?;
        Ok(hashes)
    }

    /// Current usage as tracked in memory
    pub fn usage(&self) -> FsStats {
        FsStats {
            count: self.count.load(Ordering::Relaxed),
            total_bytes: self.used_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Storage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    pub count: u64,
    pub total_bytes: u64,
}

#[async_trait]
impl Store for FsBlobStore {
    async fn put_hashed(&self, hash: Hash, data: Vec<u8>) -> Result<bool, StoreError> {
        self.put_sync(hash, &data)
    }

    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_sync(hash)
    }

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.exists(hash))
    }

    async fn delete(&self, hash: &Hash) -> Result<bool, StoreError> {
        self.delete_sync(hash)
    }

    async fn get_range(
        &self,
        hash: &Hash,
        start: u64,
        end: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_range_sync(hash, start, end)
    }

    fn supports_partial_reads(&self) -> bool {
        true
    }

    fn set_max_bytes(&self, max: u64) {
        self.max_bytes.store(max, Ordering::Relaxed);
    }

    fn max_bytes(&self) -> Option<u64> {
        let max = self.max_bytes.load(Ordering::Relaxed);
        if max > 0 {
            Some(max)
        } else {
            None
        }
    }

    async fn stats(&self) -> StoreStats {
        let usage = self.usage();
        StoreStats {
            count: usage.count,
            bytes: usage.total_bytes,
        }
    }
}
