//! LMDB-backed content-addressed blob storage.
//!
//! Two databases share one environment:
//! - `blobs`: hash -> bytes
//! - `sizes`: hash -> length (u64, big-endian)
//!
//! Existence checks and size queries only touch `sizes`, so they never page
//! in blob data. Range reads slice the memory-mapped value in place.
//!
//! The environment's map size is the quota: a write that does not fit
//! fails with [`StoreError::QuotaExceeded`] and the transaction is rolled
//! back.

use async_trait::async_trait;
use hashtree_core::store::{Store, StoreError, StoreStats};
use hashtree_core::types::Hash;
use heed::byteorder::BigEndian;
use heed::types::{Bytes, U64};
use heed::{Database, Env, EnvOpenOptions, MdbError};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default map size: 10GB
pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024 * 1024;

type SizeDb = Database<Bytes, U64<BigEndian>>;

fn db_error(e: heed::Error) -> StoreError {
    match e {
        heed::Error::Io(e) => StoreError::Io(e),
        other => StoreError::Database(other.to_string()),
    }
}

fn is_map_full(e: &heed::Error) -> bool {
    matches!(e, heed::Error::Mdb(MdbError::MapFull))
}

/// Blob store on an LMDB environment
#[derive(Clone)]
pub struct LmdbBlobStore {
    path: PathBuf,
    env: Env,
    blobs: Database<Bytes, Bytes>,
    sizes: SizeDb,
    map_size: usize,
}

impl LmdbBlobStore {
    /// Open (or create) a store at `path` with the default map size
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::with_map_size(path, DEFAULT_MAP_SIZE)
    }

    /// Open with an explicit map size, which caps total storage
    pub fn with_map_size<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per store and the files are
        // not modified by anything outside LMDB.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .open(&path)
                .map_err(db_error)?
        };

        let mut wtxn = env.write_txn().map_err(db_error)?;
        let blobs = env
            .create_database(&mut wtxn, Some("blobs"))
            .map_err(db_error)?;
        let sizes = env
            .create_database(&mut wtxn, Some("sizes"))
            .map_err(db_error)?;
        wtxn.commit().map_err(db_error)?;

        debug!("opened lmdb blob store at {}", path.display());
        Ok(Self {
            path,
            env,
            blobs,
            sizes,
            map_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored length of a blob, read from the size index only
    pub fn size_of(&self, hash: &Hash) -> Result<Option<u64>, StoreError> {
        let rtxn = self.env.read_txn().map_err(db_error)?;
        self.sizes.get(&rtxn, hash.as_slice()).map_err(db_error)
    }

    pub fn put_sync(&self, hash: Hash, data: &[u8]) -> Result<bool, StoreError> {
        let needed = data.len() as u64;
        let quota = |e: heed::Error| {
            if is_map_full(&e) {
                warn!("lmdb map full at {}: need {} bytes", self.path.display(), needed);
                StoreError::QuotaExceeded {
                    needed,
                    available: 0,
                }
            } else {
                db_error(e)
            }
        };

        let mut wtxn = self.env.write_txn().map_err(db_error)?;
        if self.sizes.get(&wtxn, hash.as_slice()).map_err(db_error)?.is_some() {
            return Ok(false);
        }
        self.blobs.put(&mut wtxn, hash.as_slice(), data).map_err(quota)?;
        self.sizes.put(&mut wtxn, hash.as_slice(), &needed).map_err(quota)?;
        wtxn.commit().map_err(quota)?;
        Ok(true)
    }

    pub fn get_sync(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn().map_err(db_error)?;
        Ok(self
            .blobs
            .get(&rtxn, hash.as_slice())
            .map_err(db_error)?
            .map(|data| data.to_vec()))
    }

    pub fn get_range_sync(
        &self,
        hash: &Hash,
        start: u64,
        end: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn().map_err(db_error)?;
        Ok(self
            .blobs
            .get(&rtxn, hash.as_slice())
            .map_err(db_error)?
            .map(|data| {
                let end = (end as usize).min(data.len());
                let start = (start as usize).min(end);
                data[start..end].to_vec()
            }))
    }

    pub fn delete_sync(&self, hash: &Hash) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(db_error)?;
        let existed = self.blobs.delete(&mut wtxn, hash.as_slice()).map_err(db_error)?;
        self.sizes.delete(&mut wtxn, hash.as_slice()).map_err(db_error)?;
        wtxn.commit().map_err(db_error)?;
        Ok(existed)
    }

    /// Count and total bytes, computed from the size index
    pub fn usage(&self) -> Result<StoreStats, StoreError> {
        let rtxn = self.env.read_txn().map_err(db_error)?;
        let mut stats = StoreStats::default();
        for item in self.sizes.iter(&rtxn).map_err(db_error)? {
            let (_, size) = item.map_err(db_error)?;
            stats.count += 1;
            stats.bytes += size;
        }
        Ok(stats)
    }

    /// List all hashes in the store
    pub fn list(&self) -> Result<Vec<Hash>, StoreError> {
        let rtxn = self.env.read_txn().map_err(db_error)?;
        let mut hashes = Vec::new();
        for item in self.sizes.iter(&rtxn).map_err(db_error)? {
            let (key, _) = item.map_err(db_error)?;
            if let Ok(hash) = <Hash>::try_from(key) {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }
}

#[async_trait]
impl Store for LmdbBlobStore {
    async fn put_hashed(&self, hash: Hash, data: Vec<u8>) -> Result<bool, StoreError> {
        self.put_sync(hash, &data)
    }

    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_sync(hash)
    }

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.size_of(hash)?.is_some())
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

    fn max_bytes(&self) -> Option<u64> {
        Some(self.map_size as u64)
    }

    async fn stats(&self) -> StoreStats {
        match self.usage() {
            Ok(stats) => stats,
            Err(e) => {
                warn!("failed to read lmdb usage: {}", e);
                StoreStats::default()
            }
        }
    }
}
