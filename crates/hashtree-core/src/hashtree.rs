//! HashTree - versioned key/value tree with file storage
//!
//! Ties the pieces together for applications: a [`BTree`] whose current
//! root and history are tracked here, a [`Chunker`] for large values and an
//! optional [`Notifier`] that hears about every new root.
//!
//! Mutations are serialized through one lock, so concurrent writers never
//! lose each other's changes. Reads take a root and never wait on writers
//! for longer than it takes to copy it.

use std::ops::Bound;
use std::sync::Arc;

use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;

use crate::btree::{BTree, BTreeError, BTreeOptions, DEFAULT_ORDER};
use crate::chunker::{Chunker, ChunkerError, DEFAULT_CHUNK_SIZE};
use crate::events::{Notification, Notifier};
use crate::hash::verify;
use crate::store::{Store, StoreError};
use crate::types::{to_hex, Cid, Link, LinkType};

/// HashTree configuration
#[derive(Clone)]
pub struct HashTreeConfig<S: Store> {
    pub store: Arc<S>,
    /// B-tree order (max entries per node)
    pub order: usize,
    /// Values larger than this are chunked
    pub chunk_size: usize,
    pub notifier: Option<Notifier>,
}

impl<S: Store> HashTreeConfig<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            order: DEFAULT_ORDER,
            chunk_size: DEFAULT_CHUNK_SIZE,
            notifier: None,
        }
    }

    pub fn with_order(mut self, order: usize) -> Self {
        self.order = order;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

/// HashTree error type
#[derive(Debug, thiserror::Error)]
pub enum HashTreeError {
    #[error("Tree error: {0}")]
    Tree(#[from] BTreeError),
    #[error("Chunker error: {0}")]
    Chunker(#[from] ChunkerError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Missing blob: {0}")]
    MissingBlob(String),
    #[error("Hash mismatch for blob {0}")]
    HashMismatch(String),
    #[error("Not a file: {0}")]
    NotAFile(String),
}

/// Every root this handle has produced, oldest first; the last is current
struct History {
    roots: Vec<Cid>,
}

impl History {
    fn current(&self) -> Cid {
        // never empty: seeded with the starting root
        self.roots[self.roots.len() - 1]
    }
}

/// HashTree - versioned tree of links plus file storage
pub struct HashTree<S: Store> {
    tree: BTree<S>,
    chunker: Chunker<S>,
    history: Mutex<History>,
    notifier: Option<Notifier>,
}

impl<S: Store> HashTree<S> {
    /// Start from an empty tree
    pub async fn new(config: HashTreeConfig<S>) -> Result<Self, HashTreeError> {
        let tree = BTree::new(config.store.clone(), BTreeOptions::new(config.order))?;
        let root = tree.empty_root().await?;
        Self::build(tree, config, root)
    }

    /// Continue from an existing root
    pub async fn open(config: HashTreeConfig<S>, root: Cid) -> Result<Self, HashTreeError> {
        let tree = BTree::new(config.store.clone(), BTreeOptions::new(config.order))?;
        // fail early if the root is not reachable
        tree.len(&root).await?;
        Self::build(tree, config, root)
    }

    fn build(tree: BTree<S>, config: HashTreeConfig<S>, root: Cid) -> Result<Self, HashTreeError> {
        let chunker = Chunker::new(config.store, config.chunk_size)?;
        Ok(Self {
            tree,
            chunker,
            history: Mutex::new(History { roots: vec![root] }),
            notifier: config.notifier,
        })
    }

    pub fn tree(&self) -> &BTree<S> {
        &self.tree
    }

    pub fn chunker(&self) -> &Chunker<S> {
        &self.chunker
    }

    pub fn store(&self) -> &Arc<S> {
        self.tree.store()
    }

    pub fn notifier(&self) -> Option<&Notifier> {
        self.notifier.as_ref()
    }

    /// Current root
    pub async fn root(&self) -> Cid {
        self.history.lock().await.current()
    }

    /// All roots this handle has seen, oldest first
    pub async fn history(&self) -> Vec<Cid> {
        self.history.lock().await.roots.clone()
    }

    /// Root number `index` in history (0 is the starting root)
    pub async fn snapshot(&self, index: usize) -> Option<Cid> {
        self.history.lock().await.roots.get(index).copied()
    }

    pub async fn get(&self, key: &str) -> Result<Option<Link>, HashTreeError> {
        let root = self.root().await;
        Ok(self.tree.get(&root, key).await?)
    }

    pub async fn len(&self) -> Result<u64, HashTreeError> {
        let root = self.root().await;
        Ok(self.tree.len(&root).await?)
    }

    pub async fn is_empty(&self) -> Result<bool, HashTreeError> {
        Ok(self.len().await? == 0)
    }

    /// Entries with keys in `[start, end)` of the current root
    pub async fn list(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<(String, Link)>, HashTreeError> {
        let root = self.root().await;
        let start = start.map_or(Bound::Unbounded, Bound::Included);
        let end = end.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(self.tree.range(&root, start, end).try_collect().await?)
    }

    async fn commit<F, Fut>(&self, mutate: F) -> Result<Cid, HashTreeError>
    where
        F: FnOnce(Cid) -> Fut,
        Fut: std::future::Future<Output = Result<Cid, BTreeError>>,
    {
        let mut history = self.history.lock().await;
        let previous = history.current();
        let root = mutate(previous).await?;
        if root != previous {
            history.roots.push(root);
            tracing::debug!(root = %root, entries = root.size, "new root");
            if let Some(notifier) = &self.notifier {
                notifier.notify(Notification::RootChanged {
                    root,
                    previous: Some(previous),
                });
            }
        }
        Ok(root)
    }

    /// Insert or replace `key`, returning the new root
    pub async fn set(&self, key: &str, link: Link) -> Result<Cid, HashTreeError> {
        let tree = &self.tree;
        self.commit(|root| async move { tree.set(&root, key, link).await })
            .await
    }

    /// Remove `key`, returning the new root (unchanged if `key` was absent)
    pub async fn delete(&self, key: &str) -> Result<Cid, HashTreeError> {
        let tree = &self.tree;
        self.commit(|root| async move { tree.delete(&root, key).await })
            .await
    }

    /// Store file contents. Small files become one blob; larger ones are
    /// chunked behind a manifest.
    pub async fn put_file(&self, data: &[u8]) -> Result<Link, HashTreeError> {
        if data.len() <= self.chunker.max_chunk_size() {
            let hash = self.store().put(data.to_vec()).await?;
            return Ok(Link::blob(hash, data.len() as u64));
        }
        let manifest = self.chunker.chunk_bytes(data).await?;
        let cid = self.chunker.put_manifest(&manifest).await?;
        Ok(Link::from_cid(&cid))
    }

    /// [`HashTree::put_file`] for data that does not fit in memory
    pub async fn put_reader<R>(&self, reader: R) -> Result<Link, HashTreeError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let manifest = self.chunker.chunk(reader).await?;
        match manifest.chunks.as_slice() {
            [] => {
                let hash = self.store().put(Vec::new()).await?;
                Ok(Link::blob(hash, 0))
            }
            [only] => Ok(Link::blob(only.hash, only.size)),
            _ => {
                let cid = self.chunker.put_manifest(&manifest).await?;
                Ok(Link::from_cid(&cid))
            }
        }
    }

    /// Store `data` and link it under `key`
    pub async fn add(&self, key: &str, data: &[u8]) -> Result<Cid, HashTreeError> {
        let link = self.put_file(data).await?.with_name(key);
        self.set(key, link).await
    }

    /// Whole contents of a file. A blob link's size may be 0 when only its
    /// hash is known, so the stored length wins.
    pub async fn read_file(&self, link: &Link) -> Result<Vec<u8>, HashTreeError> {
        self.read_range(link, 0, u64::MAX).await
    }

    /// Bytes `[offset, offset + length)` of a file, clamped to its length
    pub async fn read_range(
        &self,
        link: &Link,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, HashTreeError> {
        match link.link_type {
            LinkType::Blob => {
                let data = self
                    .store()
                    .get(&link.hash)
                    .await?
                    .ok_or_else(|| HashTreeError::MissingBlob(to_hex(&link.hash)))?;
                if !verify(&link.hash, &data) {
                    return Err(HashTreeError::HashMismatch(to_hex(&link.hash)));
                }
                let end = offset.saturating_add(length).min(data.len() as u64) as usize;
                let start = (offset as usize).min(end);
                Ok(data[start..end].to_vec())
            }
            LinkType::File => {
                let manifest = self.chunker.load_manifest(&link.hash).await?;
                Ok(self.chunker.read(&manifest, offset, length).await?)
            }
            LinkType::Dir => Err(HashTreeError::NotAFile(to_hex(&link.hash))),
        }
    }
}
