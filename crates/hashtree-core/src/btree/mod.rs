//! Persistent copy-on-write B-tree over a content-addressed store
//!
//! Maps string keys to [`Link`]s. Every node is MessagePack-encoded and
//! stored by hash, and a version of the tree is just the [`Cid`] of its
//! root node. Mutations return a new root and never touch existing nodes,
//! so every old root stays readable and unchanged subtrees are shared.
//!
//! The node layout is a function of the entry set alone (see `shape`), so
//! equal contents always produce equal roots regardless of insertion order
//! or deletion history.

mod key;
mod mutate;
mod range;
mod shape;

use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;

use futures::TryStreamExt;

use crate::codec::{decode_btree_node, encode_and_hash, CodecError};
use crate::store::{Store, StoreError};
use crate::types::{to_hex, BTreeNode, Cid, Codec, Hash, Link, LinkType, NodeEntry};

pub use key::{escape_key, unescape_key, EscapingKeyEncoder, KeyEncoder, KeyError};
pub use range::RangeStream;

/// Default maximum entries per node
pub const DEFAULT_ORDER: usize = 32;

/// Smallest order that keeps both `min >= 2` and `max >= 2 * min`
pub const MIN_ORDER: usize = 4;

/// B-tree error type
#[derive(Debug, thiserror::Error)]
pub enum BTreeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Missing node: {0}")]
    MissingNode(String),
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
    #[error("Corrupt tree: {0}")]
    Corrupt(String),
}

/// Node size bounds and key encoding
#[derive(Debug, Clone)]
pub struct BTreeOptions {
    /// Maximum entries per node. Non-root nodes hold at least `order / 2`.
    pub order: usize,
    pub key_encoder: Arc<dyn KeyEncoder>,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            order: DEFAULT_ORDER,
            key_encoder: Arc::new(EscapingKeyEncoder),
        }
    }
}

impl BTreeOptions {
    pub fn new(order: usize) -> Self {
        Self {
            order,
            ..Default::default()
        }
    }

    pub fn with_key_encoder(mut self, encoder: Arc<dyn KeyEncoder>) -> Self {
        self.key_encoder = encoder;
        self
    }

    pub fn max_entries(&self) -> usize {
        self.order
    }

    pub fn min_entries(&self) -> usize {
        self.order / 2
    }

    pub fn validate(&self) -> Result<(), BTreeError> {
        if self.order < MIN_ORDER {
            return Err(BTreeError::InvalidOptions(format!(
                "order must be at least {}, got {}",
                MIN_ORDER, self.order
            )));
        }
        if self.order > u16::MAX as usize {
            return Err(BTreeError::InvalidOptions(format!(
                "order {} is too large",
                self.order
            )));
        }
        Ok(())
    }
}

/// CID naming a tree root
fn root_cid(hash: Hash, node: &BTreeNode) -> Cid {
    Cid::new(hash, LinkType::Dir, node.subtree_len()).with_codec(Codec::MessagePack)
}

/// Index of the child whose subtree may contain `key`
fn child_index(node: &BTreeNode, key: &str) -> usize {
    match node.entries.binary_search_by(|e| e.key.as_str().cmp(key)) {
        Ok(i) => i,
        Err(0) => 0,
        Err(i) => i - 1,
    }
}

/// Persistent B-tree handle
///
/// Holds no root of its own; every operation takes the root to act on.
/// Reads against any root may run concurrently. Mutations against the same
/// lineage must be serialized by the caller (see [`crate::HashTree`]).
pub struct BTree<S: Store> {
    store: Arc<S>,
    options: BTreeOptions,
}

impl<S: Store> Clone for BTree<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            options: self.options.clone(),
        }
    }
}

impl<S: Store> BTree<S> {
    pub fn new(store: Arc<S>, options: BTreeOptions) -> Result<Self, BTreeError> {
        options.validate()?;
        Ok(Self { store, options })
    }

    /// Tree with the default order and key encoder
    pub fn with_defaults(store: Arc<S>) -> Self {
        Self {
            store,
            options: BTreeOptions::default(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn options(&self) -> &BTreeOptions {
        &self.options
    }

    pub(crate) async fn load_node(&self, hash: &Hash) -> Result<BTreeNode, BTreeError> {
        let data = self
            .store
            .get(hash)
            .await?
            .ok_or_else(|| BTreeError::MissingNode(to_hex(hash)))?;
        Ok(decode_btree_node(&data)?)
    }

    pub(crate) async fn write_node(&self, node: &BTreeNode) -> Result<Hash, BTreeError> {
        let (data, hash) = encode_and_hash(node)?;
        self.store.put_hashed(hash, data).await?;
        Ok(hash)
    }

    /// Store the empty tree and return its root
    pub async fn empty_root(&self) -> Result<Cid, BTreeError> {
        let node = BTreeNode::default();
        let hash = self.write_node(&node).await?;
        Ok(root_cid(hash, &node))
    }

    /// Look up `key` under `root`
    pub async fn get(&self, root: &Cid, key: &str) -> Result<Option<Link>, BTreeError> {
        let encoded = self.options.key_encoder.encode(key);
        let mut node = self.load_node(&root.hash).await?;
        while !node.is_leaf() {
            if node.entries.is_empty() {
                return Err(BTreeError::Corrupt(format!(
                    "empty internal node at height {}",
                    node.height
                )));
            }
            let child = node.entries[child_index(&node, &encoded)].link.hash;
            node = self.load_node(&child).await?;
        }
        Ok(node
            .entries
            .binary_search_by(|e| e.key.as_str().cmp(encoded.as_str()))
            .ok()
            .map(|i| node.entries[i].link.clone()))
    }

    /// Insert or replace `key`, returning the new root
    pub async fn set(&self, root: &Cid, key: &str, link: Link) -> Result<Cid, BTreeError> {
        let encoded = self.options.key_encoder.encode(key);
        mutate::Mutation::new(self, root.hash)
            .await?
            .apply(&encoded, mutate::Change::Set(link))
            .await
            .map(|result| result.unwrap_or(*root))
    }

    /// Remove `key`, returning the new root (the same root if the key is absent)
    pub async fn delete(&self, root: &Cid, key: &str) -> Result<Cid, BTreeError> {
        let encoded = self.options.key_encoder.encode(key);
        mutate::Mutation::new(self, root.hash)
            .await?
            .apply(&encoded, mutate::Change::Delete)
            .await
            .map(|result| result.unwrap_or(*root))
    }

    /// Number of entries under `root`
    pub async fn len(&self, root: &Cid) -> Result<u64, BTreeError> {
        Ok(self.load_node(&root.hash).await?.subtree_len())
    }

    pub async fn is_empty(&self, root: &Cid) -> Result<bool, BTreeError> {
        Ok(self.len(root).await? == 0)
    }

    /// Lazy ascending scan of entries between `start` and `end`
    ///
    /// To resume an interrupted scan, pass `Bound::Excluded(last_key_seen)`.
    pub fn range<'a>(
        &'a self,
        root: &Cid,
        start: Bound<&str>,
        end: Bound<&str>,
    ) -> RangeStream<'a> {
        let encode = |b: Bound<&str>| match b {
            Bound::Included(k) => Bound::Included(self.options.key_encoder.encode(k)),
            Bound::Excluded(k) => Bound::Excluded(self.options.key_encoder.encode(k)),
            Bound::Unbounded => Bound::Unbounded,
        };
        range::range_stream(self, root.hash, encode(start), encode(end))
    }

    /// All entries in key order
    pub async fn entries(&self, root: &Cid) -> Result<Vec<(String, Link)>, BTreeError> {
        self.range(root, Bound::Unbounded, Bound::Unbounded)
            .try_collect()
            .await
    }

    /// Build a tree from scratch; later duplicates of a key win
    pub async fn build(
        &self,
        entries: impl IntoIterator<Item = (String, Link)>,
    ) -> Result<Cid, BTreeError> {
        let mut sorted: HashMap<String, Link> = HashMap::new();
        for (key, link) in entries {
            sorted.insert(self.options.key_encoder.encode(&key), link);
        }
        let mut leaf_entries: Vec<NodeEntry> = sorted
            .into_iter()
            .map(|(key, link)| NodeEntry::new(key, link))
            .collect();
        leaf_entries.sort_by(|a, b| a.key.cmp(&b.key));

        let groups = shape::chunk_level(
            0,
            self.options.min_entries(),
            self.options.max_entries(),
            leaf_entries,
        );
        let mut cache = HashMap::new();
        let mut level = Vec::with_capacity(groups.len());
        for group in groups {
            level.push(mutate::store_group(self, &mut cache, 0, group).await?);
        }
        mutate::finish_root(self, &mut cache, 0, level).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn link(n: u32) -> Link {
        Link::blob(crate::hash::sha256(&n.to_be_bytes()), n as u64)
    }

    fn tree() -> BTree<MemoryStore> {
        BTree::new(Arc::new(MemoryStore::new()), BTreeOptions::new(8)).unwrap()
    }

    #[tokio::test]
    async fn test_empty_tree() {
        let t = tree();
        let root = t.empty_root().await.unwrap();
        assert_eq!(root.kind, LinkType::Dir);
        assert_eq!(t.len(&root).await.unwrap(), 0);
        assert!(t.get(&root, "missing").await.unwrap().is_none());
        assert!(t.entries(&root).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_get() {
        let t = tree();
        let mut root = t.empty_root().await.unwrap();
        for i in 0..50u32 {
            root = t.set(&root, &format!("k{:03}", i), link(i)).await.unwrap();
        }
        assert_eq!(root.size, 50);
        for i in 0..50u32 {
            assert_eq!(t.get(&root, &format!("k{:03}", i)).await.unwrap(), Some(link(i)));
        }
        assert!(t.get(&root, "k999").await.unwrap().is_none());
        assert!(t.get(&root, "").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_keeps_len() {
        let t = tree();
        let root = t.empty_root().await.unwrap();
        let r1 = t.set(&root, "a", link(1)).await.unwrap();
        let r2 = t.set(&r1, "a", link(2)).await.unwrap();
        assert_eq!(t.len(&r2).await.unwrap(), 1);
        assert_eq!(t.get(&r2, "a").await.unwrap(), Some(link(2)));
        // identical value is a no-op
        assert_eq!(t.set(&r2, "a", link(2)).await.unwrap(), r2);
    }

    #[tokio::test]
    async fn test_delete_missing_returns_same_root() {
        let t = tree();
        let root = t.build(vec![("a".to_string(), link(1))]).await.unwrap();
        assert_eq!(t.delete(&root, "zzz").await.unwrap(), root);
    }

    #[tokio::test]
    async fn test_delete_all_gives_empty_root() {
        let t = tree();
        let mut root = t.empty_root().await.unwrap();
        let empty = root;
        for i in 0..30u32 {
            root = t.set(&root, &format!("k{}", i), link(i)).await.unwrap();
        }
        for i in 0..30u32 {
            root = t.delete(&root, &format!("k{}", i)).await.unwrap();
        }
        assert_eq!(root, empty);
    }

    #[tokio::test]
    async fn test_build_matches_incremental() {
        let t = tree();
        let pairs: Vec<(String, Link)> =
            (0..200u32).map(|i| (format!("key/{}", i), link(i))).collect();
        let built = t.build(pairs.clone()).await.unwrap();

        let mut root = t.empty_root().await.unwrap();
        for (k, l) in pairs.into_iter().rev() {
            root = t.set(&root, &k, l).await.unwrap();
        }
        assert_eq!(root, built);
    }

    #[tokio::test]
    async fn test_keys_with_control_bytes() {
        let t = tree();
        let root = t.empty_root().await.unwrap();
        let root = t.set(&root, "a\0b", link(1)).await.unwrap();
        let root = t.set(&root, "a\u{1}", link(2)).await.unwrap();
        let root = t.set(&root, "a", link(3)).await.unwrap();
        let keys: Vec<String> = t
            .entries(&root)
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["a", "a\0b", "a\u{1}"]);
    }

    #[test]
    fn test_options_validation() {
        assert!(BTreeOptions::new(3).validate().is_err());
        assert!(BTreeOptions::new(4).validate().is_ok());
        let opts = BTreeOptions::default();
        assert_eq!(opts.max_entries(), 32);
        assert_eq!(opts.min_entries(), 16);
    }
}
