//! Copy-on-write mutation
//!
//! A change rewrites one leaf. At each level the rewritten range is re-grouped
//! by the level chunker, starting from the nearest node whose start is a
//! greedy boundary and stopping as soon as the grouping lines up with an
//! existing node again. The replacement entries then become the dirty range
//! of the parent level. Everything outside the rewritten ranges is reused by
//! hash.
//!
//! Nodes are addressed by their path of child indices from the root, and
//! every node touched during one mutation is cached by hash.

use std::collections::HashMap;
use std::sync::Arc;

use crate::store::Store;
use crate::types::{short_hex, BTreeNode, Cid, Hash, Link, LinkType, NodeEntry};

use super::shape::{chunk_level, LevelChunker};
use super::{child_index, root_cid, BTree, BTreeError};

pub(crate) enum Change {
    Set(Link),
    Delete,
}

type NodeCache = HashMap<Hash, Arc<BTreeNode>>;

async fn load_cached<S: Store>(
    tree: &BTree<S>,
    cache: &mut NodeCache,
    hash: &Hash,
) -> Result<Arc<BTreeNode>, BTreeError> {
    if let Some(node) = cache.get(hash) {
        return Ok(node.clone());
    }
    let node = Arc::new(tree.load_node(hash).await?);
    cache.insert(*hash, node.clone());
    Ok(node)
}

/// Store one group as a node and return the parent entry pointing at it
pub(crate) async fn store_group<S: Store>(
    tree: &BTree<S>,
    cache: &mut NodeCache,
    height: u8,
    entries: Vec<NodeEntry>,
) -> Result<NodeEntry, BTreeError> {
    let node = BTreeNode { height, entries };
    let hash = tree.write_node(&node).await?;
    let key = node.first_key().unwrap_or_default().to_string();
    let size = node.subtree_len();
    cache.insert(hash, Arc::new(node));
    Ok(NodeEntry::new(
        key,
        Link::new(hash)
            .with_size(size)
            .with_link_type(LinkType::Dir),
    ))
}

/// Turn the entries of the topmost rewritten level into a root
///
/// Grows new levels while there is more than one node, then drops internal
/// roots that have a single child.
pub(crate) async fn finish_root<S: Store>(
    tree: &BTree<S>,
    cache: &mut NodeCache,
    mut height: u8,
    mut level: Vec<NodeEntry>,
) -> Result<Cid, BTreeError> {
    if level.is_empty() {
        return tree.empty_root().await;
    }

    let (min, max) = (tree.options.min_entries(), tree.options.max_entries());
    while level.len() > 1 {
        height = height
            .checked_add(1)
            .ok_or_else(|| BTreeError::Corrupt("tree height overflow".into()))?;
        let groups = chunk_level(height, min, max, level);
        level = Vec::with_capacity(groups.len());
        for group in groups {
            level.push(store_group(tree, cache, height, group).await?);
        }
        tracing::debug!(height, nodes = level.len(), "btree grew a level");
    }

    let mut hash = level[0].link.hash;
    let mut node = load_cached(tree, cache, &hash).await?;
    while !node.is_leaf() && node.entries.len() == 1 {
        tracing::debug!(height = node.height, "btree collapsed single-child root");
        hash = node.entries[0].link.hash;
        node = load_cached(tree, cache, &hash).await?;
    }
    Ok(root_cid(hash, &node))
}

/// State for one set/delete against one root
pub(crate) struct Mutation<'a, S: Store> {
    tree: &'a BTree<S>,
    root: Arc<BTreeNode>,
    cache: NodeCache,
}

impl<'a, S: Store> Mutation<'a, S> {
    pub(crate) async fn new(tree: &'a BTree<S>, root: Hash) -> Result<Self, BTreeError> {
        let mut cache = NodeCache::new();
        let root = load_cached(tree, &mut cache, &root).await?;
        Ok(Self { tree, root, cache })
    }

    async fn node_at(&mut self, path: &[usize]) -> Result<Arc<BTreeNode>, BTreeError> {
        let mut node = self.root.clone();
        for &i in path {
            let child = node
                .entries
                .get(i)
                .ok_or_else(|| BTreeError::Corrupt(format!("no child {} at height {}", i, node.height)))?
                .link
                .hash;
            node = load_cached(self.tree, &mut self.cache, &child).await?;
        }
        Ok(node)
    }

    /// Path of the node after `path` on the same level
    async fn next_path(&mut self, path: &[usize]) -> Result<Option<Vec<usize>>, BTreeError> {
        for depth in (0..path.len()).rev() {
            let parent = self.node_at(&path[..depth]).await?;
            if path[depth] + 1 < parent.entries.len() {
                let mut next = path[..depth].to_vec();
                next.push(path[depth] + 1);
                next.resize(path.len(), 0);
                return Ok(Some(next));
            }
        }
        Ok(None)
    }

    /// Path of the node before `path` on the same level
    async fn prev_path(&mut self, path: &[usize]) -> Result<Option<Vec<usize>>, BTreeError> {
        for depth in (0..path.len()).rev() {
            if path[depth] > 0 {
                let mut prev = path[..depth].to_vec();
                prev.push(path[depth] - 1);
                while prev.len() < path.len() {
                    let node = self.node_at(&prev).await?;
                    prev.push(node.entries.len().saturating_sub(1));
                }
                return Ok(Some(prev));
            }
        }
        Ok(None)
    }

    /// Apply one change; `None` when the tree is unchanged
    pub(crate) async fn apply(
        mut self,
        key: &str,
        change: Change,
    ) -> Result<Option<Cid>, BTreeError> {
        let mut path = Vec::with_capacity(self.root.height as usize);
        let mut node = self.root.clone();
        while !node.is_leaf() {
            if node.entries.is_empty() {
                return Err(BTreeError::Corrupt(format!(
                    "empty internal node at height {}",
                    node.height
                )));
            }
            let i = child_index(&node, key);
            path.push(i);
            let child = node.entries[i].link.hash;
            node = load_cached(self.tree, &mut self.cache, &child).await?;
        }

        let mut entries = node.entries.clone();
        match (entries.binary_search_by(|e| e.key.as_str().cmp(key)), change) {
            (Ok(i), Change::Set(link)) => {
                if entries[i].link == link {
                    return Ok(None);
                }
                entries[i].link = link;
            }
            (Err(i), Change::Set(link)) => entries.insert(i, NodeEntry::new(key, link)),
            (Ok(i), Change::Delete) => {
                entries.remove(i);
            }
            (Err(_), Change::Delete) => return Ok(None),
        }

        let root = self.rewrite(path.clone(), path, entries).await?;
        tracing::debug!(
            root = %short_hex(&root.hash),
            entries = root.size,
            cached = self.cache.len(),
            "btree mutation"
        );
        Ok(Some(root))
    }

    /// Replace the nodes `first..=last` of the level with `dirty`, then
    /// propagate the change up to the root
    async fn rewrite(
        &mut self,
        mut first: Vec<usize>,
        mut last: Vec<usize>,
        mut dirty: Vec<NodeEntry>,
    ) -> Result<Cid, BTreeError> {
        let (min, max) = (
            self.tree.options.min_entries(),
            self.tree.options.max_entries(),
        );
        let mut height: u8 = 0;

        loop {
            let mut chunker = LevelChunker::new(height, min, max);

            // The last node of a level may start mid-group, so restart one earlier
            let mut start = first;
            if !start.is_empty() && self.next_path(&start).await?.is_none() {
                if let Some(prev) = self.prev_path(&start).await? {
                    let node = self.node_at(&prev).await?;
                    chunker.extend(node.entries.iter().cloned());
                    start = prev;
                }
            }
            chunker.extend(dirty);

            let mut end = last;
            while let Some(next) = self.next_path(&end).await? {
                if chunker.is_fresh() && self.next_path(&next).await?.is_some() {
                    break;
                }
                let node = self.node_at(&next).await?;
                chunker.extend(node.entries.iter().cloned());
                end = next;
            }

            let groups = chunker.finish();
            let mut replacement = Vec::with_capacity(groups.len());
            for group in groups {
                replacement.push(store_group(self.tree, &mut self.cache, height, group).await?);
            }

            let Some(start_idx) = start.pop() else {
                return finish_root(self.tree, &mut self.cache, height, replacement).await;
            };
            let end_idx = end
                .pop()
                .ok_or_else(|| BTreeError::Corrupt("rewrite range spans levels".into()))?;

            let start_parent = self.node_at(&start).await?;
            let end_parent = self.node_at(&end).await?;
            let mut parent_dirty = start_parent.entries[..start_idx].to_vec();
            parent_dirty.extend(replacement);
            parent_dirty.extend(end_parent.entries[end_idx + 1..].iter().cloned());

            first = start;
            last = end;
            dirty = parent_dirty;
            height += 1;
        }
    }
}
