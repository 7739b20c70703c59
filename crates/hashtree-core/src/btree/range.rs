//! Lazy range scans
//!
//! The cursor keeps one frame per internal node on the path to the current
//! leaf. Sibling leaves under the same parent are fetched a few at a time
//! concurrently, so a scan costs roughly one round trip per batch of leaves
//! and never holds more than the current path plus one batch in memory.

use std::collections::VecDeque;
use std::ops::Bound;
use std::pin::Pin;

use futures::future::join_all;
use futures::stream::{self, Stream};

use crate::store::Store;
use crate::types::{BTreeNode, Hash, Link, NodeEntry};

use super::{child_index, BTree, BTreeError};

/// Leaves fetched concurrently per batch
const LEAF_PREFETCH: usize = 4;

/// Ascending stream of `(key, link)` pairs
pub type RangeStream<'a> =
    Pin<Box<dyn Stream<Item = Result<(String, Link), BTreeError>> + Send + 'a>>;

struct Frame {
    node: BTreeNode,
    next: usize,
}

struct Cursor<'a, S: Store> {
    tree: &'a BTree<S>,
    root: Hash,
    lower: Bound<String>,
    upper: Bound<String>,
    frames: Vec<Frame>,
    pending: VecDeque<NodeEntry>,
    started: bool,
    done: bool,
}

impl<'a, S: Store> Cursor<'a, S> {
    fn above_lower(&self, key: &str) -> bool {
        match &self.lower {
            Bound::Included(k) => key >= k.as_str(),
            Bound::Excluded(k) => key > k.as_str(),
            Bound::Unbounded => true,
        }
    }

    fn below_upper(&self, key: &str) -> bool {
        match &self.upper {
            Bound::Included(k) => key <= k.as_str(),
            Bound::Excluded(k) => key < k.as_str(),
            Bound::Unbounded => true,
        }
    }

    fn take_leaf(&mut self, leaf: BTreeNode) {
        let entries = leaf.entries.into_iter().filter(|e| self.above_lower(&e.key));
        let entries: Vec<NodeEntry> = entries.collect();
        self.pending.extend(entries);
    }

    /// Descend from `node` towards the lower bound, pushing frames
    async fn descend(&mut self, mut node: BTreeNode, seek: bool) -> Result<(), BTreeError> {
        while !node.is_leaf() {
            let i = match (&self.lower, seek) {
                (Bound::Included(k) | Bound::Excluded(k), true) => child_index(&node, k),
                _ => 0,
            };
            let Some(entry) = node.entries.get(i) else {
                return Err(BTreeError::Corrupt(format!(
                    "empty internal node at height {}",
                    node.height
                )));
            };
            let child = entry.link.hash;
            self.frames.push(Frame { node, next: i + 1 });
            node = self.tree.load_node(&child).await?;
        }
        self.take_leaf(node);
        Ok(())
    }

    /// Load more entries into `pending`; false when the tree is exhausted
    async fn refill(&mut self) -> Result<bool, BTreeError> {
        if !self.started {
            self.started = true;
            let root = self.tree.load_node(&self.root).await?;
            self.descend(root, true).await?;
            return Ok(true);
        }

        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Ok(false);
            };
            if frame.next >= frame.node.entries.len() {
                self.frames.pop();
                continue;
            }

            if frame.node.height == 1 {
                let end = (frame.next + LEAF_PREFETCH).min(frame.node.entries.len());
                let hashes: Vec<Hash> = frame.node.entries[frame.next..end]
                    .iter()
                    .map(|e| e.link.hash)
                    .collect();
                frame.next = end;
                let tree = self.tree;
                let leaves = join_all(hashes.iter().map(|h| tree.load_node(h))).await;
                for leaf in leaves {
                    self.take_leaf(leaf?);
                }
                return Ok(true);
            }

            let child = frame.node.entries[frame.next].link.hash;
            frame.next += 1;
            let node = self.tree.load_node(&child).await?;
            self.descend(node, false).await?;
            return Ok(true);
        }
    }

    async fn next_entry(&mut self) -> Result<Option<(String, Link)>, BTreeError> {
        while !self.done {
            if let Some(entry) = self.pending.pop_front() {
                if !self.below_upper(&entry.key) {
                    self.done = true;
                    break;
                }
                let key = self.tree.options.key_encoder.decode(&entry.key)?;
                return Ok(Some((key, entry.link)));
            }
            if !self.refill().await? {
                self.done = true;
            }
        }
        Ok(None)
    }
}

pub(crate) fn range_stream<S: Store>(
    tree: &BTree<S>,
    root: Hash,
    lower: Bound<String>,
    upper: Bound<String>,
) -> RangeStream<'_> {
    let cursor = Cursor {
        tree,
        root,
        lower,
        upper,
        frames: Vec::new(),
        pending: VecDeque::new(),
        started: false,
        done: false,
    };

    Box::pin(stream::unfold(cursor, |mut cursor| async move {
        match cursor.next_entry().await {
            Ok(Some(item)) => Some((Ok(item), cursor)),
            Ok(None) => None,
            Err(e) => {
                cursor.done = true;
                Some((Err(e), cursor))
            }
        }
    }))
}
