//! Canonical node boundaries
//!
//! Every level of the tree is the greedy left-to-right grouping of that
//! level's entries. A group closes once it holds `max` entries, or once it
//! holds at least `min` entries and its last key is a boundary key. Whether
//! a key is a boundary depends only on the key and the level height, so the
//! layout of a level is a pure function of its entries.
//!
//! If the final group ends up with fewer than `min` entries it is merged
//! into its predecessor, and the result is split in half if it overflows.
//! Only the last node of a level can start at a position the greedy pass
//! would not have chosen.

use crate::hash::sha256;
use crate::types::NodeEntry;

/// Hash-derived boundary test, similar to a rolling-hash chunker but keyed
/// on whole entries
pub(crate) fn is_boundary(key: &str, height: u8, modulus: u32) -> bool {
    let mut input = Vec::with_capacity(key.len() + 1);
    input.push(height);
    input.extend_from_slice(key.as_bytes());
    let digest = sha256(&input);
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    value % modulus == 0
}

/// Streaming grouper for one level
pub(crate) struct LevelChunker {
    height: u8,
    min: usize,
    max: usize,
    modulus: u32,
    current: Vec<NodeEntry>,
    closed: Vec<Vec<NodeEntry>>,
}

impl LevelChunker {
    pub(crate) fn new(height: u8, min: usize, max: usize) -> Self {
        let modulus = ((max - min) / 2).max(1) as u32;
        Self {
            height,
            min,
            max,
            modulus,
            current: Vec::with_capacity(max),
            closed: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, entry: NodeEntry) {
        let boundary = is_boundary(&entry.key, self.height, self.modulus);
        self.current.push(entry);
        let len = self.current.len();
        if len >= self.max || (len >= self.min && boundary) {
            let group = std::mem::replace(&mut self.current, Vec::with_capacity(self.max));
            self.closed.push(group);
        }
    }

    pub(crate) fn extend(&mut self, entries: impl IntoIterator<Item = NodeEntry>) {
        for entry in entries {
            self.push(entry);
        }
    }

    /// True when the next entry would start a new group
    pub(crate) fn is_fresh(&self) -> bool {
        self.current.is_empty()
    }

    /// Close the level, applying the tail rule
    pub(crate) fn finish(mut self) -> Vec<Vec<NodeEntry>> {
        if self.current.is_empty() {
            return self.closed;
        }
        let tail = std::mem::take(&mut self.current);
        if tail.len() >= self.min {
            self.closed.push(tail);
            return self.closed;
        }
        match self.closed.pop() {
            None => self.closed.push(tail),
            Some(mut merged) => {
                merged.extend(tail);
                if merged.len() > self.max {
                    let second = merged.split_off(merged.len() / 2);
                    self.closed.push(merged);
                    self.closed.push(second);
                } else {
                    self.closed.push(merged);
                }
            }
        }
        self.closed
    }
}

/// Group a whole level at once
pub(crate) fn chunk_level(
    height: u8,
    min: usize,
    max: usize,
    entries: Vec<NodeEntry>,
) -> Vec<Vec<NodeEntry>> {
    let mut chunker = LevelChunker::new(height, min, max);
    chunker.extend(entries);
    chunker.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Link;

    fn entries(n: usize) -> Vec<NodeEntry> {
        (0..n)
            .map(|i| NodeEntry::new(format!("key-{:05}", i), Link::new([0u8; 32])))
            .collect()
    }

    #[test]
    fn test_groups_within_bounds() {
        let (min, max) = (4, 8);
        for n in [0usize, 1, 3, 4, 9, 17, 100, 1000] {
            let groups = chunk_level(0, min, max, entries(n));
            let total: usize = groups.iter().map(|g| g.len()).sum();
            assert_eq!(total, n);
            if groups.len() > 1 {
                for g in &groups {
                    assert!(g.len() >= min && g.len() <= max, "group of {}", g.len());
                }
            }
        }
    }

    #[test]
    fn test_empty_level() {
        assert!(chunk_level(0, 4, 8, Vec::new()).is_empty());
    }

    #[test]
    fn test_small_level_is_one_group() {
        let groups = chunk_level(0, 4, 8, entries(3));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn test_deterministic() {
        let a = chunk_level(1, 4, 8, entries(200));
        let b = chunk_level(1, 4, 8, entries(200));
        assert_eq!(a, b);
    }

    #[test]
    fn test_boundary_depends_on_height() {
        let keys: Vec<String> = (0..64).map(|i| format!("k{}", i)).collect();
        let at = |h: u8| -> Vec<bool> { keys.iter().map(|k| is_boundary(k, h, 2)).collect() };
        assert_ne!(at(0), at(1));
    }
}
