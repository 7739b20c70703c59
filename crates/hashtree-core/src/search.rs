//! Search index over tree entries
//!
//! The index is derived data: it is built by walking one or more tree
//! roots and never writes to the tree. Every entry is registered under the
//! terms of its path, where a term is a maximal run of alphanumeric
//! characters (optionally case-folded).
//!
//! # Ranking
//!
//! A query is split into terms the same way. An entry matches when every
//! query term matches at least one of the entry's terms. Each query term
//! scores its best match: exact term 3, term prefix 2, substring 1. The
//! entry score is the sum. Results are ordered by score (highest first),
//! then shorter path, then path in byte order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::btree::{BTree, BTreeError};
use crate::events::{Notification, Notifier};
use crate::store::Store;
use crate::types::{from_hex, to_hex, Cid, Hash, Link, LinkType};

const SCORE_EXACT: u32 = 3;
const SCORE_PREFIX: u32 = 2;
const SCORE_SUBSTRING: u32 = 1;

/// Version written into snapshots
pub const SNAPSHOT_VERSION: u32 = 1;

/// Search error type
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Tree error: {0}")]
    Tree(#[from] BTreeError),
    #[error("Snapshot error: {0}")]
    Snapshot(String),
    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),
}

/// How terms are derived from paths
#[derive(Debug, Clone)]
pub struct SearchIndexOptions {
    /// Lowercase terms and queries
    pub case_fold: bool,
    /// Shorter path terms are not indexed
    pub min_term_length: usize,
}

impl Default for SearchIndexOptions {
    fn default() -> Self {
        Self {
            case_fold: true,
            min_term_length: 2,
        }
    }
}

/// Per-query options
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Maximum number of results
    pub limit: Option<usize>,
    /// Only return links of this type
    pub link_type: Option<LinkType>,
}

/// The link a result points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchLinkResult {
    pub name: String,
    pub cid: Cid,
    pub link_type: LinkType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub path: String,
    pub link: SearchLinkResult,
    pub score: u32,
}

/// Serializable form of an index, for bootstrapping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSnapshot {
    pub version: u32,
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: String,
    pub name: String,
    pub hash: String,
    pub size: u64,
    pub link_type: u8,
}

impl SearchSnapshot {
    pub fn to_json(&self) -> Result<String, SearchError> {
        serde_json::to_string(self).map_err(|e| SearchError::Snapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SearchError> {
        let snapshot: SearchSnapshot =
            serde_json::from_str(json).map_err(|e| SearchError::Snapshot(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SearchError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot)
    }
}

#[derive(Debug, Clone)]
struct IndexedEntry {
    path: String,
    link: SearchLinkResult,
}

/// Split text into terms
fn tokenize(text: &str, case_fold: bool) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(move |t| if case_fold { t.to_lowercase() } else { t.to_string() })
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Inverted index from path terms to entries
pub struct SearchIndex<S: Store> {
    tree: BTree<S>,
    options: SearchIndexOptions,
    entries: Vec<IndexedEntry>,
    by_path: HashMap<String, usize>,
    terms: BTreeMap<String, BTreeSet<usize>>,
    indexed_roots: HashSet<Hash>,
    notifier: Option<Notifier>,
}

impl<S: Store> SearchIndex<S> {
    pub fn new(tree: BTree<S>, options: SearchIndexOptions) -> Self {
        Self {
            tree,
            options,
            entries: Vec::new(),
            by_path: HashMap::new(),
            terms: BTreeMap::new(),
            indexed_roots: HashSet::new(),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Number of indexed entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add or replace one entry. Returns true if the path was new.
    fn insert(&mut self, path: String, link: SearchLinkResult) -> bool {
        if let Some(&id) = self.by_path.get(&path) {
            self.entries[id].link = link;
            return false;
        }

        let id = self.entries.len();
        let min_len = self.options.min_term_length;
        let terms: BTreeSet<String> = tokenize(&path, self.options.case_fold)
            .filter(|t| t.chars().count() >= min_len)
            .collect();
        for term in terms {
            self.terms.entry(term).or_default().insert(id);
        }
        self.by_path.insert(path.clone(), id);
        self.entries.push(IndexedEntry { path, link });
        true
    }

    /// Walk `root` and register every entry, descending into directory
    /// links. Returns the number of new paths. Indexing a root twice is a
    /// no-op.
    pub async fn index(&mut self, root: &Cid) -> Result<usize, SearchError> {
        if !self.indexed_roots.insert(root.hash) {
            return Ok(0);
        }

        let mut added = 0;
        let mut pending: Vec<(String, Cid)> = vec![(String::new(), *root)];
        while let Some((prefix, dir)) = pending.pop() {
            for (key, link) in self.tree.entries(&dir).await? {
                let path = if prefix.is_empty() {
                    key
                } else {
                    format!("{}/{}", prefix, key)
                };
                if link.link_type == LinkType::Dir {
                    pending.push((path.clone(), link.to_cid()));
                }
                let result = Self::link_result(&path, &link);
                if self.insert(path, result) {
                    added += 1;
                }
            }
        }

        tracing::debug!(added, total = self.len(), "search index updated");
        if let Some(notifier) = &self.notifier {
            notifier.notify(Notification::IndexUpdated {
                root: Some(*root),
                entries: self.len(),
            });
        }
        Ok(added)
    }

    /// Drop everything and index `root` from scratch
    pub async fn rebuild(&mut self, root: &Cid) -> Result<usize, SearchError> {
        self.entries.clear();
        self.by_path.clear();
        self.terms.clear();
        self.indexed_roots.clear();
        self.index(root).await
    }

    fn link_result(path: &str, link: &Link) -> SearchLinkResult {
        SearchLinkResult {
            name: link
                .name
                .clone()
                .unwrap_or_else(|| last_segment(path).to_string()),
            cid: link.to_cid(),
            link_type: link.link_type,
        }
    }

    /// Add entries from a precomputed index. Paths already present are kept.
    /// Returns the number of new paths.
    pub fn merge(&mut self, snapshot: &SearchSnapshot) -> Result<usize, SearchError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SearchError::UnsupportedVersion(snapshot.version));
        }
        let mut added = 0;
        for entry in &snapshot.entries {
            if self.by_path.contains_key(&entry.path) {
                continue;
            }
            let hash = from_hex(&entry.hash).map_err(|e| SearchError::Snapshot(e.to_string()))?;
            let link_type = LinkType::from_u8(entry.link_type).ok_or_else(|| {
                SearchError::Snapshot(format!("unknown link type {}", entry.link_type))
            })?;
            let link = Link::new(hash)
                .with_size(entry.size)
                .with_link_type(link_type)
                .with_name(entry.name.clone());
            let result = Self::link_result(&entry.path, &link);
            if self.insert(entry.path.clone(), result) {
                added += 1;
            }
        }
        if added > 0 {
            if let Some(notifier) = &self.notifier {
                notifier.notify(Notification::IndexUpdated {
                    root: None,
                    entries: self.len(),
                });
            }
        }
        Ok(added)
    }

    pub fn to_snapshot(&self) -> SearchSnapshot {
        SearchSnapshot {
            version: SNAPSHOT_VERSION,
            entries: self
                .entries
                .iter()
                .map(|e| SnapshotEntry {
                    path: e.path.clone(),
                    name: e.link.name.clone(),
                    hash: to_hex(&e.link.cid.hash),
                    size: e.link.cid.size,
                    link_type: e.link.link_type as u8,
                })
                .collect(),
        }
    }

    /// Best score per entry for one query term
    fn match_term(&self, query_term: &str) -> HashMap<usize, u32> {
        let mut scores: HashMap<usize, u32> = HashMap::new();
        for (term, ids) in &self.terms {
            let score = if term == query_term {
                SCORE_EXACT
            } else if term.starts_with(query_term) {
                SCORE_PREFIX
            } else if term.contains(query_term) {
                SCORE_SUBSTRING
            } else {
                continue;
            };
            for &id in ids {
                let best = scores.entry(id).or_insert(0);
                *best = (*best).max(score);
            }
        }
        scores
    }

    /// Ranked matches for `query`; empty for an empty query
    pub fn search(&self, query: &str, options: &SearchOptions) -> Vec<SearchResult> {
        let query_terms: Vec<String> = tokenize(query, self.options.case_fold).collect();
        let Some((first, rest)) = query_terms.split_first() else {
            return Vec::new();
        };

        let mut totals = self.match_term(first);
        for term in rest {
            if totals.is_empty() {
                break;
            }
            let scores = self.match_term(term);
            totals = totals
                .into_iter()
                .filter_map(|(id, total)| scores.get(&id).map(|s| (id, total + s)))
                .collect();
        }

        let mut results: Vec<SearchResult> = totals
            .into_iter()
            .filter_map(|(id, score)| {
                let entry = &self.entries[id];
                match options.link_type {
                    Some(t) if t != entry.link.link_type => None,
                    _ => Some(SearchResult {
                        path: entry.path.clone(),
                        link: entry.link.clone(),
                        score,
                    }),
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.path.len().cmp(&b.path.len()))
                .then_with(|| a.path.cmp(&b.path))
        });
        if let Some(limit) = options.limit {
            results.truncate(limit);
        }
        results
    }
}

/// Search index shared between tasks
pub type SharedSearchIndex<S> = Arc<tokio::sync::RwLock<SearchIndex<S>>>;
