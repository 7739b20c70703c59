//! HashTree - content-addressed, versioned storage engine
//!
//! Everything is stored by SHA256 hash through one [`Store`] interface:
//! SHA256(content) -> content
//!
//! # Overview
//!
//! - **Blobs**: raw bytes stored under their hash
//! - **B-tree**: a persistent, copy-on-write map from string keys to
//!   [`Link`]s, whose nodes are MessagePack blobs. A version is the [`Cid`]
//!   of a root node; old versions stay readable forever.
//! - **Chunker**: large blobs split into chunks behind a manifest, with
//!   random-access range reads
//! - **Search index**: derived index over tree paths answering prefix and
//!   substring queries
//! - **Fallback store**: local-first reads and writes with background
//!   mirroring to a remote store
//!
//! # Example
//!
//! ```rust
//! use hashtree_core::{HashTree, HashTreeConfig, MemoryStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     let tree = HashTree::new(HashTreeConfig::new(store)).await?;
//!
//!     let v1 = tree.add("hello.txt", b"Hello, World!").await?;
//!     let link = tree.get("hello.txt").await?.expect("just added");
//!     assert_eq!(tree.read_file(&link).await?, b"Hello, World!");
//!
//!     // Old roots stay readable after later writes
//!     tree.delete("hello.txt").await?;
//!     assert!(tree.tree().get(&v1, "hello.txt").await?.is_some());
//!
//!     Ok(())
//! }
//! ```

pub mod btree;
pub mod chunker;
pub mod codec;
pub mod events;
pub mod fallback;
pub mod hash;
pub mod hashtree;
pub mod nhash;
pub mod search;
pub mod store;
pub mod types;

// Main API
pub use hashtree::{HashTree, HashTreeConfig, HashTreeError};

pub use btree::{
    escape_key, unescape_key, BTree, BTreeError, BTreeOptions, EscapingKeyEncoder, KeyEncoder,
    KeyError, RangeStream, DEFAULT_ORDER, MIN_ORDER,
};
pub use chunker::{ChunkStream, Chunker, ChunkerError, DEFAULT_CHUNK_SIZE};
pub use events::{Channel, Notification, Notifier};
pub use fallback::{FallbackStore, MirrorEvent, MirrorOptions, MirrorStatus};
pub use search::{
    SearchError, SearchIndex, SearchIndexOptions, SearchLinkResult, SearchOptions, SearchResult,
    SearchSnapshot, SharedSearchIndex,
};

// Low-level codec
pub use codec::{
    decode_btree_node, decode_manifest, encode_and_hash, encode_btree_node, encode_manifest,
    try_decode_btree_node, CodecError,
};
pub use hash::{cid, sha256, verify};

// Store
pub use store::{MemoryStore, Store, StoreError, StoreStats};
pub use types::{
    from_hex, to_hex, BTreeNode, ChunkManifest, ChunkRef, Cid, Codec, Hash, Link, LinkType,
    MalformedHash, NodeEntry,
};
pub use nhash::{is_nhash, nhash_decode, nhash_encode, NHashError};
