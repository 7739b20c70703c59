//! HashTree - content-addressed types
//!
//! Core principle: every blob and every tree node is stored by
//! SHA256(bytes) -> bytes. Parents reference children only through links.

use std::collections::HashMap;

/// Link type - distinguishes blobs, chunked files, and directories
/// Uses small integer values for efficient MessagePack encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum LinkType {
    /// Raw blob data (not a tree node)
    #[default]
    Blob = 0,
    /// Chunked file (points at a chunk manifest)
    File = 1,
    /// Directory (points at the root node of a B-tree)
    Dir = 2,
}

impl LinkType {
    /// Create from u8 value
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LinkType::Blob),
            1 => Some(LinkType::File),
            2 => Some(LinkType::Dir),
            _ => None,
        }
    }

    /// Check if this type represents a structured node (File or Dir)
    pub fn is_tree(&self) -> bool {
        matches!(self, LinkType::File | LinkType::Dir)
    }
}

/// Serialization of the bytes a CID names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Codec {
    /// Opaque bytes
    Raw = 0,
    /// MessagePack-encoded node or manifest
    MessagePack = 1,
}

impl Codec {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Codec::Raw),
            1 => Some(Codec::MessagePack),
            _ => None,
        }
    }
}

/// 32-byte SHA256 hash used as content address
pub type Hash = [u8; 32];

/// Hex text that does not name a 32-byte hash
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedHash {
    #[error("malformed hash: odd-length hex string ({0} chars)")]
    OddLength(usize),
    #[error("malformed hash: invalid hex character {character:?} at index {index}")]
    InvalidCharacter { character: char, index: usize },
    #[error("malformed hash: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Convert hash to lowercase hex string
pub fn to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// Convert hex string to hash
pub fn from_hex(hex_str: &str) -> Result<Hash, MalformedHash> {
    let bytes = hex::decode(hex_str).map_err(|e| match e {
        hex::FromHexError::OddLength => MalformedHash::OddLength(hex_str.len()),
        hex::FromHexError::InvalidHexCharacter { c, index } => MalformedHash::InvalidCharacter {
            character: c,
            index,
        },
        hex::FromHexError::InvalidStringLength => MalformedHash::InvalidLength(hex_str.len() / 2),
    })?;
    if bytes.len() != 32 {
        return Err(MalformedHash::InvalidLength(bytes.len()));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

/// Short hex prefix for log lines
pub(crate) fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..6])
}

/// Content identifier: hash plus a small header
///
/// The header describes what the hash names (blob, manifest, B-tree root),
/// how many bytes or entries sit behind it, and optionally its codec.
/// Textual form is produced by [`crate::nhash::nhash_encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cid {
    /// SHA256 hash of the stored bytes
    pub hash: Hash,
    /// What kind of content the hash names
    pub kind: LinkType,
    /// Logical size: bytes for blobs and files, entry count for directories. 0 = unknown.
    pub size: u64,
    /// Optional codec tag
    pub codec: Option<Codec>,
}

impl Cid {
    pub fn new(hash: Hash, kind: LinkType, size: u64) -> Self {
        Self {
            hash,
            kind,
            size,
            codec: None,
        }
    }

    /// CID of a raw blob
    pub fn blob(hash: Hash, size: u64) -> Self {
        Self::new(hash, LinkType::Blob, size)
    }

    /// CID carrying only a hash (no header information)
    pub fn from_hash(hash: Hash) -> Self {
        Self::new(hash, LinkType::Blob, 0)
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = Some(codec);
        self
    }

    /// True when the header carries nothing beyond the hash
    pub fn is_bare(&self) -> bool {
        self.kind == LinkType::Blob && self.size == 0 && self.codec.is_none()
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", to_hex(&self.hash))
    }
}

/// A link to a child with optional metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// SHA256 hash of the child
    pub hash: Hash,
    /// Optional name (for directory entries)
    pub name: Option<String>,
    /// Size in bytes for blobs and files, entry count for directories
    pub size: u64,
    /// Type of content this link points to (Blob, File, or Dir)
    pub link_type: LinkType,
    /// Optional metadata (createdAt, mimeType, thumbnail, duration, etc.)
    pub meta: Option<HashMap<String, serde_json::Value>>,
}

impl Link {
    pub fn new(hash: Hash) -> Self {
        Self {
            hash,
            name: None,
            size: 0,
            link_type: LinkType::Blob,
            meta: None,
        }
    }

    /// Link to a raw blob of `size` bytes
    pub fn blob(hash: Hash, size: u64) -> Self {
        Self::new(hash).with_size(size)
    }

    /// Link built from a CID header
    pub fn from_cid(cid: &Cid) -> Self {
        Self::new(cid.hash)
            .with_size(cid.size)
            .with_link_type(cid.kind)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_link_type(mut self, link_type: LinkType) -> Self {
        self.link_type = link_type;
        self
    }

    pub fn with_meta(mut self, meta: HashMap<String, serde_json::Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Convert this link to a Cid
    pub fn to_cid(&self) -> Cid {
        let cid = Cid::new(self.hash, self.link_type, self.size);
        if self.link_type.is_tree() {
            cid.with_codec(Codec::MessagePack)
        } else {
            cid
        }
    }
}

/// One (escaped key, link) pair inside a B-tree node
///
/// In a leaf the link is the stored value. In an internal node the key is
/// the first key of the child subtree and the link points at the child node,
/// with `size` holding the number of entries below it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEntry {
    pub key: String,
    pub link: Link,
}

impl NodeEntry {
    pub fn new(key: impl Into<String>, link: Link) -> Self {
        Self {
            key: key.into(),
            link,
        }
    }
}

/// A B-tree node: entries sorted by escaped key, plus its height (0 = leaf)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BTreeNode {
    pub height: u8,
    pub entries: Vec<NodeEntry>,
}

impl BTreeNode {
    pub fn leaf(entries: Vec<NodeEntry>) -> Self {
        Self { height: 0, entries }
    }

    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    pub fn first_key(&self) -> Option<&str> {
        self.entries.first().map(|e| e.key.as_str())
    }

    /// Number of (key, value) pairs in the subtree rooted here
    pub fn subtree_len(&self) -> u64 {
        if self.is_leaf() {
            self.entries.len() as u64
        } else {
            self.entries.iter().map(|e| e.link.size).sum()
        }
    }
}

/// A stored chunk and its length in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub hash: Hash,
    pub size: u64,
}

/// Ordered list of chunks that reassemble one logical blob
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkManifest {
    pub chunks: Vec<ChunkRef>,
}

impl ChunkManifest {
    pub fn new(chunks: Vec<ChunkRef>) -> Self {
        Self { chunks }
    }

    /// Total length of the reassembled blob
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hex_empty() {
        let hash = [0u8; 32];
        assert_eq!(
            to_hex(&hash),
            "0000000000000000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn test_from_hex() {
        let hex = "00ff100000000000000000000000000000000000000000000000000000000000";
        let hash = from_hex(hex).unwrap();
        assert_eq!(hash[0], 0x00);
        assert_eq!(hash[1], 0xff);
        assert_eq!(hash[2], 0x10);
    }

    #[test]
    fn test_roundtrip() {
        let mut original = [0u8; 32];
        original[1] = 1;
        original[2] = 127;
        original[3] = 128;
        original[4] = 255;
        assert_eq!(from_hex(&to_hex(&original)).unwrap(), original);
    }

    #[test]
    fn test_from_hex_rejects_odd_length() {
        assert_eq!(from_hex("abc"), Err(MalformedHash::OddLength(3)));
    }

    #[test]
    fn test_from_hex_rejects_non_hex() {
        let bad = format!("zz{}", "0".repeat(62));
        assert!(matches!(
            from_hex(&bad),
            Err(MalformedHash::InvalidCharacter { character: 'z', index: 0 })
        ));
    }

    #[test]
    fn test_from_hex_rejects_wrong_length() {
        assert_eq!(from_hex("abcd"), Err(MalformedHash::InvalidLength(2)));
    }

    #[test]
    fn test_link_to_cid() {
        let link = Link::new([7u8; 32]).with_size(12).with_link_type(LinkType::File);
        let cid = link.to_cid();
        assert_eq!(cid.kind, LinkType::File);
        assert_eq!(cid.size, 12);
        assert_eq!(cid.codec, Some(Codec::MessagePack));
        assert_eq!(Link::from_cid(&cid).hash, link.hash);

        let blob = Link::blob([1u8; 32], 3).to_cid();
        assert_eq!(blob.codec, None);
    }

    #[test]
    fn test_subtree_len() {
        let leaf = BTreeNode::leaf(vec![
            NodeEntry::new("a", Link::new([1u8; 32])),
            NodeEntry::new("b", Link::new([2u8; 32])),
        ]);
        assert_eq!(leaf.subtree_len(), 2);
        assert_eq!(leaf.first_key(), Some("a"));

        let internal = BTreeNode {
            height: 1,
            entries: vec![
                NodeEntry::new("a", Link::new([3u8; 32]).with_size(10)),
                NodeEntry::new("m", Link::new([4u8; 32]).with_size(7)),
            ],
        };
        assert_eq!(internal.subtree_len(), 17);
    }

    #[test]
    fn test_manifest_total() {
        let manifest = ChunkManifest::new(vec![
            ChunkRef { hash: [0u8; 32], size: 4 },
            ChunkRef { hash: [1u8; 32], size: 2 },
        ]);
        assert_eq!(manifest.total_size(), 6);
        assert_eq!(manifest.len(), 2);
        assert!(ChunkManifest::default().is_empty());
    }
}
