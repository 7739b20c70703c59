//! MessagePack encoding/decoding for B-tree nodes and chunk manifests
//!
//! Blobs are stored raw (not wrapped) for efficiency.
//! Structured values are MessagePack-encoded.
//!
//! **Determinism:** Unlike CBOR, MessagePack doesn't have a built-in canonical encoding.
//! We ensure deterministic output by:
//! 1. Using fixed struct field order (alphabetical, via serde declaration order)
//! 2. Converting HashMap metadata to BTreeMap before encoding (sorted keys)
//!
//! Format uses short keys for compact encoding:
//! - d: depth of a B-tree node (0 = leaf)
//! - k: escaped keys of a node, joined by NUL
//! - l: links array
//! - c: chunks array (manifest)
//! - h: hash (in link / chunk)
//! - m: metadata (in link, optional)
//! - n: name (in link, optional)
//! - s: size (in link / chunk / manifest total)
//! - t: type (in link, 0 = Blob, 1 = File, 2 = Dir)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::hash::sha256;
use crate::types::{BTreeNode, ChunkManifest, ChunkRef, Hash, Link, LinkType, NodeEntry};

/// Separator between keys in a node's key block. Escaped keys never contain it.
pub(crate) const KEY_SEPARATOR: char = '\0';

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid link type: {0}")]
    InvalidLinkType(u8),
    #[error("MessagePack encoding error: {0}")]
    MsgpackEncode(String),
    #[error("MessagePack decoding error: {0}")]
    MsgpackDecode(String),
    #[error("Invalid hash length: expected 32, got {0}")]
    InvalidHashLength(usize),
    #[error("Node has {keys} keys but {links} links")]
    KeyCountMismatch { keys: usize, links: usize },
    #[error("Node keys not strictly ascending at index {0}")]
    KeysNotAscending(usize),
    #[error("Key contains the separator byte")]
    KeyContainsSeparator,
    #[error("Manifest size mismatch: declared {declared}, chunks sum to {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
}

/// Wire format for a link (compact keys)
/// Fields are ordered alphabetically for canonical encoding: h, m?, n?, s, t
#[derive(Serialize, Deserialize)]
struct WireLink {
    /// Hash (required) - use serde_bytes for proper MessagePack binary encoding
    #[serde(with = "serde_bytes")]
    h: Vec<u8>,
    /// Metadata (optional) - uses BTreeMap for deterministic key ordering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    m: Option<BTreeMap<String, serde_json::Value>>,
    /// Name (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    n: Option<String>,
    /// Size (required)
    s: u64,
    /// Link type (0 = Blob, 1 = File, 2 = Dir)
    #[serde(default)]
    t: u8,
}

/// Wire format for a B-tree node
/// Fields are ordered alphabetically for canonical encoding: d, k, l
#[derive(Serialize, Deserialize)]
struct WireNode {
    /// Height (0 = leaf)
    d: u8,
    /// Escaped keys joined by NUL
    k: String,
    /// One link per key
    l: Vec<WireLink>,
}

/// Wire format for a chunk reference
#[derive(Serialize, Deserialize)]
struct WireChunk {
    #[serde(with = "serde_bytes")]
    h: Vec<u8>,
    s: u64,
}

/// Wire format for a chunk manifest
/// Fields are ordered alphabetically for canonical encoding: c, s
#[derive(Serialize, Deserialize)]
struct WireManifest {
    /// Chunks in order
    c: Vec<WireChunk>,
    /// Total size
    s: u64,
}

fn hash_from_slice(bytes: &[u8]) -> Result<Hash, CodecError> {
    if bytes.len() != 32 {
        return Err(CodecError::InvalidHashLength(bytes.len()));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(bytes);
    Ok(hash)
}

fn to_wire_link(link: &Link) -> WireLink {
    WireLink {
        h: link.hash.to_vec(),
        // Convert HashMap to BTreeMap for deterministic key ordering
        m: link
            .meta
            .as_ref()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        n: link.name.clone(),
        s: link.size,
        t: link.link_type as u8,
    }
}

fn from_wire_link(wl: WireLink) -> Result<Link, CodecError> {
    let link_type = LinkType::from_u8(wl.t).ok_or(CodecError::InvalidLinkType(wl.t))?;
    Ok(Link {
        hash: hash_from_slice(&wl.h)?,
        name: wl.n,
        size: wl.s,
        link_type,
        // Convert BTreeMap back to HashMap for the public API
        meta: wl.m.map(|m| m.into_iter().collect::<HashMap<_, _>>()),
    })
}

/// Encode a B-tree node to MessagePack
pub fn encode_btree_node(node: &BTreeNode) -> Result<Vec<u8>, CodecError> {
    if node
        .entries
        .iter()
        .any(|e| e.key.contains(KEY_SEPARATOR))
    {
        return Err(CodecError::KeyContainsSeparator);
    }

    let keys: Vec<&str> = node.entries.iter().map(|e| e.key.as_str()).collect();
    let wire = WireNode {
        d: node.height,
        k: keys.join("\0"),
        l: node.entries.iter().map(|e| to_wire_link(&e.link)).collect(),
    };

    rmp_serde::to_vec_named(&wire).map_err(|e| CodecError::MsgpackEncode(e.to_string()))
}

/// Decode MessagePack to a B-tree node
pub fn decode_btree_node(data: &[u8]) -> Result<BTreeNode, CodecError> {
    let wire: WireNode =
        rmp_serde::from_slice(data).map_err(|e| CodecError::MsgpackDecode(e.to_string()))?;

    // An empty key block means zero entries, unless there is exactly one link
    // (a single empty key)
    let keys: Vec<&str> = if wire.k.is_empty() && wire.l.is_empty() {
        Vec::new()
    } else {
        wire.k.split(KEY_SEPARATOR).collect()
    };

    if keys.len() != wire.l.len() {
        return Err(CodecError::KeyCountMismatch {
            keys: keys.len(),
            links: wire.l.len(),
        });
    }

    for (i, pair) in keys.windows(2).enumerate() {
        if pair[0] >= pair[1] {
            return Err(CodecError::KeysNotAscending(i + 1));
        }
    }

    let mut entries = Vec::with_capacity(keys.len());
    for (key, wl) in keys.into_iter().zip(wire.l) {
        entries.push(NodeEntry::new(key, from_wire_link(wl)?));
    }

    Ok(BTreeNode {
        height: wire.d,
        entries,
    })
}

/// Encode a B-tree node and compute its hash
pub fn encode_and_hash(node: &BTreeNode) -> Result<(Vec<u8>, Hash), CodecError> {
    let data = encode_btree_node(node)?;
    let hash = sha256(&data);
    Ok((data, hash))
}

/// Try to decode data as a B-tree node
/// Returns Some(BTreeNode) if valid, None otherwise
pub fn try_decode_btree_node(data: &[u8]) -> Option<BTreeNode> {
    decode_btree_node(data).ok()
}

/// Encode a chunk manifest to MessagePack
pub fn encode_manifest(manifest: &ChunkManifest) -> Result<Vec<u8>, CodecError> {
    let wire = WireManifest {
        c: manifest
            .chunks
            .iter()
            .map(|c| WireChunk {
                h: c.hash.to_vec(),
                s: c.size,
            })
            .collect(),
        s: manifest.total_size(),
    };

    rmp_serde::to_vec_named(&wire).map_err(|e| CodecError::MsgpackEncode(e.to_string()))
}

/// Decode MessagePack to a chunk manifest
pub fn decode_manifest(data: &[u8]) -> Result<ChunkManifest, CodecError> {
    let wire: WireManifest =
        rmp_serde::from_slice(data).map_err(|e| CodecError::MsgpackDecode(e.to_string()))?;

    let chunks = wire
        .c
        .into_iter()
        .map(|c| {
            Ok(ChunkRef {
                hash: hash_from_slice(&c.h)?,
                size: c.s,
            })
        })
        .collect::<Result<Vec<_>, CodecError>>()?;

    let manifest = ChunkManifest::new(chunks);
    let actual = manifest.total_size();
    if actual != wire.s {
        return Err(CodecError::SizeMismatch {
            declared: wire.s,
            actual,
        });
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::to_hex;

    fn leaf(keys: &[&str]) -> BTreeNode {
        BTreeNode::leaf(
            keys.iter()
                .enumerate()
                .map(|(i, k)| {
                    NodeEntry::new(*k, Link::new([i as u8; 32]).with_size(i as u64 + 1))
                })
                .collect(),
        )
    }

    #[test]
    fn test_encode_decode_node() {
        let node = leaf(&["alpha", "beta", "gamma"]);
        let encoded = encode_btree_node(&node).unwrap();
        assert_eq!(decode_btree_node(&encoded).unwrap(), node);
    }

    #[test]
    fn test_empty_and_single_empty_key() {
        let empty = BTreeNode::default();
        let encoded = encode_btree_node(&empty).unwrap();
        assert!(decode_btree_node(&encoded).unwrap().entries.is_empty());

        let single = leaf(&[""]);
        let encoded = encode_btree_node(&single).unwrap();
        assert_eq!(decode_btree_node(&encoded).unwrap(), single);
    }

    #[test]
    fn test_deterministic_with_metadata() {
        let mut meta_a = HashMap::new();
        meta_a.insert("z".to_string(), serde_json::json!(1));
        meta_a.insert("a".to_string(), serde_json::json!("x"));
        let mut meta_b = HashMap::new();
        meta_b.insert("a".to_string(), serde_json::json!("x"));
        meta_b.insert("z".to_string(), serde_json::json!(1));

        let a = BTreeNode::leaf(vec![NodeEntry::new("k", Link::new([1u8; 32]).with_meta(meta_a))]);
        let b = BTreeNode::leaf(vec![NodeEntry::new("k", Link::new([1u8; 32]).with_meta(meta_b))]);

        let (_, ha) = encode_and_hash(&a).unwrap();
        let (_, hb) = encode_and_hash(&b).unwrap();
        assert_eq!(to_hex(&ha), to_hex(&hb));
    }

    #[test]
    fn test_rejects_unsorted_keys() {
        let wire = WireNode {
            d: 0,
            k: "b\0a".into(),
            l: vec![to_wire_link(&Link::new([0u8; 32])), to_wire_link(&Link::new([1u8; 32]))],
        };
        let bytes = rmp_serde::to_vec_named(&wire).unwrap();
        assert!(matches!(
            decode_btree_node(&bytes),
            Err(CodecError::KeysNotAscending(1))
        ));
    }

    #[test]
    fn test_rejects_count_mismatch() {
        let wire = WireNode {
            d: 0,
            k: "a\0b".into(),
            l: vec![to_wire_link(&Link::new([0u8; 32]))],
        };
        let bytes = rmp_serde::to_vec_named(&wire).unwrap();
        assert!(matches!(
            decode_btree_node(&bytes),
            Err(CodecError::KeyCountMismatch { keys: 2, links: 1 })
        ));
    }

    #[test]
    fn test_rejects_separator_in_key() {
        let node = leaf(&["a\0b"]);
        assert!(matches!(
            encode_btree_node(&node),
            Err(CodecError::KeyContainsSeparator)
        ));
    }

    #[test]
    fn test_raw_bytes_are_not_nodes() {
        assert!(try_decode_btree_node(b"hello world").is_none());
    }

    #[test]
    fn test_manifest_roundtrip() {
        let manifest = ChunkManifest::new(vec![
            ChunkRef { hash: [1u8; 32], size: 100 },
            ChunkRef { hash: [2u8; 32], size: 40 },
        ]);
        let encoded = encode_manifest(&manifest).unwrap();
        assert_eq!(decode_manifest(&encoded).unwrap(), manifest);
    }

    #[test]
    fn test_manifest_size_mismatch() {
        let wire = WireManifest {
            c: vec![WireChunk { h: vec![0u8; 32], s: 10 }],
            s: 11,
        };
        let bytes = rmp_serde::to_vec_named(&wire).unwrap();
        assert!(matches!(
            decode_manifest(&bytes),
            Err(CodecError::SizeMismatch { declared: 11, actual: 10 })
        ));
    }
}
