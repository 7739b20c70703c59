//! Bech32-encoded content identifiers
//!
//! Similar to nostr's nip19 (npub, nevent), provides human-readable,
//! copy-pasteable identifiers for a [`Cid`].
//!
//! Layout of the bech32 payload (HRP `nhash`):
//! - a CID without header information is the bare 32 hash bytes
//! - otherwise a TLV list (type, length, value) in ascending type order,
//!   where fields equal to their default are omitted
//!
//! Every CID has exactly one textual form. Decoding rejects any string
//! that would not re-encode to itself.

use thiserror::Error;

use crate::types::{Cid, Codec, Hash, LinkType};

const HRP: &str = "nhash";

/// TLV type constants
mod tlv {
    /// 32-byte hash (required)
    pub const HASH: u8 = 0;
    /// 1-byte link type (omitted for blobs)
    pub const KIND: u8 = 1;
    /// Minimal big-endian size, 1..=8 bytes (omitted when 0)
    pub const SIZE: u8 = 2;
    /// 1-byte codec (omitted when absent)
    pub const CODEC: u8 = 3;
}

/// Errors for nhash encoding/decoding
#[derive(Debug, Error)]
pub enum NHashError {
    #[error("Bech32 error: {0}")]
    Bech32(String),
    #[error("Invalid prefix: expected {expected}, got {got}")]
    InvalidPrefix { expected: String, got: String },
    #[error("Invalid hash length: expected 32 bytes, got {0}")]
    InvalidHashLength(usize),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("TLV error: {0}")]
    TlvError(String),
    #[error("Non-canonical encoding: {0}")]
    NonCanonical(String),
    #[error("Unsupported CID: {0}")]
    UnsupportedCid(String),
}

/// Parse TLV-encoded data into (type, value) pairs, preserving order
fn parse_tlv(data: &[u8]) -> Result<Vec<(u8, &[u8])>, NHashError> {
    let mut result = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        if offset + 2 > data.len() {
            return Err(NHashError::TlvError("unexpected end of data".into()));
        }
        let t = data[offset];
        let l = data[offset + 1] as usize;
        offset += 2;

        if offset + l > data.len() {
            return Err(NHashError::TlvError(format!(
                "not enough data for type {}, need {} bytes",
                t, l
            )));
        }
        result.push((t, &data[offset..offset + l]));
        offset += l;
    }

    Ok(result)
}

fn push_tlv(out: &mut Vec<u8>, t: u8, value: &[u8]) {
    out.push(t);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

/// Big-endian bytes of `size` without leading zeros
fn minimal_be(size: u64) -> Vec<u8> {
    let bytes = size.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Encode bech32 with given prefix and data
/// Uses regular bech32 (not bech32m) for compatibility with nostr nip19
fn encode_bech32(hrp: &str, data: &[u8]) -> Result<String, NHashError> {
    use bech32::{Bech32, Hrp};

    let hrp = Hrp::parse(hrp).map_err(|e| NHashError::Bech32(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| NHashError::Bech32(e.to_string()))
}

/// Decode bech32 and return (hrp, data)
fn decode_bech32(s: &str) -> Result<(String, Vec<u8>), NHashError> {
    let (hrp, data) = bech32::decode(s).map_err(|e| NHashError::Bech32(e.to_string()))?;

    Ok((hrp.to_string().to_ascii_lowercase(), data))
}

/// Binary payload of a CID, before bech32
fn encode_payload(cid: &Cid) -> Vec<u8> {
    if cid.is_bare() {
        return cid.hash.to_vec();
    }

    let mut out = Vec::with_capacity(48);
    push_tlv(&mut out, tlv::HASH, &cid.hash);
    if cid.kind != LinkType::Blob {
        push_tlv(&mut out, tlv::KIND, &[cid.kind as u8]);
    }
    if cid.size != 0 {
        push_tlv(&mut out, tlv::SIZE, &minimal_be(cid.size));
    }
    if let Some(codec) = cid.codec {
        push_tlv(&mut out, tlv::CODEC, &[codec as u8]);
    }
    out
}

fn decode_payload(data: &[u8]) -> Result<Cid, NHashError> {
    if data.len() == 32 {
        let mut hash: Hash = [0u8; 32];
        hash.copy_from_slice(data);
        return Ok(Cid::from_hash(hash));
    }

    let fields = parse_tlv(data)?;
    let mut hash: Option<Hash> = None;
    let mut kind = LinkType::Blob;
    let mut size = 0u64;
    let mut codec = None;
    let mut last_type: Option<u8> = None;

    for (t, value) in fields {
        if let Some(prev) = last_type {
            if t <= prev {
                return Err(NHashError::NonCanonical(format!(
                    "TLV type {} follows type {}",
                    t, prev
                )));
            }
        }
        last_type = Some(t);

        match t {
            tlv::HASH => {
                if value.len() != 32 {
                    return Err(NHashError::InvalidHashLength(value.len()));
                }
                let mut h = [0u8; 32];
                h.copy_from_slice(value);
                hash = Some(h);
            }
            tlv::KIND => {
                let [v] = value else {
                    return Err(NHashError::TlvError("kind must be 1 byte".into()));
                };
                kind = LinkType::from_u8(*v)
                    .ok_or_else(|| NHashError::UnsupportedCid(format!("link type {}", v)))?;
                if kind == LinkType::Blob {
                    return Err(NHashError::NonCanonical("explicit blob kind".into()));
                }
            }
            tlv::SIZE => {
                if value.is_empty() || value.len() > 8 {
                    return Err(NHashError::TlvError(format!(
                        "size must be 1..=8 bytes, got {}",
                        value.len()
                    )));
                }
                if value[0] == 0 {
                    return Err(NHashError::NonCanonical("size has leading zero".into()));
                }
                size = value.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
            }
            tlv::CODEC => {
                let [v] = value else {
                    return Err(NHashError::TlvError("codec must be 1 byte".into()));
                };
                codec = Some(
                    Codec::from_u8(*v)
                        .ok_or_else(|| NHashError::UnsupportedCid(format!("codec {}", v)))?,
                );
            }
            other => {
                return Err(NHashError::UnsupportedCid(format!("header tag {}", other)));
            }
        }
    }

    let hash = hash.ok_or_else(|| NHashError::MissingField("hash".into()))?;
    let cid = Cid {
        hash,
        kind,
        size,
        codec,
    };
    if cid.is_bare() {
        return Err(NHashError::NonCanonical(
            "header-less CID must use the bare form".into(),
        ));
    }
    Ok(cid)
}

/// Encode a CID as an nhash string
pub fn nhash_encode(cid: &Cid) -> Result<String, NHashError> {
    encode_bech32(HRP, &encode_payload(cid))
}

/// Decode an nhash string
pub fn nhash_decode(code: &str) -> Result<Cid, NHashError> {
    let (prefix, data) = decode_bech32(code)?;

    if prefix != HRP {
        return Err(NHashError::InvalidPrefix {
            expected: HRP.into(),
            got: prefix,
        });
    }

    let cid = decode_payload(&data)?;

    // Catches the remaining alternate spellings: uppercase, bech32m checksum
    if nhash_encode(&cid)? != code {
        return Err(NHashError::NonCanonical(
            "string differs from the canonical encoding".into(),
        ));
    }

    Ok(cid)
}

/// Check if a string is an nhash
pub fn is_nhash(value: &str) -> bool {
    value.starts_with("nhash1")
}
