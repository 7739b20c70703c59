//! Key encoding for B-tree nodes
//!
//! Node keys are stored NUL-separated inside a single string, so the
//! encoded form must never contain a NUL byte. The escaping encoder maps
//!
//! - `0x00` to `0x01 0x01`
//! - `0x01` to `0x01 0x02`
//!
//! and leaves every other byte alone. The mapping is a prefix-free code that
//! is monotone in the byte value, so escaped keys compare bytewise in the
//! same order as the original keys.

use std::fmt::Debug;

const ESCAPE: u8 = 0x01;

/// Errors from decoding an escaped key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid escape sequence at byte {0}")]
    InvalidEscape(usize),
    #[error("truncated escape sequence at end of key")]
    TruncatedEscape,
    #[error("unescaped NUL byte at {0}")]
    RawSeparator(usize),
}

/// Maps application keys to node keys and back
///
/// Implementations must be injective and order-preserving, and encoded keys
/// must not contain NUL.
pub trait KeyEncoder: Send + Sync + Debug {
    fn encode(&self, key: &str) -> String;
    fn decode(&self, encoded: &str) -> Result<String, KeyError>;
}

/// Default encoder, see [`escape_key`]
#[derive(Debug, Clone, Copy, Default)]
pub struct EscapingKeyEncoder;

impl KeyEncoder for EscapingKeyEncoder {
    fn encode(&self, key: &str) -> String {
        escape_key(key)
    }

    fn decode(&self, encoded: &str) -> Result<String, KeyError> {
        unescape_key(encoded)
    }
}

/// Escape an application key for use inside a node
pub fn escape_key(key: &str) -> String {
    if !key.bytes().any(|b| b <= ESCAPE) {
        return key.to_string();
    }

    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        match c {
            '\0' => out.push_str("\u{1}\u{1}"),
            '\u{1}' => out.push_str("\u{1}\u{2}"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape_key`]
pub fn unescape_key(encoded: &str) -> Result<String, KeyError> {
    if !encoded.bytes().any(|b| b <= ESCAPE) {
        return Ok(encoded.to_string());
    }

    let mut out = String::with_capacity(encoded.len());
    let mut chars = encoded.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\0' => return Err(KeyError::RawSeparator(i)),
            '\u{1}' => {
                let (_, next) = chars.next().ok_or(KeyError::TruncatedEscape)?;
                match next {
                    '\u{1}' => out.push('\0'),
                    '\u{2}' => out.push('\u{1}'),
                    _ => return Err(KeyError::InvalidEscape(i)),
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
