//! Identity used to sign remote requests

use anyhow::{Context, Result};
use hashtree_config::parse_keys_file;
use nostr::nips::nip19::ToBech32;
use nostr::Keys;
use std::fs;
use std::path::Path;

/// Parse an nsec or hex secret key
pub fn parse_secret(secret: &str) -> Result<Keys> {
    Keys::parse(secret).context("Invalid secret key (expected nsec or hex)")
}

/// Load the key with `alias` (or the first key) from a keys file,
/// generating one when the file is missing or empty.
/// Returns (keys, was_generated)
pub fn load_or_create_keys_at(path: &Path, alias: Option<&str>) -> Result<(Keys, bool)> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).context("Failed to read keys file"),
    };
    let entries = parse_keys_file(&content);

    if let Some(alias) = alias {
        let entry = entries
            .iter()
            .find(|e| e.alias.as_deref() == Some(alias))
            .with_context(|| format!("No key with alias '{}' in {}", alias, path.display()))?;
        return Ok((parse_secret(&entry.secret)?, false));
    }
    if let Some(entry) = entries.first() {
        return Ok((parse_secret(&entry.secret)?, false));
    }

    let keys = Keys::generate();
    let nsec = keys
        .secret_key()
        .to_bech32()
        .context("Failed to encode nsec")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{} default\n", nsec)).context("Failed to write keys file")?;
    Ok((keys, true))
}
