//! Shared configuration for hashtree tools
//!
//! Reads from ~/.hashtree/config.toml. Every field has a default, so a
//! partial (or empty) file is valid.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level config structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub blossom: BlossomConfig,
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
}

/// Storage backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Filesystem storage (default) - stores in {data_dir}/blobs/{prefix}/{hash}
    #[default]
    Fs,
    /// LMDB environment in {data_dir}/lmdb
    Lmdb,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend: "fs" (default) or "lmdb"
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// 0 means unlimited
    #[serde(default = "default_max_size_gb")]
    pub max_size_gb: u64,
    /// Keep this origin's blobs in their own directory (fs backend)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: default_data_dir(),
            max_size_gb: default_max_size_gb(),
            origin: None,
        }
    }
}

impl StorageConfig {
    /// Storage quota in bytes
    pub fn max_bytes(&self) -> Option<u64> {
        match self.max_size_gb {
            0 => None,
            gb => Some(gb.saturating_mul(1024 * 1024 * 1024)),
        }
    }

    /// Data directory, honouring HTREE_DATA_DIR
    pub fn data_dir(&self) -> PathBuf {
        match std::env::var("HTREE_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => PathBuf::from(&self.data_dir),
        }
    }
}

fn default_data_dir() -> String {
    get_hashtree_dir()
        .join("data")
        .to_string_lossy()
        .to_string()
}

fn default_max_size_gb() -> u64 {
    10
}

/// File server (blossom) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlossomConfig {
    /// Legacy servers field (both read and write)
    #[serde(default)]
    pub servers: Vec<String>,
    /// Read-only file servers
    #[serde(default)]
    pub read_servers: Vec<String>,
    /// Write-enabled file servers
    #[serde(default)]
    pub write_servers: Vec<String>,
    /// Per-server request timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BlossomConfig {
    fn default() -> Self {
        Self {
            servers: vec![],
            read_servers: vec![],
            write_servers: vec![],
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

/// Concatenate server lists, dropping repeats but keeping the first position
fn merge_servers(lists: [&[String]; 2]) -> Vec<String> {
    let mut servers: Vec<String> = Vec::new();
    for server in lists.into_iter().flatten() {
        let server = server.trim_end_matches('/');
        if !servers.iter().any(|s| s == server) {
            servers.push(server.to_string());
        }
    }
    servers
}

impl BlossomConfig {
    /// Get all read servers (legacy + read_servers), in failover order
    pub fn all_read_servers(&self) -> Vec<String> {
        merge_servers([self.servers.as_slice(), self.read_servers.as_slice()])
    }

    /// Get all write servers (legacy + write_servers), in failover order
    pub fn all_write_servers(&self) -> Vec<String> {
        merge_servers([self.servers.as_slice(), self.write_servers.as_slice()])
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_configured(&self) -> bool {
        !self.all_read_servers().is_empty() || !self.all_write_servers().is_empty()
    }
}

/// B-tree and chunking parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    #[serde(default = "default_order")]
    pub order: usize,
    /// Largest blob stored without chunking, in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            order: default_order(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_order() -> usize {
    32
}

fn default_chunk_size() -> usize {
    2 * 1024 * 1024
}

/// Search index configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_true")]
    pub case_fold: bool,
    #[serde(default = "default_min_term_length")]
    pub min_term_length: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            case_fold: true,
            min_term_length: default_min_term_length(),
            max_results: default_max_results(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_min_term_length() -> usize {
    2
}

fn default_max_results() -> usize {
    20
}

/// Background remote mirroring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Mirror local writes to the blossom write servers
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// How long a command waits for queued uploads before exiting; the
    /// rest resume from the journal on the next run
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_flush_timeout_ms() -> u64 {
    5000
}

impl MirrorConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load from an explicit path, writing defaults there if it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.tree.order < 4 {
            bail!("tree.order must be at least 4, got {}", self.tree.order);
        }
        if self.tree.chunk_size == 0 {
            bail!("tree.chunk_size must be positive");
        }
        if self.mirror.enabled && self.blossom.all_write_servers().is_empty() {
            bail!("mirror.enabled requires at least one blossom write server");
        }
        Ok(())
    }
}

/// Get the hashtree directory (~/.hashtree)
pub fn get_hashtree_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HTREE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hashtree")
}

/// Get the config file path (~/.hashtree/config.toml)
pub fn get_config_path() -> PathBuf {
    get_hashtree_dir().join("config.toml")
}

/// Get the keys file path (~/.hashtree/keys)
pub fn get_keys_path() -> PathBuf {
    get_hashtree_dir().join("keys")
}

/// A stored key entry from the keys file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    /// The nsec or hex secret key
    pub secret: String,
    /// Optional alias/petname
    pub alias: Option<String>,
}

/// Parse the keys file content into key entries
/// Format: `nsec1... [alias]` or `hex... [alias]` per line
/// Lines starting with # are comments
pub fn parse_keys_file(content: &str) -> Vec<KeyEntry> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once(char::is_whitespace) {
            Some((secret, alias)) => KeyEntry {
                secret: secret.to_string(),
                alias: Some(alias.trim().to_string()),
            },
            None => KeyEntry {
                secret: line.to_string(),
                alias: None,
            },
        })
        .collect()
}

/// Read and parse keys file, returning the first key's secret
/// Returns None if file doesn't exist or is empty
pub fn read_first_key() -> Option<String> {
    let content = fs::read_to_string(get_keys_path()).ok()?;
    parse_keys_file(&content).into_iter().next().map(|e| e.secret)
}

/// Look up a key by alias, falling back to the first entry
pub fn read_key(alias: Option<&str>) -> Option<String> {
    let content = fs::read_to_string(get_keys_path()).ok()?;
    let entries = parse_keys_file(&content);
    match alias {
        Some(alias) => entries
            .into_iter()
            .find(|e| e.alias.as_deref() == Some(alias))
            .map(|e| e.secret),
        None => entries.into_iter().next().map(|e| e.secret),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.backend, StorageBackend::Fs);
        assert_eq!(config.tree.order, 32);
        assert_eq!(config.tree.chunk_size, 2 * 1024 * 1024);
        assert!(config.search.case_fold);
        assert!(!config.mirror.enabled);
        assert_eq!(config.mirror.flush_timeout(), Duration::from_secs(5));
        assert!(!config.blossom.is_configured());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[blossom]
write_servers = ["https://custom.server"]

[tree]
order = 8
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.blossom.write_servers, vec!["https://custom.server"]);
        assert!(config.blossom.read_servers.is_empty());
        assert_eq!(config.blossom.timeout_ms, 10_000);
        assert_eq!(config.tree.order, 8);
        assert_eq!(config.tree.chunk_size, 2 * 1024 * 1024);
    }

    #[test]
    fn test_all_servers_keep_order() {
        let config = BlossomConfig {
            servers: vec!["https://legacy.server".to_string()],
            read_servers: vec![
                "https://b.server/".to_string(),
                "https://legacy.server".to_string(),
                "https://a.server".to_string(),
            ],
            write_servers: vec!["https://upload.server".to_string()],
            ..Default::default()
        };

        assert_eq!(
            config.all_read_servers(),
            vec!["https://legacy.server", "https://b.server", "https://a.server"]
        );
        assert_eq!(
            config.all_write_servers(),
            vec!["https://legacy.server", "https://upload.server"]
        );
    }

    #[test]
    fn test_storage_backend_lmdb() {
        let toml = r#"
[storage]
backend = "lmdb"
max_size_gb = 0
origin = "https://example.com"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Lmdb);
        assert_eq!(config.storage.max_bytes(), None);
        assert_eq!(config.storage.origin.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn test_max_bytes() {
        let storage = StorageConfig {
            max_size_gb: 2,
            ..Default::default()
        };
        assert_eq!(storage.max_bytes(), Some(2 * 1024 * 1024 * 1024));
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.tree.order = 3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mirror.enabled = true;
        assert!(config.validate().is_err());
        config.blossom.servers = vec!["https://x.server".to_string()];
        config.validate().unwrap();
    }

    #[test]
    fn test_load_writes_defaults_and_round_trips() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());

        let mut edited = config.clone();
        edited.search.max_results = 5;
        edited.mirror.backoff_ms = 50;
        edited.storage.origin = Some("origin-a".to_string());
        edited.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), edited);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[tree]\norder = 2\n").unwrap();
        assert!(Config::load_from(&path).is_err());

        fs::write(&path, "[tree\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_parse_keys_file() {
        let content = r#"
nsec1abc123 self
# comment line
nsec1def456   work laptop

nsec1ghi789
"#;
        let entries = parse_keys_file(content);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].secret, "nsec1abc123");
        assert_eq!(entries[0].alias, Some("self".to_string()));
        assert_eq!(entries[1].secret, "nsec1def456");
        assert_eq!(entries[1].alias, Some("work laptop".to_string()));
        assert_eq!(entries[2].secret, "nsec1ghi789");
        assert_eq!(entries[2].alias, None);
    }
}
