//! A hashtree repository on disk: configured blob store, optional remote
//! mirror, and the log of roots that survives between invocations.

use anyhow::{Context, Result};
use hashtree_blossom::{BlossomClient, BlossomStore};
use hashtree_config::{get_keys_path, Config, StorageBackend};
use hashtree_core::{
    nhash_decode, nhash_encode, Cid, FallbackStore, HashTree, HashTreeConfig, Link, LinkType,
    MirrorOptions, MirrorStatus, SearchIndex, SearchIndexOptions, SearchOptions, SearchResult,
    Store, StoreStats,
};
use hashtree_fs::FsBlobStore;
use hashtree_lmdb::{LmdbBlobStore, DEFAULT_MAP_SIZE};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::keys::load_or_create_keys_at;

pub type DynStore = Arc<dyn Store>;
type Mirrored = FallbackStore<DynStore, BlossomStore>;

const ROOTS_FILE: &str = "roots";
const JOURNAL_FILE: &str = "mirror-journal.json";

/// Open the local backend selected in config
fn open_local(config: &Config, data_dir: &Path) -> Result<DynStore> {
    let max_bytes = config.storage.max_bytes();
    match config.storage.backend {
        StorageBackend::Fs => {
            let base = data_dir.join("blobs");
            let store = match &config.storage.origin {
                Some(origin) => FsBlobStore::for_origin(&base, origin),
                None => FsBlobStore::new(&base),
            }
            .context("Failed to open blob directory")?;
            if let Some(max) = max_bytes {
                store.set_max_bytes(max);
            }
            Ok(Arc::new(store))
        }
        StorageBackend::Lmdb => {
            let map_size = max_bytes
                .map(|max| usize::try_from(max).unwrap_or(usize::MAX))
                .unwrap_or(DEFAULT_MAP_SIZE);
            let store = LmdbBlobStore::with_map_size(data_dir.join("lmdb"), map_size)
                .context("Failed to open LMDB environment")?;
            Ok(Arc::new(store))
        }
    }
}

pub struct Repo {
    data_dir: PathBuf,
    config: Config,
    local: DynStore,
    mirror: Option<Arc<Mirrored>>,
    tree: HashTree<DynStore>,
    /// Last root written to the roots file
    recorded: Mutex<Option<Cid>>,
}

impl Repo {
    /// Open (or create) the repository in `data_dir`.
    ///
    /// When blossom servers are configured, reads fall through to them and,
    /// with `mirror.enabled`, local writes are mirrored in the background.
    pub async fn open(config: &Config, data_dir: &Path) -> Result<Self> {
        Self::open_with_keys(config, data_dir, &get_keys_path()).await
    }

    /// [`open`](Self::open) with the signing key taken from `keys_path`
    pub async fn open_with_keys(config: &Config, data_dir: &Path, keys_path: &Path) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;
        let local = open_local(config, data_dir)?;

        let (store, mirror): (DynStore, _) = if config.blossom.is_configured() {
            let (keys, generated) = load_or_create_keys_at(keys_path, None)?;
            if generated {
                info!("generated a new signing key");
            }
            let client = BlossomClient::new(keys)
                .with_read_servers(config.blossom.all_read_servers())
                .with_write_servers(config.blossom.all_write_servers())
                .with_timeout(config.blossom.timeout());
            let options = MirrorOptions {
                mirror_writes: config.mirror.enabled,
                max_attempts: config.mirror.max_attempts,
                initial_backoff: config.mirror.backoff(),
                ..Default::default()
            }
            .with_journal(data_dir.join(JOURNAL_FILE));
            let mirror = Arc::new(FallbackStore::new(
                Arc::new(local.clone()),
                Arc::new(BlossomStore::new(client)),
                options,
            ));
            if config.mirror.enabled {
                mirror.resume_pending();
            }
            let store: DynStore = mirror.clone();
            (store, Some(mirror))
        } else {
            (local.clone(), None)
        };

        let tree_config = HashTreeConfig::new(Arc::new(store))
            .with_order(config.tree.order)
            .with_chunk_size(config.tree.chunk_size);
        let roots = read_roots(&data_dir.join(ROOTS_FILE))?;
        let tree = match roots.last() {
            Some(root) => {
                debug!("opening root {}", root);
                HashTree::open(tree_config, *root)
                    .await
                    .context("Failed to open the current root")?
            }
            None => HashTree::new(tree_config).await?,
        };

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config: config.clone(),
            local,
            mirror,
            tree,
            recorded: Mutex::new(roots.last().copied()),
        })
    }

    pub fn tree(&self) -> &HashTree<DynStore> {
        &self.tree
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub async fn root(&self) -> Cid {
        self.tree.root().await
    }

    /// Every committed root, oldest first
    pub fn roots(&self) -> Result<Vec<Cid>> {
        read_roots(&self.data_dir.join(ROOTS_FILE))
    }

    fn record(&self, root: &Cid) -> Result<()> {
        let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        if recorded.as_ref() == Some(root) {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_dir.join(ROOTS_FILE))
            .context("Failed to open roots file")?;
        writeln!(file, "{}", nhash_encode(root)?)?;
        *recorded = Some(*root);
        Ok(())
    }

    /// Store the file at `path` and link it under `key`
    pub async fn add_file(&self, key: &str, path: &Path) -> Result<(Cid, Link)> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let link = self.tree.put_reader(file).await?.with_name(key);
        let root = self.set(key, link.clone()).await?;
        Ok((root, link))
    }

    pub async fn set(&self, key: &str, link: Link) -> Result<Cid> {
        let root = self.tree.set(key, link).await?;
        self.record(&root)?;
        Ok(root)
    }

    pub async fn delete(&self, key: &str) -> Result<Cid> {
        let root = self.tree.delete(key).await?;
        self.record(&root)?;
        Ok(root)
    }

    /// Rank paths of the current root against `query`
    pub async fn search(
        &self,
        query: &str,
        limit: Option<usize>,
        link_type: Option<LinkType>,
    ) -> Result<Vec<SearchResult>> {
        let options = SearchIndexOptions {
            case_fold: self.config.search.case_fold,
            min_term_length: self.config.search.min_term_length,
        };
        let mut index = SearchIndex::new(self.tree.tree().clone(), options);
        index.index(&self.root().await).await?;
        Ok(index.search(
            query,
            &SearchOptions {
                limit: Some(limit.unwrap_or(self.config.search.max_results)),
                link_type,
            },
        ))
    }

    /// Blob count and bytes held locally
    pub async fn usage(&self) -> StoreStats {
        self.local.stats().await
    }

    pub fn mirror_status(&self) -> Option<MirrorStatus> {
        self.mirror.as_ref().map(|m| m.status())
    }

    /// Give background mirroring up to `mirror.flush_timeout` to settle.
    /// Unfinished uploads stay in the journal for the next run. Returns the
    /// final status when a mirror is configured.
    pub async fn close(self) -> Option<MirrorStatus> {
        let mirror = self.mirror?;
        if !mirror.flush_within(self.config.mirror.flush_timeout()).await {
            debug!("mirror still busy; leaving the rest to the journal");
        }
        let status = mirror.status();
        mirror.shutdown();
        Some(status)
    }
}

fn read_roots(path: &Path) -> Result<Vec<Cid>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context("Failed to read roots file"),
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| nhash_decode(line).with_context(|| format!("Corrupt roots entry {:?}", line)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(backend: StorageBackend) -> Config {
        let mut config = Config::default();
        config.storage.backend = backend;
        config.storage.max_size_gb = 1;
        config.tree.order = 8;
        config.tree.chunk_size = 64;
        config
    }

    async fn round_trip(backend: StorageBackend) {
        let temp = TempDir::new().unwrap();
        let config = test_config(backend);
        let source = temp.path().join("notes.txt");
        let contents: Vec<u8> = (0..300u32).map(|i| (i % 97) as u8).collect();
        fs::write(&source, &contents).unwrap();

        let data_dir = temp.path().join("data");
        let root = {
            let repo = Repo::open(&config, &data_dir).await.unwrap();
            let (_, link) = repo.add_file("notes.txt", &source).await.unwrap();
            assert_eq!(link.link_type, LinkType::File);
            repo.add_file("copy.txt", &source).await.unwrap();
            let root = repo.delete("copy.txt").await.unwrap();
            // deleting a missing key does not add a root
            repo.delete("copy.txt").await.unwrap();
            assert_eq!(repo.roots().unwrap().len(), 3);
            assert!(repo.usage().await.count > 0);
            assert_eq!(repo.close().await, None);
            root
        };

        let repo = Repo::open(&config, &data_dir).await.unwrap();
        assert_eq!(repo.root().await, root);
        let link = repo.tree().get("notes.txt").await.unwrap().unwrap();
        assert_eq!(repo.tree().read_file(&link).await.unwrap(), contents);
        assert_eq!(
            repo.tree().read_range(&link, 250, 100).await.unwrap(),
            &contents[250..]
        );
    }

    #[tokio::test]
    async fn test_fs_repo_persists_root() {
        round_trip(StorageBackend::Fs).await;
    }

    #[tokio::test]
    async fn test_lmdb_repo_persists_root() {
        round_trip(StorageBackend::Lmdb).await;
    }

    #[tokio::test]
    async fn test_origin_isolation() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("a.txt");
        fs::write(&source, b"per origin").unwrap();

        let mut config = test_config(StorageBackend::Fs);
        config.storage.origin = Some("https://one.example".to_string());
        let repo = Repo::open(&config, temp.path()).await.unwrap();
        repo.add_file("a.txt", &source).await.unwrap();
        assert!(repo.usage().await.count > 0);
        drop(repo);

        // a different origin sees none of those blobs
        config.storage.origin = Some("https://two.example".to_string());
        let local = open_local(&config, temp.path()).unwrap();
        assert_eq!(local.stats().await.count, 0);
    }

    #[tokio::test]
    async fn test_search_uses_current_root() {
        let temp = TempDir::new().unwrap();
        let config = test_config(StorageBackend::Fs);
        let repo = Repo::open(&config, temp.path()).await.unwrap();
        let source = temp.path().join("clip");
        fs::write(&source, b"frames").unwrap();
        for key in ["videos/cat.mp4", "videos/dog.mp4", "music/cat-song.mp3"] {
            repo.add_file(key, &source).await.unwrap();
        }

        let results = repo.search("cat", None, None).await.unwrap();
        let paths: Vec<&str> = results.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["videos/cat.mp4", "music/cat-song.mp3"]);
        assert_eq!(repo.search("cat", Some(1), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_does_not_wait_out_offline_mirror() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(StorageBackend::Fs);
        config.blossom.servers = vec!["http://127.0.0.1:1".to_string()];
        config.blossom.timeout_ms = 500;
        config.mirror.enabled = true;
        config.mirror.backoff_ms = 60_000;
        config.mirror.flush_timeout_ms = 200;
        let keys_path = temp.path().join("keys");
        let data_dir = temp.path().join("data");
        let source = temp.path().join("big.bin");
        let contents: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &contents).unwrap();

        let repo = Repo::open_with_keys(&config, &data_dir, &keys_path).await.unwrap();
        repo.add_file("big.bin", &source).await.unwrap();
        let started = std::time::Instant::now();
        let status = repo.close().await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert!(status.outstanding() > 0);
        assert!(data_dir.join(JOURNAL_FILE).exists());

        // the next run picks the uploads back up from the journal
        config.mirror.enabled = false;
        let repo = Repo::open_with_keys(&config, &data_dir, &keys_path).await.unwrap();
        assert_eq!(repo.mirror_status().unwrap().outstanding(), status.outstanding());
    }

    #[test]
    fn test_corrupt_roots_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(ROOTS_FILE);
        fs::write(&path, "nhash1garbage\n").unwrap();
        assert!(read_roots(&path).is_err());
        assert!(read_roots(&temp.path().join("missing")).unwrap().is_empty());
    }
}
