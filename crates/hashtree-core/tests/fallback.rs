//! Offline-first behaviour of a tree stored behind FallbackStore

use async_trait::async_trait;
use hashtree_core::{
    sha256, FallbackStore, Hash, HashTree, HashTreeConfig, MemoryStore, MirrorEvent,
    MirrorOptions, Store, StoreError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Remote stand-in that can go offline
#[derive(Default)]
struct Remote {
    inner: MemoryStore,
    offline: AtomicBool,
}

impl Remote {
    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::AllServersUnreachable("offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for Remote {
    async fn put_hashed(&self, hash: Hash, data: Vec<u8>) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.put_hashed(hash, data).await
    }

    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        self.inner.get(hash).await
    }

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.has(hash).await
    }

    async fn delete(&self, hash: &Hash) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.delete(hash).await
    }
}

fn quick_options() -> MirrorOptions {
    MirrorOptions {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_second_device_reads_through_remote() {
    let remote = Arc::new(Remote::default());

    let writer_store = Arc::new(FallbackStore::new(
        Arc::new(MemoryStore::new()),
        remote.clone(),
        quick_options(),
    ));
    let config = HashTreeConfig::new(writer_store.clone())
        .with_order(8)
        .with_chunk_size(32);
    let writer = HashTree::new(config).await.unwrap();
    for i in 0..40 {
        writer
            .add(&format!("doc{:02}", i), format!("contents of {}", i).as_bytes())
            .await
            .unwrap();
    }
    let big: Vec<u8> = (0..200u8).collect();
    writer.add("big.bin", &big).await.unwrap();
    let root = writer.root().await;
    writer_store.flush().await;
    assert_eq!(writer_store.status().in_flight, 0);

    // Fresh device: empty local cache, same remote
    let reader_local = Arc::new(MemoryStore::new());
    let reader_store = Arc::new(FallbackStore::new(
        reader_local.clone(),
        remote.clone(),
        MirrorOptions::default(),
    ));
    let config = HashTreeConfig::new(reader_store)
        .with_order(8)
        .with_chunk_size(32);
    let reader = HashTree::open(config, root).await.unwrap();
    assert_eq!(reader.len().await.unwrap(), 41);
    let link = reader.get("doc07").await.unwrap().unwrap();
    assert_eq!(reader.read_file(&link).await.unwrap(), b"contents of 7");
    let link = reader.get("big.bin").await.unwrap().unwrap();
    assert_eq!(reader.read_range(&link, 100, 50).await.unwrap(), &big[100..150]);

    // Everything touched was backfilled, so the reader keeps working offline
    remote.set_offline(true);
    assert!(reader_local.size() > 0);
    let link = reader.get("doc07").await.unwrap().unwrap();
    assert_eq!(reader.read_file(&link).await.unwrap(), b"contents of 7");
}

#[tokio::test]
async fn test_offline_writes_mirror_after_retry() {
    let remote = Arc::new(Remote::default());
    remote.set_offline(true);
    let store = Arc::new(FallbackStore::new(
        Arc::new(MemoryStore::new()),
        remote.clone(),
        quick_options(),
    ));
    let mut events = store.events();

    let tree = HashTree::new(HashTreeConfig::new(store.clone()).with_order(8))
        .await
        .unwrap();
    let root = tree.add("note", b"written offline").await.unwrap();
    assert!(tree.get("note").await.unwrap().is_some());

    store.flush().await;
    assert!(store.status().is_stale());
    assert!(!store.failed().is_empty());

    let mut gave_up = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, MirrorEvent::GaveUp { .. }) {
            gave_up = true;
        }
    }
    assert!(gave_up);

    remote.set_offline(false);
    assert!(store.retry_failed() > 0);
    store.flush().await;
    assert!(!store.status().is_stale());
    assert!(remote.inner.has(&root.hash).await.unwrap());
}

#[tokio::test]
async fn test_remote_outage_reads_as_missing() {
    let remote = Arc::new(Remote::default());
    let data = b"only on the remote".to_vec();
    let hash = sha256(&data);
    remote.inner.put(data).await.unwrap();
    remote.set_offline(true);

    let store = FallbackStore::new(Arc::new(MemoryStore::new()), remote.clone(), quick_options());
    assert_eq!(store.get(&hash).await.unwrap(), None);
    assert!(!store.has(&hash).await.unwrap());

    remote.set_offline(false);
    assert!(store.has(&hash).await.unwrap());
    assert!(store.get(&hash).await.unwrap().is_some());
    assert!(store.local().has(&hash).await.unwrap());
}

#[tokio::test]
async fn test_journal_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("mirror.json");
    let local = Arc::new(MemoryStore::new());
    let remote = Arc::new(Remote::default());
    remote.set_offline(true);

    let link = {
        let store = Arc::new(FallbackStore::new(
            local.clone(),
            remote.clone(),
            quick_options().with_journal(&journal),
        ));
        let tree = HashTree::new(HashTreeConfig::new(store.clone())).await.unwrap();
        let link = tree.put_file(b"survives restarts").await.unwrap();
        store.flush().await;
        store.shutdown();
        link
    };
    assert!(journal.exists());

    remote.set_offline(false);
    let store = FallbackStore::new(local, remote.clone(), quick_options().with_journal(&journal));
    assert!(store.resume_pending() >= 1);
    store.flush().await;
    assert_eq!(
        remote.inner.get(&link.hash).await.unwrap(),
        Some(b"survives restarts".to_vec())
    );
    assert_eq!(link.size, 17);
}
