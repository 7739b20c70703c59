//! Offline-first store combinator
//!
//! `FallbackStore` puts a fast, possibly incomplete local store in front of
//! an authoritative remote one:
//! - Writes go to the local store (the caller's durability boundary), then
//!   are mirrored to the remote in the background
//! - Reads try local first, then remote, and backfill local on a remote hit
//!
//! Mirror uploads run on a background task fed by a channel. Failures never
//! reach the caller of `put`; they are retried with backoff, reported on a
//! broadcast channel, and optionally recorded in a JSON journal so they
//! survive a restart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tracing::{debug, info, warn};

use crate::hash::verify;
use crate::store::{Store, StoreError, StoreStats};
use crate::types::{from_hex, short_hex, to_hex, Hash};

/// Background mirror settings
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    /// Mirror local writes to the remote at all
    pub mirror_writes: bool,
    /// Upload attempts per blob before giving up
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Where to persist hashes that still need mirroring
    pub journal_path: Option<PathBuf>,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            mirror_writes: true,
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            journal_path: None,
        }
    }
}

impl MirrorOptions {
    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }
}

/// Outcome of one mirror attempt, published on the event channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    /// Blob is now on the remote
    Completed { hash: Hash },
    /// Attempt failed, will retry
    Failed {
        hash: Hash,
        attempt: u32,
        error: String,
    },
    /// All attempts failed; kept for `retry_failed`
    GaveUp {
        hash: Hash,
        attempts: u32,
        error: String,
    },
}

/// Snapshot of mirror progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStatus {
    /// Not yet on the remote, including uploads waiting in the journal
    pub in_flight: usize,
    /// Gave up, waiting for `retry_failed`
    pub failed: usize,
}

impl MirrorStatus {
    /// True when some local writes are known not to have reached the remote
    pub fn is_stale(&self) -> bool {
        self.failed > 0
    }

    /// Blobs still to be mirrored, in flight or failed
    pub fn outstanding(&self) -> usize {
        self.in_flight + self.failed
    }
}

/// Background sync task message
enum SyncMessage {
    /// Mirror the local blob with this hash
    Upload { hash: Hash },
    /// Reply once every earlier message is processed
    Flush(oneshot::Sender<()>),
    /// Shutdown the sync task
    Shutdown,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    #[serde(default)]
    pending: Vec<String>,
    #[serde(default)]
    failed: Vec<String>,
}

fn read_journal(path: &Path) -> Result<Journal, StoreError> {
    if !path.exists() {
        return Ok(Journal::default());
    }
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data)
        .map_err(|e| StoreError::Other(format!("invalid mirror journal {}: {}", path.display(), e)))
}

fn write_journal(path: &Path, journal: &Journal) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(journal)
        .map_err(|e| StoreError::Other(format!("failed to encode mirror journal: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Write to temp file first, then rename (atomic)
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, data)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

fn parse_hashes(entries: &[String]) -> BTreeSet<Hash> {
    entries
        .iter()
        .filter_map(|hex| match from_hex(hex) {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!("skipping journal entry {:?}: {}", hex, e);
                None
            }
        })
        .collect()
}

/// Quiet period before a changed state is written to the journal
const JOURNAL_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct MirrorState {
    pending: BTreeSet<Hash>,
    failed: BTreeSet<Hash>,
    /// Loaded from the journal and not yet handed to the mirror task
    restored: BTreeSet<Hash>,
}

impl MirrorState {
    fn load(path: &Path) -> Self {
        match read_journal(path) {
            Ok(journal) => {
                let pending = parse_hashes(&journal.pending);
                let failed = parse_hashes(&journal.failed);
                let restored = pending.union(&failed).copied().collect();
                Self {
                    pending,
                    failed,
                    restored,
                }
            }
            Err(e) => {
                warn!("ignoring mirror journal: {}", e);
                Self::default()
            }
        }
    }

    fn status(&self) -> MirrorStatus {
        MirrorStatus {
            in_flight: self.pending.len(),
            failed: self.failed.len(),
        }
    }

    fn journal(&self) -> Journal {
        Journal {
            pending: self.pending.iter().map(to_hex).collect(),
            failed: self.failed.iter().map(to_hex).collect(),
        }
    }
}

struct Shared {
    state: Mutex<MirrorState>,
    journal: Option<PathBuf>,
    /// Serializes journal file writes
    journal_lock: tokio::sync::Mutex<()>,
    journal_dirty: Notify,
    closed: AtomicBool,
    status: watch::Sender<MirrorStatus>,
    events: broadcast::Sender<MirrorEvent>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut MirrorState)) {
        let status = {
            let mut state = self.lock();
            f(&mut state);
            state.status()
        };
        self.status.send_replace(status);
        if self.journal.is_some() {
            self.journal_dirty.notify_one();
        }
    }

    fn emit(&self, event: MirrorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Write the current state to the journal, off the async workers
    async fn persist(&self) {
        let Some(path) = self.journal.clone() else {
            return;
        };
        let _guard = self.journal_lock.lock().await;
        let journal = self.lock().journal();
        let journal_path = path.display().to_string();
        match tokio::task::spawn_blocking(move || write_journal(&path, &journal)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to write mirror journal {}: {}", journal_path, e),
            Err(e) => warn!("mirror journal writer panicked: {}", e),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.journal_dirty.notify_one();
    }
}

/// Coalesces state changes into journal writes until the store closes
async fn journal_task(shared: Arc<Shared>) {
    loop {
        shared.journal_dirty.notified().await;
        if !shared.closed.load(Ordering::SeqCst) {
            tokio::time::sleep(JOURNAL_DEBOUNCE).await;
        }
        shared.persist().await;
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
    }
}

/// Local-first store that mirrors writes to a remote store.
pub struct FallbackStore<L: Store, R: Store> {
    local: Arc<L>,
    remote: Arc<R>,
    options: MirrorOptions,
    shared: Arc<Shared>,
    /// Channel to send sync messages to background task
    sync_tx: mpsc::UnboundedSender<SyncMessage>,
}

impl<L: Store + 'static, R: Store + 'static> FallbackStore<L, R> {
    /// Compose `local` and `remote`. Spawns the mirror task, so this must
    /// run inside a tokio runtime.
    pub fn new(local: Arc<L>, remote: Arc<R>, options: MirrorOptions) -> Self {
        let state = match &options.journal_path {
            Some(path) => MirrorState::load(path),
            None => MirrorState::default(),
        };
        let (status, _) = watch::channel(state.status());
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            journal: options.journal_path.clone(),
            journal_lock: tokio::sync::Mutex::new(()),
            journal_dirty: Notify::new(),
            closed: AtomicBool::new(false),
            status,
            events,
        });
        if shared.journal.is_some() {
            tokio::spawn(journal_task(shared.clone()));
        }

        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let task_local = local.clone();
        let task_remote = remote.clone();
        let task_shared = shared.clone();
        let task_options = options.clone();
        tokio::spawn(async move {
            Self::sync_task(sync_rx, task_local, task_remote, task_shared, task_options).await;
        });

        Self {
            local,
            remote,
            options,
            shared,
            sync_tx,
        }
    }

    /// Background task that mirrors blobs one at a time
    async fn sync_task(
        mut rx: mpsc::UnboundedReceiver<SyncMessage>,
        local: Arc<L>,
        remote: Arc<R>,
        shared: Arc<Shared>,
        options: MirrorOptions,
    ) {
        debug!("mirror task started");

        while let Some(msg) = rx.recv().await {
            match msg {
                SyncMessage::Upload { hash } => {
                    Self::mirror_one(&*local, &*remote, &shared, &options, hash).await;
                }
                SyncMessage::Flush(reply) => {
                    let _ = reply.send(());
                }
                SyncMessage::Shutdown => {
                    debug!("mirror task shutting down");
                    break;
                }
            }
        }
        shared.close();
    }

    async fn mirror_one(local: &L, remote: &R, shared: &Shared, options: &MirrorOptions, hash: Hash) {
        let data = match local.get(&hash).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!("mirror skip {}: no longer stored locally", short_hex(&hash));
                shared.update(|s| {
                    s.pending.remove(&hash);
                });
                return;
            }
            Err(e) => {
                warn!("mirror read failed for {}: {}", short_hex(&hash), e);
                shared.update(|s| {
                    s.pending.remove(&hash);
                    s.failed.insert(hash);
                });
                shared.emit(MirrorEvent::GaveUp {
                    hash,
                    attempts: 0,
                    error: e.to_string(),
                });
                return;
            }
        };

        let attempts = options.max_attempts.max(1);
        let mut backoff = options.initial_backoff;
        for attempt in 1..=attempts {
            match remote.put_hashed(hash, data.clone()).await {
                Ok(_) => {
                    debug!("mirror complete: {} ({} bytes)", short_hex(&hash), data.len());
                    shared.update(|s| {
                        s.pending.remove(&hash);
                        s.failed.remove(&hash);
                    });
                    shared.emit(MirrorEvent::Completed { hash });
                    return;
                }
                Err(e) if attempt < attempts => {
                    debug!(
                        "mirror attempt {}/{} failed for {}: {}",
                        attempt,
                        attempts,
                        short_hex(&hash),
                        e
                    );
                    shared.emit(MirrorEvent::Failed {
                        hash,
                        attempt,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(options.max_backoff);
                }
                Err(e) => {
                    warn!(
                        "mirror gave up on {} after {} attempts: {}",
                        short_hex(&hash),
                        attempts,
                        e
                    );
                    shared.update(|s| {
                        s.pending.remove(&hash);
                        s.failed.insert(hash);
                    });
                    shared.emit(MirrorEvent::GaveUp {
                        hash,
                        attempts,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Queue a blob for mirroring (non-blocking)
    fn queue_upload(&self, hash: Hash) {
        self.shared.update(|s| {
            s.failed.remove(&hash);
            s.restored.remove(&hash);
            s.pending.insert(hash);
        });
        if let Err(e) = self.sync_tx.send(SyncMessage::Upload { hash }) {
            warn!("Failed to queue mirror upload: {}", e);
        }
    }

    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Subscribe to mirror outcomes
    pub fn events(&self) -> broadcast::Receiver<MirrorEvent> {
        self.shared.events.subscribe()
    }

    pub fn status(&self) -> MirrorStatus {
        *self.shared.status.borrow()
    }

    /// Watch mirror status changes (stale/offline indicator)
    pub fn watch_status(&self) -> watch::Receiver<MirrorStatus> {
        self.shared.status.subscribe()
    }

    /// Hashes that exhausted their attempts
    pub fn failed(&self) -> Vec<Hash> {
        self.shared.lock().failed.iter().copied().collect()
    }

    async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sync_tx.send(SyncMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Wait until everything queued so far has been processed, then write
    /// the journal
    pub async fn flush(&self) {
        self.drain().await;
        self.shared.persist().await;
    }

    /// Like [`flush`](Self::flush) but gives up waiting after `deadline`.
    /// The journal is written either way, so unfinished uploads can be
    /// resumed later. Returns true when the queue drained in time.
    pub async fn flush_within(&self, deadline: Duration) -> bool {
        let drained = tokio::time::timeout(deadline, self.drain()).await.is_ok();
        self.shared.persist().await;
        drained
    }

    /// Re-queue every blob that gave up. Returns how many were queued.
    pub fn retry_failed(&self) -> usize {
        let failed = self.failed();
        for hash in &failed {
            self.queue_upload(*hash);
        }
        if !failed.is_empty() {
            info!("retrying {} failed mirror uploads", failed.len());
        }
        failed.len()
    }

    /// Queue the hashes an earlier process left in the journal. They are
    /// loaded when the store is built; this only starts their uploads.
    /// Returns how many were queued.
    pub fn resume_pending(&self) -> usize {
        let restored = std::mem::take(&mut self.shared.lock().restored);
        for hash in &restored {
            self.queue_upload(*hash);
        }
        if !restored.is_empty() {
            info!("resumed {} pending mirror uploads", restored.len());
        }
        restored.len()
    }

    /// Shutdown the background sync task
    pub fn shutdown(&self) {
        let _ = self.sync_tx.send(SyncMessage::Shutdown);
    }
}

impl<L: Store, R: Store> Drop for FallbackStore<L, R> {
    fn drop(&mut self) {
        let _ = self.sync_tx.send(SyncMessage::Shutdown);
    }
}

#[async_trait]
impl<L: Store + 'static, R: Store + 'static> Store for FallbackStore<L, R> {
    async fn put_hashed(&self, hash: Hash, data: Vec<u8>) -> Result<bool, StoreError> {
        // Store locally first; this is the only result the caller sees
        let is_new = self.local.put_hashed(hash, data).await?;

        if is_new && self.options.mirror_writes {
            self.queue_upload(hash);
        }

        Ok(is_new)
    }

    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(data) = self.local.get(hash).await? {
            return Ok(Some(data));
        }

        match self.remote.get(hash).await {
            Ok(Some(data)) => {
                if !verify(hash, &data) {
                    warn!("remote returned bytes not matching {}", short_hex(hash));
                    return Ok(None);
                }
                // Backfill so the next read is local
                if let Err(e) = self.local.put_hashed(*hash, data.clone()).await {
                    warn!("backfill of {} failed: {}", short_hex(hash), e);
                }
                Ok(Some(data))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("remote fetch failed, returning None: {}", e);
                Ok(None)
            }
        }
    }

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        if self.local.has(hash).await? {
            return Ok(true);
        }

        match self.remote.has(hash).await {
            Ok(exists) => Ok(exists),
            Err(e) => {
                warn!("remote exists check failed, returning false: {}", e);
                Ok(false)
            }
        }
    }

    async fn delete(&self, hash: &Hash) -> Result<bool, StoreError> {
        // Remote copies are authoritative and outlive local eviction
        self.local.delete(hash).await
    }

    async fn get_range(
        &self,
        hash: &Hash,
        start: u64,
        end: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        if self.local.has(hash).await? {
            return self.local.get_range(hash, start, end).await;
        }
        Ok(self.get(hash).await?.map(|data| {
            let end = (end as usize).min(data.len());
            let start = (start as usize).min(end);
            data[start..end].to_vec()
        }))
    }

    fn supports_partial_reads(&self) -> bool {
        self.local.supports_partial_reads()
    }

    fn set_max_bytes(&self, max: u64) {
        self.local.set_max_bytes(max)
    }

    fn max_bytes(&self) -> Option<u64> {
        self.local.max_bytes()
    }

    async fn stats(&self) -> StoreStats {
        self.local.stats().await
    }

    async fn evict_if_needed(&self) -> Result<u64, StoreError> {
        self.local.evict_if_needed().await
    }
}
