//! Chunked storage for large blobs
//!
//! A blob is split into fixed-size chunks, each stored by hash. The ordered
//! list of chunks is a [`ChunkManifest`], which is itself stored as
//! MessagePack so the whole blob has a CID of kind [`LinkType::File`].
//!
//! Range reads resolve only the chunks overlapping the window. Backends that
//! can read part of a blob are asked for exactly the overlapping bytes;
//! others return whole chunks, which are verified and sliced in memory.

use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::{decode_manifest, encode_manifest, CodecError};
use crate::hash::verify;
use crate::store::{Store, StoreError};
use crate::types::{to_hex, ChunkManifest, ChunkRef, Cid, Codec, Hash, LinkType};

/// Default chunk size: 2MB (one upload per chunk on Blossom servers)
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Chunk fetches kept in flight during reads
const READ_CONCURRENCY: usize = 4;

/// Chunker error type
#[derive(Debug, thiserror::Error)]
pub enum ChunkerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Missing chunk: {0}")]
    MissingChunk(String),
    #[error("Hash mismatch for chunk {0}")]
    HashMismatch(String),
    #[error("Chunk {hash} has {actual} bytes, manifest says {expected}")]
    SizeMismatch {
        hash: String,
        expected: u64,
        actual: u64,
    },
    #[error("Chunk size must be positive")]
    InvalidChunkSize,
}

/// Stream of chunk payloads in manifest order
pub type ChunkStream<'a> = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ChunkerError>> + Send + 'a>>;

/// The part of one chunk a read needs
#[derive(Debug, Clone, Copy)]
struct ChunkSlice {
    chunk: ChunkRef,
    start: u64,
    end: u64,
}

pub struct Chunker<S: Store> {
    store: Arc<S>,
    max_chunk_size: usize,
}

impl<S: Store> Clone for Chunker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            max_chunk_size: self.max_chunk_size,
        }
    }
}

impl<S: Store> Chunker<S> {
    pub fn new(store: Arc<S>, max_chunk_size: usize) -> Result<Self, ChunkerError> {
        if max_chunk_size == 0 {
            return Err(ChunkerError::InvalidChunkSize);
        }
        Ok(Self {
            store,
            max_chunk_size,
        })
    }

    pub fn with_default_size(store: Arc<S>) -> Self {
        Self {
            store,
            max_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn put_chunk(&self, data: Vec<u8>) -> Result<ChunkRef, ChunkerError> {
        let size = data.len() as u64;
        let hash = self.store.put(data).await?;
        Ok(ChunkRef { hash, size })
    }

    /// Split `reader` into chunks of at most `max_chunk_size` bytes and store
    /// them. Every chunk but the last is exactly `max_chunk_size` long.
    pub async fn chunk<R>(&self, mut reader: R) -> Result<ChunkManifest, ChunkerError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut chunks = Vec::new();
        let mut buf = vec![0u8; self.max_chunk_size];
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = reader.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            chunks.push(self.put_chunk(buf[..filled].to_vec()).await?);
            if filled < buf.len() {
                break;
            }
        }

        let manifest = ChunkManifest::new(chunks);
        tracing::debug!(
            chunks = manifest.len(),
            bytes = manifest.total_size(),
            "chunked stream"
        );
        Ok(manifest)
    }

    /// [`Chunker::chunk`] for data already in memory
    pub async fn chunk_bytes(&self, data: &[u8]) -> Result<ChunkManifest, ChunkerError> {
        let mut chunks = Vec::with_capacity(data.len().div_ceil(self.max_chunk_size));
        for piece in data.chunks(self.max_chunk_size) {
            chunks.push(self.put_chunk(piece.to_vec()).await?);
        }
        Ok(ChunkManifest::new(chunks))
    }

    /// Store the manifest itself, returning the CID of the whole blob
    pub async fn put_manifest(&self, manifest: &ChunkManifest) -> Result<Cid, ChunkerError> {
        let data = encode_manifest(manifest)?;
        let hash = self.store.put(data).await?;
        Ok(Cid::new(hash, LinkType::File, manifest.total_size()).with_codec(Codec::MessagePack))
    }

    pub async fn load_manifest(&self, hash: &Hash) -> Result<ChunkManifest, ChunkerError> {
        let data = self
            .store
            .get(hash)
            .await?
            .ok_or_else(|| ChunkerError::MissingChunk(to_hex(hash)))?;
        Ok(decode_manifest(&data)?)
    }

    /// Fetch a whole chunk and check it against the manifest
    async fn fetch_chunk(&self, chunk: ChunkRef) -> Result<Vec<u8>, ChunkerError> {
        let data = self
            .store
            .get(&chunk.hash)
            .await?
            .ok_or_else(|| ChunkerError::MissingChunk(to_hex(&chunk.hash)))?;
        if !verify(&chunk.hash, &data) {
            return Err(ChunkerError::HashMismatch(to_hex(&chunk.hash)));
        }
        if data.len() as u64 != chunk.size {
            return Err(ChunkerError::SizeMismatch {
                hash: to_hex(&chunk.hash),
                expected: chunk.size,
                actual: data.len() as u64,
            });
        }
        Ok(data)
    }

    async fn fetch_slice(&self, slice: ChunkSlice) -> Result<Vec<u8>, ChunkerError> {
        let wanted = slice.end - slice.start;
        if self.store.supports_partial_reads() && wanted < slice.chunk.size {
            let data = self
                .store
                .get_range(&slice.chunk.hash, slice.start, slice.end)
                .await?
                .ok_or_else(|| ChunkerError::MissingChunk(to_hex(&slice.chunk.hash)))?;
            if data.len() as u64 != wanted {
                return Err(ChunkerError::SizeMismatch {
                    hash: to_hex(&slice.chunk.hash),
                    expected: wanted,
                    actual: data.len() as u64,
                });
            }
            return Ok(data);
        }

        let data = self.fetch_chunk(slice.chunk).await?;
        if wanted == slice.chunk.size {
            return Ok(data);
        }
        Ok(data[slice.start as usize..slice.end as usize].to_vec())
    }

    /// Bytes `[offset, offset + length)` of the blob, clamped to its length
    pub async fn read(
        &self,
        manifest: &ChunkManifest,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, ChunkerError> {
        let total = manifest.total_size();
        let end = offset.saturating_add(length).min(total);
        if offset >= end {
            return Ok(Vec::new());
        }

        let mut slices = Vec::new();
        let mut position = 0u64;
        for chunk in &manifest.chunks {
            let chunk_end = position + chunk.size;
            if chunk_end > offset && position < end {
                slices.push(ChunkSlice {
                    chunk: *chunk,
                    start: offset.saturating_sub(position),
                    end: end.min(chunk_end) - position,
                });
            }
            if chunk_end >= end {
                break;
            }
            position = chunk_end;
        }

        let parts: Vec<Vec<u8>> = stream::iter(slices)
            .map(|slice| self.fetch_slice(slice))
            .buffered(READ_CONCURRENCY)
            .try_collect()
            .await?;

        let mut out = Vec::with_capacity((end - offset) as usize);
        for part in parts {
            out.extend_from_slice(&part);
        }
        Ok(out)
    }

    pub async fn read_all(&self, manifest: &ChunkManifest) -> Result<Vec<u8>, ChunkerError> {
        self.read(manifest, 0, manifest.total_size()).await
    }

    /// Verified chunks in order, a few fetched ahead of the consumer
    pub fn read_stream(&self, manifest: &ChunkManifest) -> ChunkStream<'_> {
        let chunks = manifest.chunks.clone();
        Box::pin(
            stream::iter(chunks)
                .map(move |chunk| self.fetch_chunk(chunk))
                .buffered(READ_CONCURRENCY),
        )
    }
}
