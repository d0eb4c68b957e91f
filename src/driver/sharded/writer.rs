//! Streaming chunk writer with content-addressed deduplication.
//!
//! Bytes accumulate in a chunk-sized buffer; each full buffer is hashed and
//! persisted as a shard (skipped entirely when the shard pool already has
//! those bytes). The manifest is written only by `poll_shutdown`, so an
//! abandoned or failed writer never publishes the logical file.

use std::io::{self, SeekFrom};
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use chrono::Utc;
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncSeek, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::manifest::Manifest;
use super::{Shared, manifest_path_for};
use crate::paths::hash_path;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

struct FlushDone {
    hash: String,
    len: u64,
    buffer: Vec<u8>,
}

enum WriterState {
    Idle,
    Flushing(BoxFuture<'static, io::Result<FlushDone>>),
    Closing(BoxFuture<'static, io::Result<()>>),
    Closed,
    Failed,
}

pub(crate) struct ShardedWriter {
    shared: Arc<Shared>,
    path: String,
    hashes: Vec<String>,
    chunk_sizes: Vec<u64>,
    size: u64,
    /// Accumulator; `None` while its contents are inside a flush future.
    buffer: Option<Vec<u8>>,
    state: WriterState,
}

impl ShardedWriter {
    pub(crate) fn new(shared: Arc<Shared>, path: String) -> Self {
        let buffer = shared.pool.get();
        Self {
            shared,
            path,
            hashes: Vec::new(),
            chunk_sizes: Vec::new(),
            size: 0,
            buffer: Some(buffer),
            state: WriterState::Idle,
        }
    }

    /// Seed the writer from an existing manifest for append mode. Legacy
    /// uniform manifests get their per-chunk sizes synthesized; the prior
    /// tail chunk stays as-is and new bytes start a fresh chunk.
    pub(crate) fn load_existing(&mut self, manifest: &Manifest) {
        self.hashes = manifest.chunks.clone();
        self.chunk_sizes = manifest.resolved_chunk_sizes(self.shared.chunk_size);
        self.size = manifest.size;
    }

    fn complete_flush(&mut self, done: FlushDone) {
        self.hashes.push(done.hash);
        self.chunk_sizes.push(done.len);
        self.buffer = Some(done.buffer);
        self.state = WriterState::Idle;
    }

    fn closed_error() -> io::Error {
        io::Error::other("writer already closed")
    }

    fn failed_error() -> io::Error {
        io::Error::other("writer failed; file was not committed")
    }
}

/// Hash the buffered bytes and store them as a shard, returning the cleared
/// buffer for reuse.
async fn store_chunk(shared: Arc<Shared>, mut buffer: Vec<u8>) -> io::Result<FlushDone> {
    let hash = hex::encode(Sha256::digest(&buffer));
    let len = buffer.len() as u64;
    write_shard(&shared, &hash, &buffer).await?;
    buffer.clear();
    Ok(FlushDone { hash, len, buffer })
}

/// Persist one shard at its content address, unless it is already there.
async fn write_shard(shared: &Shared, hash: &str, data: &[u8]) -> io::Result<()> {
    let shard_path = hash_path(hash);

    if let Some((dir, _)) = shard_path.rsplit_once('/')
        && !shared.shard_dirs.contains(dir)
    {
        shared.shards.mkdir_all(dir).await?;
        // Shard directories are never removed, so the memo cannot go stale.
        shared.shard_dirs.insert(dir.to_string());
    }

    if shared.shards.stat(&shard_path).await.is_ok() {
        debug!(hash, "shard already present, skipping write");
        return Ok(());
    }

    // Stage into a temp file in the final leaf directory so a reader never
    // observes a partial shard; the rename publishes it whole. A losing
    // racer replaces the winner's file with identical bytes.
    let tmp = format!(
        "{shard_path}.{}.{}.tmp",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let mut w = shared.shards.create(&tmp).await?;
    w.write_all(data).await?;
    w.shutdown().await?;

    let written = shared.shards.stat(&tmp).await?.size;
    if written != data.len() as u64 {
        let _ = shared.shards.remove(&tmp).await;
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short shard write: {written} of {} bytes", data.len()),
        ));
    }
    shared.shards.rename(&tmp, &shard_path).await
}

/// Flush the residual chunk and commit the manifest.
async fn finish(
    shared: Arc<Shared>,
    path: String,
    mut buffer: Vec<u8>,
    mut hashes: Vec<String>,
    mut chunk_sizes: Vec<u64>,
    size: u64,
) -> io::Result<()> {
    if !buffer.is_empty() {
        let done = store_chunk(Arc::clone(&shared), buffer).await?;
        hashes.push(done.hash);
        chunk_sizes.push(done.len);
        buffer = done.buffer;
    }

    let manifest = Manifest {
        chunks: hashes,
        chunk_sizes,
        size,
        mod_time: Utc::now(),
    };
    let data = manifest.encode()?;

    let manifest_path = manifest_path_for(&path);
    if let Some((dir, _)) = manifest_path.rsplit_once('/') {
        shared.manifests.mkdir_all(dir).await?;
    }
    let mut w = shared.manifests.create(&manifest_path).await?;
    w.write_all(&data).await?;
    w.shutdown().await?;

    shared.pool.put(buffer);
    Ok(())
}

impl AsyncWrite for ShardedWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                WriterState::Idle => {
                    if data.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let buffer = this.buffer.as_mut().expect("buffer present while idle");
                    let space = this.shared.chunk_size as usize - buffer.len();
                    let n = space.min(data.len());
                    buffer.extend_from_slice(&data[..n]);
                    this.size += n as u64;
                    if buffer.len() == this.shared.chunk_size as usize {
                        let full = this.buffer.take().expect("buffer present while idle");
                        this.state = WriterState::Flushing(Box::pin(store_chunk(
                            Arc::clone(&this.shared),
                            full,
                        )));
                    }
                    return Poll::Ready(Ok(n));
                }
                WriterState::Flushing(fut) => match fut.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(done)) => this.complete_flush(done),
                    Poll::Ready(Err(e)) => {
                        this.state = WriterState::Failed;
                        return Poll::Ready(Err(e));
                    }
                },
                WriterState::Closing(_) | WriterState::Closed => {
                    return Poll::Ready(Err(Self::closed_error()));
                }
                WriterState::Failed => return Poll::Ready(Err(Self::failed_error())),
            }
        }
    }

    /// Completes any in-flight shard write. A partially filled accumulator
    /// is deliberately not flushed: that would emit an undersized interior
    /// chunk; residual bytes are only committed by `poll_shutdown`.
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                WriterState::Idle | WriterState::Closed => return Poll::Ready(Ok(())),
                WriterState::Flushing(fut) => match fut.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(done)) => this.complete_flush(done),
                    Poll::Ready(Err(e)) => {
                        this.state = WriterState::Failed;
                        return Poll::Ready(Err(e));
                    }
                },
                WriterState::Closing(_) => return Poll::Ready(Err(Self::closed_error())),
                WriterState::Failed => return Poll::Ready(Err(Self::failed_error())),
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                WriterState::Idle => {
                    let buffer = this.buffer.take().unwrap_or_default();
                    this.state = WriterState::Closing(Box::pin(finish(
                        Arc::clone(&this.shared),
                        this.path.clone(),
                        buffer,
                        mem::take(&mut this.hashes),
                        mem::take(&mut this.chunk_sizes),
                        this.size,
                    )));
                }
                WriterState::Flushing(fut) => match fut.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(done)) => this.complete_flush(done),
                    Poll::Ready(Err(e)) => {
                        this.state = WriterState::Failed;
                        return Poll::Ready(Err(e));
                    }
                },
                WriterState::Closing(fut) => match fut.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(())) => {
                        this.state = WriterState::Closed;
                        return Poll::Ready(Ok(()));
                    }
                    Poll::Ready(Err(e)) => {
                        this.state = WriterState::Failed;
                        return Poll::Ready(Err(e));
                    }
                },
                WriterState::Closed => return Poll::Ready(Ok(())),
                WriterState::Failed => return Poll::Ready(Err(Self::failed_error())),
            }
        }
    }
}

impl AsyncSeek for ShardedWriter {
    /// Only the end-seek used by resumable uploads is allowed (and the
    /// equivalent start-seek on an empty writer). Anything else would mean
    /// rewriting already-hashed chunks.
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        match position {
            SeekFrom::Start(offset) if offset == this.size => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "sharded writer only seeks to the current end",
            )),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.size))
    }
}
