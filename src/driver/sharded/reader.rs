//! Stitching reader: presents the ordered shards of a manifest as one
//! seekable byte stream.
//!
//! The reader is lazy: no shard is touched until a read needs it, and each
//! read burst opens the shard, pulls the needed slice, and drops the
//! handle. Bytes fetched beyond the caller's buffer are carried over to the
//! next poll.

use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, ReadBuf};

use super::Shared;
use super::manifest::Manifest;
use crate::paths::hash_path;

pub(crate) struct ShardedReader {
    shared: Arc<Shared>,
    manifest: Manifest,
    /// Logical offset of the next byte handed to the caller.
    offset: u64,
    /// Fetched bytes not yet delivered; always contiguous with `offset`.
    pending: Vec<u8>,
    read_op: Option<BoxFuture<'static, io::Result<Vec<u8>>>>,
    pending_seek: Option<u64>,
}

impl ShardedReader {
    pub(crate) fn new(shared: Arc<Shared>, manifest: Manifest) -> Self {
        Self {
            shared,
            manifest,
            offset: 0,
            pending: Vec::new(),
            read_op: None,
            pending_seek: None,
        }
    }

    /// Map a logical offset in `[0, size)` to
    /// `(chunk_index, intra_offset, bytes_left_in_chunk)`.
    ///
    /// Explicit chunk sizes are scanned front to back; without them the
    /// legacy uniform layout is pure arithmetic (the outer size guard keeps
    /// the shorter last chunk from overshooting).
    fn resolve(&self, offset: u64) -> Option<(usize, u64, u64)> {
        if !self.manifest.chunk_sizes.is_empty() {
            let mut start = 0u64;
            for (index, &size) in self.manifest.chunk_sizes.iter().enumerate() {
                if offset < start + size {
                    let intra = offset - start;
                    return Some((index, intra, size - intra));
                }
                start += size;
            }
            return None;
        }
        let chunk_size = self.shared.chunk_size;
        let index = (offset / chunk_size) as usize;
        let intra = offset % chunk_size;
        Some((index, intra, chunk_size - intra))
    }

    fn corrupt(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "manifest references data past its chunk list",
        )
    }

    fn start_burst(&mut self, space: usize) -> io::Result<()> {
        let (index, intra, remaining) = self.resolve(self.offset).ok_or_else(|| self.corrupt())?;
        if index >= self.manifest.chunks.len() {
            return Err(self.corrupt());
        }

        let hash = self.manifest.chunks[index].clone();
        let shared = Arc::clone(&self.shared);
        let logical_left = self.manifest.size - self.offset;
        let want = remaining.min(logical_left).min(space as u64) as usize;

        self.read_op = Some(Box::pin(async move {
            let shard_path = hash_path(&hash);
            let mut shard = shared.shards.open(&shard_path).await?;
            shard.seek(SeekFrom::Start(intra)).await?;

            let mut data = vec![0u8; want];
            let mut filled = 0;
            while filled < want {
                let n = shard.read(&mut data[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("shard {hash} is shorter than its manifest entry"),
                ));
            }
            data.truncate(filled);
            Ok(data)
        }));
        Ok(())
    }
}

impl AsyncRead for ShardedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pending_seek.is_some() {
            return Poll::Ready(Err(io::Error::other(
                "seek in progress, poll_complete must run before read",
            )));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // Serve carried-over bytes before touching any shard.
        if !this.pending.is_empty() {
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending[..n]);
            this.pending.drain(..n);
            this.offset += n as u64;
            return Poll::Ready(Ok(()));
        }

        if this.offset >= this.manifest.size {
            return Poll::Ready(Ok(()));
        }

        if this.read_op.is_none()
            && let Err(e) = this.start_burst(buf.remaining())
        {
            return Poll::Ready(Err(e));
        }

        let fut = this.read_op.as_mut().expect("read op started");
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                this.read_op = None;
                Poll::Ready(Err(e))
            }
            Poll::Ready(Ok(data)) => {
                this.read_op = None;
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                this.offset += n as u64;
                if n < data.len() {
                    this.pending.extend_from_slice(&data[n..]);
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl AsyncSeek for ShardedReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        let target = match position {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => this.offset as i128 + delta as i128,
            SeekFrom::End(delta) => this.manifest.size as i128 + delta as i128,
        };
        if target < 0 || target > this.manifest.size as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek target {target} out of range [0, {}]", this.manifest.size),
            ));
        }
        this.pending_seek = Some(target as u64);
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        if let Some(target) = this.pending_seek.take() {
            this.offset = target;
            this.pending.clear();
            this.read_op = None;
        }
        Poll::Ready(Ok(this.offset))
    }
}
