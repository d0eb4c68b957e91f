//! In-memory storage engine.
//!
//! A fast, dependency-free engine for unit tests, and an embeddable store
//! for engines (like the sharded driver) that layer on top of other
//! engines. Writers buffer in memory and commit on shutdown.

use std::collections::HashMap;
use std::io::{self, Cursor, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::io::{AsyncSeek, AsyncWrite};
use tokio::sync::RwLock;

use crate::engine::{BoxReader, BoxWriter, EntryInfo, OpenFlags, StorageEngine};
use crate::paths::{base_name, clean_path, join_path};

#[derive(Debug, Clone)]
enum MemNode {
    Dir { mod_time: DateTime<Utc> },
    File { data: Vec<u8>, mod_time: DateTime<Utc> },
}

type Nodes = Arc<RwLock<HashMap<String, MemNode>>>;

/// An engine holding its whole tree in process memory. The root directory
/// always exists and is never stored explicitly.
#[derive(Clone, Default)]
pub struct MemEngine {
    nodes: Nodes,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files currently stored (directories excluded).
    pub async fn file_count(&self) -> usize {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| matches!(n, MemNode::File { .. }))
            .count()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent,
        None => "",
    }
}

fn ensure_dirs(nodes: &mut HashMap<String, MemNode>, dir: &str) -> io::Result<()> {
    if dir.is_empty() {
        return Ok(());
    }
    let mut acc = String::new();
    for seg in dir.split('/') {
        if acc.is_empty() {
            acc.push_str(seg);
        } else {
            acc = format!("{acc}/{seg}");
        }
        match nodes.get(&acc) {
            Some(MemNode::File { .. }) => {
                return Err(io::Error::new(io::ErrorKind::NotADirectory, acc));
            }
            Some(MemNode::Dir { .. }) => {}
            None => {
                nodes.insert(
                    acc.clone(),
                    MemNode::Dir {
                        mod_time: Utc::now(),
                    },
                );
            }
        }
    }
    Ok(())
}

#[async_trait]
impl StorageEngine for MemEngine {
    async fn stat(&self, path: &str) -> io::Result<EntryInfo> {
        let p = clean_path(path);
        if p.is_empty() {
            return Ok(EntryInfo::dir("/", p, DateTime::UNIX_EPOCH));
        }
        let nodes = self.nodes.read().await;
        match nodes.get(&p) {
            Some(MemNode::Dir { mod_time }) => {
                Ok(EntryInfo::dir(base_name(&p), p.clone(), *mod_time))
            }
            Some(MemNode::File { data, mod_time }) => Ok(EntryInfo::file(
                base_name(&p),
                p.clone(),
                data.len() as u64,
                *mod_time,
            )),
            None => Err(io::Error::new(io::ErrorKind::NotFound, p)),
        }
    }

    async fn open(&self, path: &str) -> io::Result<BoxReader> {
        let p = clean_path(path);
        let nodes = self.nodes.read().await;
        match nodes.get(&p) {
            Some(MemNode::File { data, .. }) => Ok(Box::new(Cursor::new(data.clone()))),
            Some(MemNode::Dir { .. }) => Err(io::Error::new(io::ErrorKind::IsADirectory, p)),
            None => Err(io::Error::new(io::ErrorKind::NotFound, p)),
        }
    }

    async fn create(&self, path: &str) -> io::Result<BoxWriter> {
        self.open_file(path, OpenFlags::create_truncate()).await
    }

    async fn open_file(&self, path: &str, flags: OpenFlags) -> io::Result<BoxWriter> {
        flags.validate()?;
        let p = clean_path(path);
        if p.is_empty() {
            return Err(io::Error::new(io::ErrorKind::IsADirectory, "/"));
        }

        let mut nodes = self.nodes.write().await;
        let buf = match nodes.get(&p) {
            Some(MemNode::Dir { .. }) => {
                return Err(io::Error::new(io::ErrorKind::IsADirectory, p));
            }
            Some(MemNode::File { data, .. }) if !flags.truncate => data.clone(),
            Some(MemNode::File { .. }) => Vec::new(),
            None => {
                if !flags.create {
                    return Err(io::Error::new(io::ErrorKind::NotFound, p));
                }
                ensure_dirs(&mut nodes, parent_of(&p))?;
                Vec::new()
            }
        };
        let pos = if flags.append { buf.len() } else { 0 };

        Ok(Box::new(MemWriter {
            nodes: Arc::clone(&self.nodes),
            path: p,
            buf,
            pos,
            commit: None,
            closed: false,
        }))
    }

    async fn remove(&self, path: &str) -> io::Result<()> {
        let p = clean_path(path);
        let mut nodes = self.nodes.write().await;
        if p.is_empty() {
            nodes.clear();
            return Ok(());
        }
        nodes.remove(&p);
        let prefix = format!("{p}/");
        nodes.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()> {
        let old = clean_path(old_path);
        let new = clean_path(new_path);
        if old.is_empty() || new.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "rename root"));
        }

        let mut nodes = self.nodes.write().await;
        if !nodes.contains_key(&old) {
            return Err(io::Error::new(io::ErrorKind::NotFound, old));
        }
        ensure_dirs(&mut nodes, parent_of(&new))?;

        let prefix = format!("{old}/");
        let moved: Vec<String> = nodes
            .keys()
            .filter(|k| **k == old || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            let node = nodes.remove(&key).expect("key just listed");
            let target = format!("{new}{}", &key[old.len()..]);
            nodes.insert(target, node);
        }
        Ok(())
    }

    async fn mkdir_all(&self, path: &str) -> io::Result<()> {
        let p = clean_path(path);
        let mut nodes = self.nodes.write().await;
        ensure_dirs(&mut nodes, &p)
    }

    async fn read_dir(&self, path: &str) -> io::Result<Vec<EntryInfo>> {
        let p = clean_path(path);
        let nodes = self.nodes.read().await;
        if !p.is_empty() {
            match nodes.get(&p) {
                Some(MemNode::Dir { .. }) => {}
                Some(MemNode::File { .. }) => {
                    return Err(io::Error::new(io::ErrorKind::NotADirectory, p));
                }
                None => return Err(io::Error::new(io::ErrorKind::NotFound, p)),
            }
        }

        let mut entries: Vec<EntryInfo> = nodes
            .iter()
            .filter(|(k, _)| parent_of(k) == p)
            .map(|(k, node)| match node {
                MemNode::Dir { mod_time } => {
                    EntryInfo::dir(base_name(k), join_path(&p, base_name(k)), *mod_time)
                }
                MemNode::File { data, mod_time } => EntryInfo::file(
                    base_name(k),
                    join_path(&p, base_name(k)),
                    data.len() as u64,
                    *mod_time,
                ),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// Buffered writer that commits the whole file on shutdown.
struct MemWriter {
    nodes: Nodes,
    path: String,
    buf: Vec<u8>,
    pos: usize,
    commit: Option<BoxFuture<'static, io::Result<()>>>,
    closed: bool,
}

impl AsyncWrite for MemWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::other("writer already closed")));
        }

        if this.buf.len() < this.pos {
            this.buf.resize(this.pos, 0);
        }
        let overlap = (this.buf.len() - this.pos).min(data.len());
        this.buf[this.pos..this.pos + overlap].copy_from_slice(&data[..overlap]);
        this.buf.extend_from_slice(&data[overlap..]);
        this.pos += data.len();
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }

        if this.commit.is_none() {
            let nodes = Arc::clone(&this.nodes);
            let path = this.path.clone();
            let data = std::mem::take(&mut this.buf);
            this.commit = Some(Box::pin(async move {
                let mut nodes = nodes.write().await;
                ensure_dirs(&mut nodes, parent_of(&path))?;
                nodes.insert(
                    path,
                    MemNode::File {
                        data,
                        mod_time: Utc::now(),
                    },
                );
                Ok(())
            }));
        }

        let fut = this.commit.as_mut().expect("commit future set");
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(res) => {
                this.commit = None;
                this.closed = true;
                Poll::Ready(res)
            }
        }
    }
}

impl AsyncSeek for MemWriter {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        let base: i128 = match position {
            SeekFrom::Start(_) => 0,
            SeekFrom::Current(_) => this.pos as i128,
            SeekFrom::End(_) => this.buf.len() as i128,
        };
        let delta: i128 = match position {
            SeekFrom::Start(off) => off as i128,
            SeekFrom::Current(off) => off as i128,
            SeekFrom::End(off) => off as i128,
        };
        let next = base + delta;
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        }
        this.pos = next as usize;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.pos as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_create_write_read() {
        let engine = MemEngine::new();
        let mut w = engine.create("a/b.txt").await.unwrap();
        w.write_all(b"hello").await.unwrap();
        w.shutdown().await.unwrap();

        let info = engine.stat("a/b.txt").await.unwrap();
        assert_eq!(info.size, 5);
        assert!(!info.is_dir);
        assert!(engine.stat("a").await.unwrap().is_dir);

        let mut r = engine.open("a/b.txt").await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_uncommitted_write_is_invisible() {
        let engine = MemEngine::new();
        let mut w = engine.create("x.txt").await.unwrap();
        w.write_all(b"data").await.unwrap();
        drop(w);
        assert_eq!(
            engine.stat("x.txt").await.unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_writer_seek_overwrites() {
        let engine = MemEngine::new();
        let mut w = engine.create("x.txt").await.unwrap();
        w.write_all(b"hello world").await.unwrap();
        w.seek(SeekFrom::Start(6)).await.unwrap();
        w.write_all(b"there").await.unwrap();
        w.shutdown().await.unwrap();

        let mut r = engine.open("x.txt").await.unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello there");
    }

    #[tokio::test]
    async fn test_rename_directory_subtree() {
        let engine = MemEngine::new();
        let mut w = engine.create("dir/a/f.txt").await.unwrap();
        w.write_all(b"f").await.unwrap();
        w.shutdown().await.unwrap();

        engine.rename("dir", "moved").await.unwrap();
        assert!(engine.stat("moved/a/f.txt").await.is_ok());
        assert_eq!(
            engine.stat("dir").await.unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_conformance_suite() {
        let engine = MemEngine::new();
        crate::testsuite::storage_engine_suite(&engine).await;
    }
}
