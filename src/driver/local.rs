//! Local filesystem engine.
//!
//! A rooted pass-through over the host filesystem. Logical paths are
//! normalized before they are joined onto the root, so `..` can never
//! escape it.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

use crate::engine::{
    BoxByteStream, BoxReader, BoxWriter, Copier, EntryInfo, Hasher, OpenFlags, StorageEngine,
    StreamReader, StreamWriter,
};
use crate::paths::{base_name, clean_path, join_path};

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Storage engine backed by a directory on the local filesystem.
pub struct LocalEngine {
    root: PathBuf,
}

impl LocalEngine {
    /// Create an engine rooted at `root`, creating the directory if needed.
    pub async fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Clean logical path plus its on-disk location.
    fn resolve(&self, path: &str) -> (String, PathBuf) {
        let clean = clean_path(path);
        let full = if clean.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&clean)
        };
        (clean, full)
    }

    async fn ensure_parent(&self, full: &Path) -> io::Result<()> {
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

fn entry_from_metadata(clean: &str, meta: &std::fs::Metadata) -> EntryInfo {
    let mod_time = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::UNIX_EPOCH);
    let mut info = if meta.is_dir() {
        EntryInfo::dir(base_name(clean), clean.to_string(), mod_time)
    } else {
        EntryInfo::file(base_name(clean), clean.to_string(), meta.len(), mod_time)
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        info.mode = Some(meta.permissions().mode());
    }
    info
}

#[async_trait]
impl StorageEngine for LocalEngine {
    async fn stat(&self, path: &str) -> io::Result<EntryInfo> {
        let (clean, full) = self.resolve(path);
        let meta = fs::metadata(&full).await?;
        Ok(entry_from_metadata(&clean, &meta))
    }

    async fn open(&self, path: &str) -> io::Result<BoxReader> {
        let (_, full) = self.resolve(path);
        let file = fs::File::open(&full).await?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> io::Result<BoxWriter> {
        let (_, full) = self.resolve(path);
        self.ensure_parent(&full).await?;
        let file = fs::File::create(&full).await?;
        Ok(Box::new(file))
    }

    async fn open_file(&self, path: &str, flags: OpenFlags) -> io::Result<BoxWriter> {
        flags.validate()?;
        let (_, full) = self.resolve(path);
        if flags.create {
            self.ensure_parent(&full).await?;
        }
        let file = fs::OpenOptions::new()
            .write(flags.write && !flags.append)
            .append(flags.append)
            .create(flags.create)
            .truncate(flags.truncate)
            .open(&full)
            .await?;
        Ok(Box::new(file))
    }

    async fn remove(&self, path: &str) -> io::Result<()> {
        let (_, full) = self.resolve(path);
        match fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full).await,
            Ok(_) => fs::remove_file(&full).await,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()> {
        let (_, old_full) = self.resolve(old_path);
        let (_, new_full) = self.resolve(new_path);
        self.ensure_parent(&new_full).await?;
        fs::rename(&old_full, &new_full).await
    }

    async fn mkdir_all(&self, path: &str) -> io::Result<()> {
        let (_, full) = self.resolve(path);
        fs::create_dir_all(&full).await
    }

    async fn read_dir(&self, path: &str) -> io::Result<Vec<EntryInfo>> {
        let (clean, full) = self.resolve(path);
        let mut dir = fs::read_dir(&full).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata().await?;
            entries.push(entry_from_metadata(&join_path(&clean, &name), &meta));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn as_stream_reader(&self) -> Option<&dyn StreamReader> {
        Some(self)
    }

    fn as_stream_writer(&self) -> Option<&dyn StreamWriter> {
        Some(self)
    }

    fn as_hasher(&self) -> Option<&dyn Hasher> {
        Some(self)
    }

    fn as_copier(&self) -> Option<&dyn Copier> {
        Some(self)
    }
}

#[async_trait]
impl StreamReader for LocalEngine {
    async fn get(&self, path: &str) -> io::Result<BoxByteStream> {
        let (_, full) = self.resolve(path);
        let file = fs::File::open(&full).await?;
        Ok(Box::new(file))
    }
}

#[async_trait]
impl StreamWriter for LocalEngine {
    #[instrument(name = "LocalEngine.put", level = "trace", skip(self, reader))]
    async fn put(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<u64> {
        let (_, full) = self.resolve(path);
        self.ensure_parent(&full).await?;
        let mut file = fs::File::create(&full).await?;
        let written = tokio::io::copy(reader, &mut file).await?;
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl Hasher for LocalEngine {
    async fn hash(&self, path: &str, algorithm: &str) -> io::Result<String> {
        let (_, full) = self.resolve(path);
        let mut file = fs::File::open(&full).await?;
        let mut buf = vec![0u8; HASH_BUF_SIZE];

        match algorithm {
            "md5" => {
                let mut ctx = md5::Context::new();
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    ctx.consume(&buf[..n]);
                }
                Ok(format!("{:x}", ctx.compute()))
            }
            "sha256" => {
                let mut hasher = Sha256::new();
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(hex::encode(hasher.finalize()))
            }
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported hash algorithm: {other}"),
            )),
        }
    }
}

#[async_trait]
impl Copier for LocalEngine {
    async fn copy(&self, src: &str, dst: &str) -> io::Result<()> {
        let (_, src_full) = self.resolve(src);
        let (_, dst_full) = self.resolve(dst);
        let meta = fs::metadata(&src_full).await?;
        if meta.is_dir() {
            copy_dir(src_full, dst_full).await
        } else {
            copy_file(&src_full, &dst_full).await
        }
    }
}

async fn copy_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut from = fs::File::open(src).await?;
    let mut to = fs::File::create(dst).await?;
    tokio::io::copy(&mut from, &mut to).await?;
    to.flush().await
}

fn copy_dir(src: PathBuf, dst: PathBuf) -> BoxFuture<'static, io::Result<()>> {
    Box::pin(async move {
        fs::create_dir_all(&dst).await?;
        let mut dir = fs::read_dir(&src).await?;
        while let Some(entry) = dir.next_entry().await? {
            let from = entry.path();
            let to = dst.join(entry.file_name());
            if entry.metadata().await?.is_dir() {
                copy_dir(from, to).await?;
            } else {
                copy_file(&from, &to).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;
    use tempfile::tempdir;
    use tokio::io::AsyncSeekExt;

    async fn write_file(engine: &LocalEngine, path: &str, data: &[u8]) {
        let mut w = engine.create(path).await.unwrap();
        w.write_all(data).await.unwrap();
        w.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_conformance_suite() {
        let tmp = tempdir().unwrap();
        let engine = LocalEngine::new(tmp.path()).await.unwrap();
        crate::testsuite::storage_engine_suite(&engine).await;
    }

    #[tokio::test]
    async fn test_path_cannot_escape_root() {
        let tmp = tempdir().unwrap();
        let engine = LocalEngine::new(tmp.path().join("root")).await.unwrap();
        write_file(&engine, "../../escape.txt", b"x").await;
        // The cleaned path lands inside the root.
        assert!(tmp.path().join("root/escape.txt").exists());
    }

    #[tokio::test]
    async fn test_hasher_known_digests() {
        let tmp = tempdir().unwrap();
        let engine = LocalEngine::new(tmp.path()).await.unwrap();
        write_file(&engine, "h.txt", b"hello world").await;

        let hasher = engine.as_hasher().unwrap();
        assert_eq!(
            hasher.hash("h.txt", "sha256").await.unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            hasher.hash("h.txt", "md5").await.unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        let err = hasher.hash("h.txt", "crc32").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_stream_get_put() {
        let tmp = tempdir().unwrap();
        let engine = LocalEngine::new(tmp.path()).await.unwrap();

        let mut src: &[u8] = b"streamed bytes";
        let written = engine
            .as_stream_writer()
            .unwrap()
            .put("s.txt", &mut src)
            .await
            .unwrap();
        assert_eq!(written, 14);

        let mut stream = engine.as_stream_reader().unwrap().get("s.txt").await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"streamed bytes");
    }

    #[tokio::test]
    async fn test_copy_directory_recursive() {
        let tmp = tempdir().unwrap();
        let engine = LocalEngine::new(tmp.path()).await.unwrap();
        write_file(&engine, "tree/a.txt", b"a").await;
        write_file(&engine, "tree/sub/b.txt", b"b").await;

        engine.as_copier().unwrap().copy("tree", "tree2").await.unwrap();

        let mut r = engine.open("tree2/sub/b.txt").await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"b");
    }

    #[tokio::test]
    async fn test_append_via_open_file() {
        let tmp = tempdir().unwrap();
        let engine = LocalEngine::new(tmp.path()).await.unwrap();
        write_file(&engine, "a.txt", b"hello").await;

        let mut w = engine
            .open_file("a.txt", OpenFlags::new().write(true).append(true))
            .await
            .unwrap();
        w.write_all(b" world").await.unwrap();
        w.shutdown().await.unwrap();

        let mut r = engine.open("a.txt").await.unwrap();
        r.seek(SeekFrom::Start(6)).await.unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "world");
    }
}
