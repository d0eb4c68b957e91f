//! Content-addressed sharded storage engine.
//!
//! Layers two byte filesystems: a manifest store that mirrors the logical
//! namespace (one small JSON descriptor per file, one real directory per
//! logical directory) and a flat shard store holding the bulk bytes at
//! paths derived from their SHA-256. Identical chunks anywhere in any file
//! occupy a single shard, so the shard store can be shared across many
//! manifest stores for cross-tenant dedup.
//!
//! Deleting or renaming a logical file touches only its manifest; shards
//! are never deleted here. Orphan cleanup belongs to an external scan that
//! can see every manifest store referencing the pool.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use dashmap::DashSet;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::Config;
use crate::driver::local::LocalEngine;
use crate::engine::{
    BoxReader, BoxWriter, Copier, EntryInfo, Hasher, OpenFlags, StorageEngine,
};
use crate::paths::{base_name, clean_path, join_path};

pub mod manifest;
mod pool;
mod reader;
mod writer;

pub use manifest::Manifest;

use pool::BufferPool;
use reader::ShardedReader;
use writer::ShardedWriter;

/// Default chunk size (4 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Options accepted by the `"sharded"` driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShardedOptions {
    pub chunk_size: u64,
    /// Override for the manifest store root; defaults to
    /// `<basePath>/manifest`.
    pub manifest_dir: Option<String>,
    /// Override for the shard store root; defaults to `<basePath>/shards`.
    pub shards_dir: Option<String>,
}

impl Default for ShardedOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            manifest_dir: None,
            shards_dir: None,
        }
    }
}

/// State shared between the engine facade and its readers and writers.
pub(crate) struct Shared {
    pub(crate) manifests: Arc<dyn StorageEngine>,
    pub(crate) shards: Arc<dyn StorageEngine>,
    pub(crate) chunk_size: u64,
    pub(crate) pool: BufferPool,
    /// Shard fan-out directories already created this process.
    pub(crate) shard_dirs: DashSet<String>,
}

/// Manifest file path mirroring a clean logical path.
pub(crate) fn manifest_path_for(clean: &str) -> String {
    if clean.is_empty() {
        "manifests".to_string()
    } else {
        format!("manifests/{clean}.json")
    }
}

/// Mirror directory path for a clean logical path.
pub(crate) fn manifest_dir_for(clean: &str) -> String {
    if clean.is_empty() {
        "manifests".to_string()
    } else {
        format!("manifests/{clean}")
    }
}

/// The sharded engine. Cheap to clone handles are not needed; readers and
/// writers keep the shared state alive on their own.
pub struct ShardedEngine {
    shared: Arc<Shared>,
}

impl ShardedEngine {
    /// Build an engine over a manifest store and a shard store. The stores
    /// may live on the same filesystem or on different ones; pointing many
    /// engines at one shard store is what enables cross-tenant dedup.
    ///
    /// A `chunk_size` of zero selects [`DEFAULT_CHUNK_SIZE`].
    pub fn new(
        manifests: Arc<dyn StorageEngine>,
        shards: Arc<dyn StorageEngine>,
        chunk_size: u64,
    ) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            shared: Arc::new(Shared {
                manifests,
                shards,
                chunk_size,
                pool: BufferPool::new(chunk_size as usize),
                shard_dirs: DashSet::new(),
            }),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.shared.chunk_size
    }

    /// Factory for the `"sharded"` driver: local stores under
    /// `basePath/manifest` and `basePath/shards` unless overridden.
    pub(crate) async fn from_config(config: &Config) -> io::Result<Arc<dyn StorageEngine>> {
        let opts: ShardedOptions = config.options_as()?;
        let base = if config.base_path.is_empty() {
            "./data".to_string()
        } else {
            config.base_path.clone()
        };
        let manifest_dir = opts
            .manifest_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&base).join("manifest"));
        let shards_dir = opts
            .shards_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&base).join("shards"));

        let manifests = LocalEngine::new(manifest_dir).await?;
        let shards = LocalEngine::new(shards_dir).await?;
        Ok(Arc::new(Self::new(
            Arc::new(manifests),
            Arc::new(shards),
            opts.chunk_size,
        )))
    }

    async fn read_manifest_bytes(&self, manifest_path: &str) -> io::Result<Vec<u8>> {
        let mut r = self.shared.manifests.open(manifest_path).await?;
        let mut data = Vec::new();
        r.read_to_end(&mut data).await?;
        Ok(data)
    }

    async fn read_manifest(&self, manifest_path: &str) -> io::Result<Manifest> {
        let data = self.read_manifest_bytes(manifest_path).await?;
        Manifest::decode(&data)
    }

    async fn manifest_exists(&self, manifest_path: &str) -> bool {
        self.shared.manifests.stat(manifest_path).await.is_ok()
    }
}

#[async_trait]
impl StorageEngine for ShardedEngine {
    async fn stat(&self, path: &str) -> io::Result<EntryInfo> {
        let clean = clean_path(path);
        if clean.is_empty() {
            return Ok(EntryInfo::dir("/", clean, DateTime::UNIX_EPOCH));
        }

        // A manifest at the mirrored path means a logical file.
        let name = base_name(&clean).to_string();
        let manifest_path = manifest_path_for(&clean);
        if let Ok(data) = self.read_manifest_bytes(&manifest_path).await {
            let m = Manifest::decode(&data)?;
            return Ok(EntryInfo::file(name, clean, m.size, m.mod_time));
        }

        // Otherwise a mirror directory means a logical directory.
        let dir_path = manifest_dir_for(&clean);
        if let Ok(info) = self.shared.manifests.stat(&dir_path).await
            && info.is_dir
        {
            return Ok(EntryInfo::dir(name, clean, info.mod_time));
        }

        Err(io::Error::new(io::ErrorKind::NotFound, clean))
    }

    async fn open(&self, path: &str) -> io::Result<BoxReader> {
        let manifest_path = manifest_path_for(&clean_path(path));
        let manifest = self.read_manifest(&manifest_path).await?;
        Ok(Box::new(ShardedReader::new(
            Arc::clone(&self.shared),
            manifest,
        )))
    }

    async fn create(&self, path: &str) -> io::Result<BoxWriter> {
        self.open_file(path, OpenFlags::create_truncate()).await
    }

    async fn open_file(&self, path: &str, flags: OpenFlags) -> io::Result<BoxWriter> {
        flags.validate()?;
        let clean = clean_path(path);
        let manifest_path = manifest_path_for(&clean);
        let mut writer = ShardedWriter::new(Arc::clone(&self.shared), clean);

        let exists = self.manifest_exists(&manifest_path).await;
        if exists && flags.append && !flags.truncate {
            // Extend from the prior manifest; an unreadable one starts the
            // writer empty, same as overwrite.
            if let Ok(manifest) = self.read_manifest(&manifest_path).await {
                writer.load_existing(&manifest);
            }
        } else if flags.create
            && let Some((dir, _)) = manifest_path.rsplit_once('/')
        {
            self.shared.manifests.mkdir_all(dir).await?;
        }

        Ok(Box::new(writer))
    }

    async fn remove(&self, path: &str) -> io::Result<()> {
        let clean = clean_path(path);
        let manifest_path = manifest_path_for(&clean);
        if self.manifest_exists(&manifest_path).await {
            // Only the manifest goes away. Shards are content-addressed and
            // possibly shared; orphan cleanup is an external job.
            return self.shared.manifests.remove(&manifest_path).await;
        }
        self.shared.manifests.remove(&manifest_dir_for(&clean)).await
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()> {
        let old_clean = clean_path(old_path);
        let new_clean = clean_path(new_path);

        let old_manifest = manifest_path_for(&old_clean);
        if self.manifest_exists(&old_manifest).await {
            let new_manifest = manifest_path_for(&new_clean);
            if let Some((dir, _)) = new_manifest.rsplit_once('/') {
                self.shared.manifests.mkdir_all(dir).await?;
            }
            return self.shared.manifests.rename(&old_manifest, &new_manifest).await;
        }

        let new_dir = manifest_dir_for(&new_clean);
        if let Some((dir, _)) = new_dir.rsplit_once('/') {
            self.shared.manifests.mkdir_all(dir).await?;
        }
        self.shared
            .manifests
            .rename(&manifest_dir_for(&old_clean), &new_dir)
            .await
    }

    async fn mkdir_all(&self, path: &str) -> io::Result<()> {
        self.shared
            .manifests
            .mkdir_all(&manifest_dir_for(&clean_path(path)))
            .await
    }

    async fn read_dir(&self, path: &str) -> io::Result<Vec<EntryInfo>> {
        let clean = clean_path(path);
        let dir_path = manifest_dir_for(&clean);

        let entries = match self.shared.manifests.read_dir(&dir_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if clean.is_empty() {
                    return Ok(Vec::new());
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let mut result = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.is_dir {
                result.push(EntryInfo::dir(
                    entry.name.clone(),
                    join_path(&clean, &entry.name),
                    entry.mod_time,
                ));
                continue;
            }
            // Only descriptor files are part of the logical namespace.
            let Some(logical_name) = entry.name.strip_suffix(".json") else {
                continue;
            };
            // An unreadable descriptor still lists, with empty metadata.
            let (size, mod_time) = match self
                .read_manifest(&join_path(&dir_path, &entry.name))
                .await
            {
                Ok(m) => (m.size, m.mod_time),
                Err(_) => (0, DateTime::UNIX_EPOCH),
            };
            result.push(EntryInfo::file(
                logical_name,
                join_path(&clean, logical_name),
                size,
                mod_time,
            ));
        }
        Ok(result)
    }

    fn as_copier(&self) -> Option<&dyn Copier> {
        Some(self)
    }

    fn as_hasher(&self) -> Option<&dyn Hasher> {
        Some(self)
    }
}

#[async_trait]
impl Copier for ShardedEngine {
    /// Duplicate only the manifest. The shards are already shared, so this
    /// is a zero-byte copy regardless of file size.
    async fn copy(&self, src: &str, dst: &str) -> io::Result<()> {
        let data = self
            .read_manifest_bytes(&manifest_path_for(&clean_path(src)))
            .await?;

        let dst_manifest = manifest_path_for(&clean_path(dst));
        if let Some((dir, _)) = dst_manifest.rsplit_once('/') {
            self.shared.manifests.mkdir_all(dir).await?;
        }
        let mut w = self.shared.manifests.create(&dst_manifest).await?;
        w.write_all(&data).await?;
        w.shutdown().await
    }
}

#[async_trait]
impl Hasher for ShardedEngine {
    async fn hash(&self, path: &str, algorithm: &str) -> io::Result<String> {
        if algorithm != "sha256" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("sharded engine only hashes sha256, not {algorithm}"),
            ));
        }
        let mut r = self.open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        loop {
            let n = r.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemEngine;
    use crate::walk::{WalkControl, walk};
    use std::io::SeekFrom;
    use tokio::io::AsyncSeekExt;

    /// Engine over fresh in-memory stores; the returned stores stay
    /// observable for shard counting and raw manifest access.
    fn new_test_engine(chunk_size: u64) -> (ShardedEngine, MemEngine, MemEngine) {
        let manifests = MemEngine::new();
        let shards = MemEngine::new();
        let engine = ShardedEngine::new(
            Arc::new(manifests.clone()),
            Arc::new(shards.clone()),
            chunk_size,
        );
        (engine, manifests, shards)
    }

    async fn write_file(engine: &ShardedEngine, path: &str, data: &[u8]) {
        let mut w = engine.create(path).await.unwrap();
        w.write_all(data).await.unwrap();
        w.shutdown().await.unwrap();
    }

    async fn read_file(engine: &ShardedEngine, path: &str) -> Vec<u8> {
        let mut r = engine.open(path).await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        out
    }

    async fn manifest_of(store: &MemEngine, logical: &str) -> Manifest {
        let mut r = store
            .open(&manifest_path_for(&clean_path(logical)))
            .await
            .unwrap();
        let mut data = Vec::new();
        r.read_to_end(&mut data).await.unwrap();
        Manifest::decode(&data).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_hello_world_round_trip() {
        let (engine, _, shards) = new_test_engine(DEFAULT_CHUNK_SIZE);
        write_file(&engine, "/test.txt", b"hello world").await;

        let info = engine.stat("/test.txt").await.unwrap();
        assert_eq!(info.size, 11);
        assert!(!info.is_dir);
        assert_eq!(info.name, "test.txt");

        assert_eq!(read_file(&engine, "/test.txt").await, b"hello world");

        let mut r = engine.open("/test.txt").await.unwrap();
        r.seek(SeekFrom::Start(6)).await.unwrap();
        let mut tail = Vec::new();
        r.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, b"world");

        assert_eq!(shards.file_count().await, 1);
    }

    #[tokio::test]
    async fn test_chunk_layout_of_multi_chunk_file() {
        let (engine, manifests, shards) = new_test_engine(DEFAULT_CHUNK_SIZE);
        let data: Vec<u8> = (0..5 * 1024 * 1024usize).map(|i| (i % 256) as u8).collect();
        write_file(&engine, "/a/b.txt", &data).await;

        let m = manifest_of(&manifests, "/a/b.txt").await;
        assert_eq!(m.chunks.len(), 2);
        assert_eq!(m.chunk_sizes, vec![4_194_304, 1_048_576]);
        assert_eq!(m.size, 5_242_880);
        assert_eq!(shards.file_count().await, 2);

        assert_eq!(read_file(&engine, "/a/b.txt").await, data);
    }

    #[tokio::test]
    async fn test_round_trip_boundary_sizes() {
        const CS: u64 = 4096;
        for len in [
            0usize,
            1,
            CS as usize - 1,
            CS as usize,
            CS as usize + 1,
            3 * CS as usize + 17,
        ] {
            let (engine, _, shards) = new_test_engine(CS);
            let data = pattern(len);
            write_file(&engine, "f.bin", &data).await;

            assert_eq!(engine.stat("f.bin").await.unwrap().size, len as u64);
            assert_eq!(read_file(&engine, "f.bin").await, data, "len={len}");
            assert_eq!(
                shards.file_count().await,
                len.div_ceil(CS as usize),
                "len={len}"
            );
        }
    }

    #[tokio::test]
    async fn test_seek_everywhere() {
        const CS: u64 = 4096;
        let (engine, _, _) = new_test_engine(CS);
        let data = pattern(3 * CS as usize + 17);
        write_file(&engine, "f.bin", &data).await;

        for offset in [
            0u64,
            1,
            CS - 1,
            CS,
            CS + 1,
            2 * CS,
            3 * CS + 16,
            3 * CS + 17,
        ] {
            let mut r = engine.open("f.bin").await.unwrap();
            r.seek(SeekFrom::Start(offset)).await.unwrap();
            let mut rest = Vec::new();
            r.read_to_end(&mut rest).await.unwrap();
            assert_eq!(rest, data[offset as usize..], "offset={offset}");
        }
    }

    #[tokio::test]
    async fn test_dedup_across_manifest_stores() {
        let shards = MemEngine::new();
        let engine_a = ShardedEngine::new(
            Arc::new(MemEngine::new()),
            Arc::new(shards.clone()),
            DEFAULT_CHUNK_SIZE,
        );
        let engine_b = ShardedEngine::new(
            Arc::new(MemEngine::new()),
            Arc::new(shards.clone()),
            DEFAULT_CHUNK_SIZE,
        );

        let content = b"this is shared content that should be deduplicated";
        write_file(&engine_a, "/test.txt", content).await;
        write_file(&engine_b, "/test.txt", content).await;
        assert_eq!(shards.file_count().await, 1);

        // A's delete removes only A's manifest; B still reads the shard.
        engine_a.remove("/test.txt").await.unwrap();
        assert_eq!(
            engine_a.stat("/test.txt").await.unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        assert_eq!(read_file(&engine_b, "/test.txt").await, content);
        assert_eq!(shards.file_count().await, 1);
    }

    #[tokio::test]
    async fn test_idempotent_shard_writes() {
        let (engine, _, shards) = new_test_engine(DEFAULT_CHUNK_SIZE);
        write_file(&engine, "one.txt", b"same bytes").await;
        write_file(&engine, "two.txt", b"same bytes").await;
        write_file(&engine, "one.txt", b"same bytes").await;
        assert_eq!(shards.file_count().await, 1);
    }

    #[tokio::test]
    async fn test_append_extends_with_fresh_chunk() {
        let (engine, manifests, _) = new_test_engine(DEFAULT_CHUNK_SIZE);
        write_file(&engine, "/x.txt", b"hello").await;

        let mut w = engine
            .open_file("/x.txt", OpenFlags::create_append())
            .await
            .unwrap();
        w.write_all(b" world").await.unwrap();
        w.shutdown().await.unwrap();

        assert_eq!(read_file(&engine, "/x.txt").await, b"hello world");
        assert_eq!(engine.stat("/x.txt").await.unwrap().size, 11);

        // The prior tail chunk is kept; appended bytes start a new chunk.
        let m = manifest_of(&manifests, "/x.txt").await;
        assert_eq!(m.chunk_sizes, vec![5, 6]);
    }

    #[tokio::test]
    async fn test_append_matches_single_write() {
        const CS: u64 = 64;
        let all = pattern(200);
        let (split_engine, _, _) = new_test_engine(CS);
        write_file(&split_engine, "f.bin", &all[..90]).await;
        let mut w = split_engine
            .open_file("f.bin", OpenFlags::create_append())
            .await
            .unwrap();
        w.write_all(&all[90..]).await.unwrap();
        w.shutdown().await.unwrap();

        let (whole_engine, _, _) = new_test_engine(CS);
        write_file(&whole_engine, "f.bin", &all).await;

        assert_eq!(
            read_file(&split_engine, "f.bin").await,
            read_file(&whole_engine, "f.bin").await
        );
    }

    #[tokio::test]
    async fn test_legacy_manifest_without_chunk_sizes() {
        const CS: u64 = 4;
        let (engine, manifests, _) = new_test_engine(CS);
        let data = b"abcdefghij";
        write_file(&engine, "legacy.bin", data).await;

        // Rewrite the manifest in the pre-variable-size form.
        let mut m = manifest_of(&manifests, "legacy.bin").await;
        assert_eq!(m.chunk_sizes, vec![4, 4, 2]);
        m.chunk_sizes = Vec::new();
        let mut w = manifests
            .create(&manifest_path_for("legacy.bin"))
            .await
            .unwrap();
        w.write_all(&m.encode().unwrap()).await.unwrap();
        w.shutdown().await.unwrap();

        assert_eq!(read_file(&engine, "legacy.bin").await, data);

        let mut r = engine.open("legacy.bin").await.unwrap();
        r.seek(SeekFrom::Start(5)).await.unwrap();
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, &data[5..]);
    }

    #[tokio::test]
    async fn test_legacy_append_synthesizes_sizes() {
        const CS: u64 = 4;
        let (engine, manifests, _) = new_test_engine(CS);
        write_file(&engine, "legacy.bin", b"abcdefghij").await;

        let mut m = manifest_of(&manifests, "legacy.bin").await;
        m.chunk_sizes = Vec::new();
        let mut w = manifests
            .create(&manifest_path_for("legacy.bin"))
            .await
            .unwrap();
        w.write_all(&m.encode().unwrap()).await.unwrap();
        w.shutdown().await.unwrap();

        let mut w = engine
            .open_file("legacy.bin", OpenFlags::create_append())
            .await
            .unwrap();
        w.write_all(b"kl").await.unwrap();
        w.shutdown().await.unwrap();

        assert_eq!(read_file(&engine, "legacy.bin").await, b"abcdefghijkl");
        let m = manifest_of(&manifests, "legacy.bin").await;
        assert_eq!(m.chunk_sizes, vec![4, 4, 2, 2]);
    }

    #[tokio::test]
    async fn test_walk_tree() {
        let (engine, _, _) = new_test_engine(DEFAULT_CHUNK_SIZE);
        write_file(&engine, "/walk/f1.txt", b"1").await;
        write_file(&engine, "/walk/sub/f2.txt", b"2").await;

        let mut files = Vec::new();
        walk(&engine, "/walk", &mut |info| {
            if !info.is_dir {
                files.push(info.path.clone());
            }
            WalkControl::Continue
        })
        .await
        .unwrap();
        files.sort();
        assert_eq!(
            files,
            vec!["walk/f1.txt".to_string(), "walk/sub/f2.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn test_copy_is_manifest_only() {
        let (engine, _, shards) = new_test_engine(DEFAULT_CHUNK_SIZE);
        write_file(&engine, "/copy_src.txt", b"copy me").await;
        let shard_count = shards.file_count().await;

        engine
            .as_copier()
            .unwrap()
            .copy("/copy_src.txt", "/copy_dst.txt")
            .await
            .unwrap();

        assert_eq!(read_file(&engine, "/copy_dst.txt").await, b"copy me");
        assert_eq!(shards.file_count().await, shard_count);
    }

    #[tokio::test]
    async fn test_hash_extension() {
        const CS: u64 = 8;
        let (engine, _, _) = new_test_engine(CS);
        let data = pattern(50);
        write_file(&engine, "h.bin", &data).await;

        let expected = hex::encode(Sha256::digest(&data));
        let hasher = engine.as_hasher().unwrap();
        assert_eq!(hasher.hash("h.bin", "sha256").await.unwrap(), expected);

        let err = hasher.hash("h.bin", "md5").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_remove_file_keeps_mirror_dir() {
        let (engine, _, shards) = new_test_engine(DEFAULT_CHUNK_SIZE);
        write_file(&engine, "a/b.txt", b"data").await;

        engine.remove("a/b.txt").await.unwrap();
        assert_eq!(
            engine.stat("a/b.txt").await.unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        assert!(engine.stat("a").await.unwrap().is_dir);
        // Shards stay for other referents.
        assert_eq!(shards.file_count().await, 1);

        engine.remove("a").await.unwrap();
        assert_eq!(
            engine.stat("a").await.unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_rename_file_and_directory() {
        let (engine, _, _) = new_test_engine(DEFAULT_CHUNK_SIZE);
        write_file(&engine, "dir/f.txt", b"f").await;

        engine.rename("dir/f.txt", "other/g.txt").await.unwrap();
        assert_eq!(read_file(&engine, "other/g.txt").await, b"f");
        assert_eq!(
            engine.stat("dir/f.txt").await.unwrap_err().kind(),
            io::ErrorKind::NotFound
        );

        engine.rename("other", "moved").await.unwrap();
        assert_eq!(read_file(&engine, "moved/g.txt").await, b"f");
    }

    #[tokio::test]
    async fn test_read_dir_lists_logical_names() {
        let (engine, manifests, _) = new_test_engine(DEFAULT_CHUNK_SIZE);
        engine.mkdir_all("dir/sub").await.unwrap();
        write_file(&engine, "dir/a.txt", b"aaaa").await;
        write_file(&engine, "dir/b.txt", b"bb").await;

        // A stray non-descriptor file in the mirror must not surface.
        let mut w = manifests.create("manifests/dir/stray.tmp").await.unwrap();
        w.write_all(b"x").await.unwrap();
        w.shutdown().await.unwrap();

        let entries = engine.read_dir("dir").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);

        let a = entries.iter().find(|e| e.name == "a.txt").unwrap();
        assert_eq!(a.size, 4);
        assert_eq!(a.path, "dir/a.txt");
        assert!(!a.is_dir);
        assert!(entries.iter().find(|e| e.name == "sub").unwrap().is_dir);
    }

    #[tokio::test]
    async fn test_read_dir_root_and_missing() {
        let (engine, _, _) = new_test_engine(DEFAULT_CHUNK_SIZE);
        assert!(engine.read_dir("/").await.unwrap().is_empty());
        assert_eq!(
            engine.read_dir("missing").await.unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_stat_root_is_directory() {
        let (engine, _, _) = new_test_engine(DEFAULT_CHUNK_SIZE);
        let info = engine.stat("/").await.unwrap();
        assert!(info.is_dir);
        assert_eq!(info.name, "/");
    }

    #[tokio::test]
    async fn test_writer_seek_rules() {
        let (engine, _, _) = new_test_engine(DEFAULT_CHUNK_SIZE);

        let mut w = engine.create("s.txt").await.unwrap();
        assert_eq!(w.seek(SeekFrom::Start(0)).await.unwrap(), 0);
        w.write_all(b"abc").await.unwrap();
        assert_eq!(w.seek(SeekFrom::Start(3)).await.unwrap(), 3);

        let err = w.seek(SeekFrom::Start(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        let err = w.seek(SeekFrom::End(0)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);

        w.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_seek_bounds() {
        let (engine, _, _) = new_test_engine(DEFAULT_CHUNK_SIZE);
        write_file(&engine, "s.txt", b"0123456789").await;

        let mut r = engine.open("s.txt").await.unwrap();
        assert_eq!(r.seek(SeekFrom::End(0)).await.unwrap(), 10);
        assert_eq!(r.seek(SeekFrom::Current(-4)).await.unwrap(), 6);

        let err = r.seek(SeekFrom::Start(11)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = r.seek(SeekFrom::Current(-100)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_fails_truncated() {
        let (engine, manifests, _) = new_test_engine(DEFAULT_CHUNK_SIZE);
        // A manifest claiming bytes it lists no chunks for.
        let bogus = Manifest {
            chunks: Vec::new(),
            chunk_sizes: Vec::new(),
            size: 10,
            mod_time: chrono::Utc::now(),
        };
        manifests.mkdir_all("manifests").await.unwrap();
        let mut w = manifests.create(&manifest_path_for("bad.bin")).await.unwrap();
        w.write_all(&bogus.encode().unwrap()).await.unwrap();
        w.shutdown().await.unwrap();

        let mut r = engine.open("bad.bin").await.unwrap();
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_abandoned_writer_publishes_nothing() {
        let (engine, _, _) = new_test_engine(16);
        let mut w = engine.create("ghost.bin").await.unwrap();
        w.write_all(&pattern(40)).await.unwrap();
        drop(w); // never shut down

        // Orphan shards may exist, but the logical file does not.
        assert_eq!(
            engine.stat("ghost.bin").await.unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_from_config_uses_base_path_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::new("sharded")
            .with_base_path(tmp.path().to_string_lossy())
            .with_option("chunkSize", 8);
        let engine = crate::registry::open(&cfg).await.unwrap();

        let mut w = engine.create("cfg.txt").await.unwrap();
        w.write_all(b"configured bytes").await.unwrap();
        w.shutdown().await.unwrap();

        let mut r = engine.open("cfg.txt").await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"configured bytes");

        assert!(tmp.path().join("manifest/manifests/cfg.txt.json").exists());
        assert!(tmp.path().join("shards").exists());
    }

    #[tokio::test]
    async fn test_conformance_suite() {
        let (engine, _, _) = new_test_engine(DEFAULT_CHUNK_SIZE);
        crate::testsuite::storage_engine_suite(&engine).await;
    }
}
