//! shardfs — a storage abstraction layer with a content-addressed sharded
//! engine at its core.
//!
//! Every backend implements the same [`StorageEngine`] contract (stat,
//! seekable open, create, append, remove, rename, mkdir, readdir) plus
//! whatever optional capabilities it can serve, discovered through probe
//! methods rather than erroring stubs.
//!
//! # Drivers
//!
//! - `local`   — pass-through onto a host directory
//! - `sharded` — files split into fixed-size chunks, stored once per unique
//!   SHA-256 in a shard pool that can be shared across tenants
//! - `s3`      — remote adapter over one S3 bucket
//!
//! # Quick start
//!
//! ```no_run
//! use shardfs::{Config, registry};
//!
//! # async fn demo() -> std::io::Result<()> {
//! let engine = registry::open(
//!     &Config::new("sharded")
//!         .with_base_path("./data")
//!         .with_option("chunkSize", 4 * 1024 * 1024),
//! )
//! .await?;
//!
//! use tokio::io::AsyncWriteExt;
//! let mut file = engine.create("backups/notes.txt").await?;
//! file.write_all(b"hello world").await?;
//! file.shutdown().await?; // commit
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod engine;
pub mod paths;
pub mod registry;
pub mod testsuite;
pub mod walk;

pub use crate::config::{Config, ConfigError};
pub use crate::engine::{
    BoxByteStream, BoxReader, BoxWriter, Copier, EntryInfo, Hasher, OpenFlags, RangeReader,
    ReadSeek, StorageEngine, StreamReader, StreamWriter, UrlSigner, WriteSeek,
};
pub use crate::paths::{clean_path, hash_path, hash_path_with_ext};
pub use crate::registry::Registry;
pub use crate::walk::{WalkControl, walk};

pub use crate::driver::local::LocalEngine;
pub use crate::driver::memory::MemEngine;
pub use crate::driver::s3::{S3Engine, S3Options};
pub use crate::driver::sharded::{
    DEFAULT_CHUNK_SIZE, Manifest, ShardedEngine, ShardedOptions,
};
