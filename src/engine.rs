//! The storage contract shared by every backend.
//!
//! [`StorageEngine`] is the core interface: path-addressed metadata and
//! byte-stream operations over whatever actually holds the bytes. Optional
//! capabilities (streaming, range reads, hashing, copying, signed URLs) are
//! separate traits discovered through probe methods, so a backend never has
//! to stub out surfaces it cannot serve.
//!
//! All operations use `std::io::Result`; failures map onto `io::ErrorKind`
//! so callers' `kind() == ErrorKind::NotFound` checks behave exactly like
//! they do against the ambient filesystem.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

/// Seekable read handle. Close by dropping.
pub trait ReadSeek: AsyncRead + AsyncSeek + Send + Unpin {}
impl<T: AsyncRead + AsyncSeek + Send + Unpin + ?Sized> ReadSeek for T {}

/// Seekable write handle. `AsyncWriteExt::shutdown` is the commit point:
/// until it succeeds, the logical file is unchanged.
pub trait WriteSeek: AsyncWrite + AsyncSeek + Send + Unpin {}
impl<T: AsyncWrite + AsyncSeek + Send + Unpin + ?Sized> WriteSeek for T {}

pub type BoxReader = Box<dyn ReadSeek>;
pub type BoxWriter = Box<dyn WriteSeek>;

/// Plain forward-only byte stream, for backends that cannot seek.
pub type BoxByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Metadata for a file or directory in a storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryInfo {
    pub name: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
    pub path: String,
    /// Unix permission bits where the backend has them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl EntryInfo {
    /// A directory entry with no meaningful size or mode.
    pub fn dir(name: impl Into<String>, path: impl Into<String>, mod_time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            mod_time,
            is_dir: true,
            path: path.into(),
            mode: None,
            metadata: None,
        }
    }

    pub fn file(
        name: impl Into<String>,
        path: impl Into<String>,
        size: u64,
        mod_time: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            mod_time,
            is_dir: false,
            path: path.into(),
            mode: None,
            metadata: None,
        }
    }
}

/// Open mode for [`StorageEngine::open_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub create: bool,
    pub write: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(mut self, v: bool) -> Self {
        self.create = v;
        self
    }

    pub fn write(mut self, v: bool) -> Self {
        self.write = v;
        self
    }

    pub fn truncate(mut self, v: bool) -> Self {
        self.truncate = v;
        self
    }

    pub fn append(mut self, v: bool) -> Self {
        self.append = v;
        self
    }

    /// create + write + truncate, the mode used by [`StorageEngine::create`].
    pub fn create_truncate() -> Self {
        Self::new().create(true).write(true).truncate(true)
    }

    /// create + write + append.
    pub fn create_append() -> Self {
        Self::new().create(true).write(true).append(true)
    }

    pub(crate) fn validate(&self) -> io::Result<()> {
        if !self.write && !self.append {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "open flags must include write or append",
            ));
        }
        if self.append && self.truncate {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "append and truncate cannot be set together",
            ));
        }
        Ok(())
    }
}

/// The unified interface implemented by every storage backend.
///
/// Paths are forward-slash logical paths, normalized by the implementation
/// (see [`crate::paths::clean_path`]); the empty path is the root directory.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Metadata for a file or directory. Missing paths fail with
    /// `ErrorKind::NotFound`.
    async fn stat(&self, path: &str) -> io::Result<EntryInfo>;

    /// Open a file for reading. The handle supports `AsyncSeek`, making it
    /// suitable for range-serving content.
    async fn open(&self, path: &str) -> io::Result<BoxReader>;

    /// Create or overwrite a file for writing.
    async fn create(&self, path: &str) -> io::Result<BoxWriter>;

    /// Open a file for writing with explicit flags (e.g. append).
    async fn open_file(&self, path: &str, flags: OpenFlags) -> io::Result<BoxWriter>;

    /// Delete a file, or a directory and all of its children. Removing a
    /// path that does not exist is not an error.
    async fn remove(&self, path: &str) -> io::Result<()>;

    /// Move or rename a file or directory.
    async fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()>;

    /// Create a directory and all necessary parents.
    async fn mkdir_all(&self, path: &str) -> io::Result<()>;

    /// List the contents of a directory, sorted by name.
    async fn read_dir(&self, path: &str) -> io::Result<Vec<EntryInfo>>;

    // Capability probes. Backends override the ones they serve.

    fn as_stream_reader(&self) -> Option<&dyn StreamReader> {
        None
    }

    fn as_stream_writer(&self) -> Option<&dyn StreamWriter> {
        None
    }

    fn as_range_reader(&self) -> Option<&dyn RangeReader> {
        None
    }

    fn as_hasher(&self) -> Option<&dyn Hasher> {
        None
    }

    fn as_copier(&self) -> Option<&dyn Copier> {
        None
    }

    fn as_url_signer(&self) -> Option<&dyn UrlSigner> {
        None
    }
}

/// Streaming read without seek, suitable for remote backends.
#[async_trait]
pub trait StreamReader: Send + Sync {
    async fn get(&self, path: &str) -> io::Result<BoxByteStream>;
}

/// Streaming write from a reader.
#[async_trait]
pub trait StreamWriter: Send + Sync {
    /// Write the whole stream to `path`, returning the byte count.
    async fn put(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<u64>;
}

/// Read a byte range of a file. `length` of `None` means until end.
#[async_trait]
pub trait RangeReader: Send + Sync {
    async fn get_range(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> io::Result<BoxByteStream>;
}

/// Content hashing. Supported algorithms are backend-dependent; unsupported
/// ones fail with `ErrorKind::Unsupported`.
#[async_trait]
pub trait Hasher: Send + Sync {
    /// Hex digest of the file at `path` under `algorithm`
    /// (`"md5"`, `"sha1"`, `"sha256"`).
    async fn hash(&self, path: &str, algorithm: &str) -> io::Result<String>;
}

/// File copy. Backends implement this server-side or zero-copy where they
/// can.
#[async_trait]
pub trait Copier: Send + Sync {
    async fn copy(&self, src: &str, dst: &str) -> io::Result<()>;
}

/// Temporary access URLs (e.g. presigned object-store GETs).
#[async_trait]
pub trait UrlSigner: Send + Sync {
    async fn signed_url(&self, path: &str, ttl: Duration) -> io::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags_validate() {
        assert!(OpenFlags::create_truncate().validate().is_ok());
        assert!(OpenFlags::create_append().validate().is_ok());
        assert!(OpenFlags::new().validate().is_err());
        assert!(
            OpenFlags::new()
                .write(true)
                .append(true)
                .truncate(true)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_entry_info_wire_names() {
        let info = EntryInfo::file("x.txt", "a/x.txt", 3, DateTime::UNIX_EPOCH);
        let v = serde_json::to_value(&info).unwrap();
        assert!(v.get("modTime").is_some());
        assert!(v.get("isDir").is_some());
        assert!(v.get("mode").is_none());
    }
}
