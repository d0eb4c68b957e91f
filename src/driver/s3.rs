//! S3 remote-backend adapter.
//!
//! Maps the storage contract onto one bucket. Directories are virtual:
//! `read_dir` is a delimiter listing, `mkdir_all` is a no-op, and removing
//! or renaming a directory sweeps the key prefix. `open` downloads the
//! object into an unnamed temp file to give callers a genuinely seekable
//! handle; writers buffer locally and upload on shutdown.

use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite};
use tracing::warn;

use crate::config::Config;
use crate::engine::{
    BoxByteStream, BoxReader, BoxWriter, Copier, EntryInfo, Hasher, OpenFlags, RangeReader,
    StorageEngine, StreamReader, StreamWriter, UrlSigner,
};
use crate::paths::{base_name, clean_path, join_path};

/// Options accepted by the `"s3"` driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct S3Options {
    /// Bucket name; falls back to the config's `basePath`.
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint (MinIO, localstack, ...).
    pub endpoint: Option<String>,
    /// Path-style addressing, required by some S3-compatible services.
    pub force_path_style: bool,
    /// Upload retry attempts beyond the first.
    pub max_retries: u32,
    /// Base delay for exponential upload backoff.
    pub retry_base_delay_ms: u64,
}

impl Default for S3Options {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: None,
            endpoint: None,
            force_path_style: false,
            max_retries: 3,
            retry_base_delay_ms: 100,
        }
    }
}

/// Storage engine over a single S3 bucket.
pub struct S3Engine {
    client: Client,
    bucket: String,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl S3Engine {
    pub async fn new(options: S3Options) -> io::Result<Self> {
        if options.bucket.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "s3 driver requires a bucket",
            ));
        }

        let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(options.force_path_style);
        if let Some(region) = options.region {
            builder = builder.region(Region::new(region));
        }
        if let Some(endpoint) = options.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: options.bucket,
            max_retries: options.max_retries,
            retry_base_delay: Duration::from_millis(options.retry_base_delay_ms),
        })
    }

    pub(crate) async fn from_config(config: &Config) -> io::Result<std::sync::Arc<dyn StorageEngine>> {
        let mut options: S3Options = config.options_as()?;
        if options.bucket.is_empty() {
            options.bucket = config.base_path.clone();
        }
        Ok(std::sync::Arc::new(Self::new(options).await?))
    }

    async fn head(&self, key: &str) -> io::Result<EntryInfo> {
        let out = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_not_found() {
                    io::Error::new(io::ErrorKind::NotFound, key.to_string())
                } else {
                    io::Error::other(service)
                }
            })?;

        Ok(EntryInfo::file(
            base_name(key),
            key.to_string(),
            out.content_length().unwrap_or(0).max(0) as u64,
            convert_time(out.last_modified()),
        ))
    }

    /// Keys under `prefix/`, across list pages.
    async fn list_keys(&self, prefix: &str) -> io::Result<Vec<String>> {
        let full_prefix = format!("{prefix}/");
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = continuation.take() {
                req = req.continuation_token(token);
            }
            let out = req.send().await.map_err(io::Error::other)?;
            for object in out.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match out.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn move_object(&self, from: &str, to: &str) -> io::Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{from}", self.bucket))
            .key(to)
            .send()
            .await
            .map_err(io::Error::other)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(from)
            .send()
            .await
            .map_err(io::Error::other)?;
        Ok(())
    }
}

fn convert_time(t: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    t.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[async_trait]
impl StorageEngine for S3Engine {
    async fn stat(&self, path: &str) -> io::Result<EntryInfo> {
        let key = clean_path(path);
        if key.is_empty() {
            return Ok(EntryInfo::dir("/", key, DateTime::UNIX_EPOCH));
        }

        match self.head(&key).await {
            Ok(info) => Ok(info),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Any object below the key makes it a virtual directory.
                if self.list_keys(&key).await?.is_empty() {
                    Err(e)
                } else {
                    Ok(EntryInfo::dir(base_name(&key), key.clone(), DateTime::UNIX_EPOCH))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn open(&self, path: &str) -> io::Result<BoxReader> {
        let key = clean_path(path);
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    io::Error::new(io::ErrorKind::NotFound, key.clone())
                } else {
                    io::Error::other(service)
                }
            })?;

        // Objects are not seekable; spool into an unnamed temp file that
        // vanishes when the handle drops.
        let tmp = tempfile::tempfile()?;
        let mut file = tokio::fs::File::from_std(tmp);
        let mut body = out.body.into_async_read();
        tokio::io::copy(&mut body, &mut file).await?;
        file.seek(SeekFrom::Start(0)).await?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> io::Result<BoxWriter> {
        self.open_file(path, OpenFlags::create_truncate()).await
    }

    async fn open_file(&self, path: &str, flags: OpenFlags) -> io::Result<BoxWriter> {
        flags.validate()?;
        let key = clean_path(path);

        // Appends have no server-side form; start from the current bytes.
        let mut buf = Vec::new();
        if flags.append
            && let Ok(mut reader) = self.open(&key).await
        {
            reader.read_to_end(&mut buf).await?;
        }
        let pos = buf.len();

        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            buf,
            pos,
            max_retries: self.max_retries,
            retry_base_delay: self.retry_base_delay,
            commit: None,
            closed: false,
        }))
    }

    async fn remove(&self, path: &str) -> io::Result<()> {
        let key = clean_path(path);
        if key.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "remove root"));
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(io::Error::other)?;
        for sub in self.list_keys(&key).await? {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&sub)
                .send()
                .await
                .map_err(io::Error::other)?;
        }
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()> {
        let old = clean_path(old_path);
        let new = clean_path(new_path);

        if self.head(&old).await.is_ok() {
            return self.move_object(&old, &new).await;
        }

        let subs = self.list_keys(&old).await?;
        if subs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, old));
        }
        for key in subs {
            let target = format!("{new}{}", &key[old.len()..]);
            self.move_object(&key, &target).await?;
        }
        Ok(())
    }

    /// Directories are implied by object keys; nothing to create.
    async fn mkdir_all(&self, _path: &str) -> io::Result<()> {
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> io::Result<Vec<EntryInfo>> {
        let dir = clean_path(path);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };

        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/");
            if let Some(token) = continuation.take() {
                req = req.continuation_token(token);
            }
            let out = req.send().await.map_err(io::Error::other)?;

            for common in out.common_prefixes() {
                let Some(sub) = common.prefix() else { continue };
                let name = sub
                    .trim_end_matches('/')
                    .trim_start_matches(&prefix)
                    .to_string();
                if !name.is_empty() {
                    entries.push(EntryInfo::dir(
                        name.clone(),
                        join_path(&dir, &name),
                        DateTime::UNIX_EPOCH,
                    ));
                }
            }
            for object in out.contents() {
                let Some(key) = object.key() else { continue };
                let name = key.trim_start_matches(&prefix).to_string();
                if name.is_empty() || name.contains('/') {
                    continue;
                }
                entries.push(EntryInfo::file(
                    name.clone(),
                    join_path(&dir, &name),
                    object.size().unwrap_or(0).max(0) as u64,
                    convert_time(object.last_modified()),
                ));
            }

            match out.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
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

    fn as_range_reader(&self) -> Option<&dyn RangeReader> {
        Some(self)
    }

    fn as_hasher(&self) -> Option<&dyn Hasher> {
        Some(self)
    }

    fn as_copier(&self) -> Option<&dyn Copier> {
        Some(self)
    }

    fn as_url_signer(&self) -> Option<&dyn UrlSigner> {
        Some(self)
    }
}

#[async_trait]
impl StreamReader for S3Engine {
    async fn get(&self, path: &str) -> io::Result<BoxByteStream> {
        let key = clean_path(path);
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    io::Error::new(io::ErrorKind::NotFound, key.clone())
                } else {
                    io::Error::other(service)
                }
            })?;
        Ok(Box::new(out.body.into_async_read()))
    }
}

#[async_trait]
impl StreamWriter for S3Engine {
    async fn put(
        &self,
        path: &str,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> io::Result<u64> {
        let key = clean_path(path);
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let len = data.len() as u64;
        upload_with_retries(
            &self.client,
            &self.bucket,
            &key,
            data,
            self.max_retries,
            self.retry_base_delay,
        )
        .await?;
        Ok(len)
    }
}

#[async_trait]
impl RangeReader for S3Engine {
    async fn get_range(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> io::Result<BoxByteStream> {
        let key = clean_path(path);
        let range = match length {
            Some(len) if len > 0 => format!("bytes={offset}-{}", offset + len - 1),
            Some(_) => format!("bytes={offset}-{offset}"),
            None => format!("bytes={offset}-"),
        };
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .range(range)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    io::Error::new(io::ErrorKind::NotFound, key.clone())
                } else {
                    io::Error::other(service)
                }
            })?;
        Ok(Box::new(out.body.into_async_read()))
    }
}

#[async_trait]
impl Hasher for S3Engine {
    /// A clean single-part ETag is the object's md5; multipart uploads get
    /// a composite tag S3 cannot translate, reported as unsupported.
    async fn hash(&self, path: &str, algorithm: &str) -> io::Result<String> {
        if algorithm != "md5" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("s3 backend only reports md5, not {algorithm}"),
            ));
        }
        let key = clean_path(path);
        let out = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_not_found() {
                    io::Error::new(io::ErrorKind::NotFound, key.clone())
                } else {
                    io::Error::other(service)
                }
            })?;

        let etag = out.e_tag().unwrap_or("").trim_matches('"').to_string();
        if etag.is_empty() || etag.contains('-') {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "object has no usable md5 etag",
            ));
        }
        Ok(etag)
    }
}

#[async_trait]
impl Copier for S3Engine {
    /// Server-side copy; bytes never transit the client.
    async fn copy(&self, src: &str, dst: &str) -> io::Result<()> {
        let src_key = clean_path(src);
        let dst_key = clean_path(dst);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{src_key}", self.bucket))
            .key(&dst_key)
            .send()
            .await
            .map_err(io::Error::other)?;
        Ok(())
    }
}

#[async_trait]
impl UrlSigner for S3Engine {
    async fn signed_url(&self, path: &str, ttl: Duration) -> io::Result<String> {
        let key = clean_path(path);
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(config)
            .await
            .map_err(io::Error::other)?;
        Ok(presigned.uri().to_string())
    }
}

async fn upload_with_retries(
    client: &Client,
    bucket: &str,
    key: &str,
    data: Vec<u8>,
    max_retries: u32,
    base_delay: Duration,
) -> io::Result<()> {
    let mut attempt = 0u32;
    loop {
        let body = ByteStream::from(data.clone());
        match client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    return Err(io::Error::other(e));
                }
                let delay = base_delay * 2u32.saturating_pow(attempt - 1);
                warn!(key, attempt, ?delay, "s3 upload failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Buffered writer that uploads the whole object on shutdown.
struct S3Writer {
    client: Client,
    bucket: String,
    key: String,
    buf: Vec<u8>,
    pos: usize,
    max_retries: u32,
    retry_base_delay: Duration,
    commit: Option<BoxFuture<'static, io::Result<()>>>,
    closed: bool,
}

impl AsyncWrite for S3Writer {
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
            let client = this.client.clone();
            let bucket = this.bucket.clone();
            let key = this.key.clone();
            let data = std::mem::take(&mut this.buf);
            let max_retries = this.max_retries;
            let base_delay = this.retry_base_delay;
            this.commit = Some(Box::pin(async move {
                upload_with_retries(&client, &bucket, &key, data, max_retries, base_delay).await
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

impl AsyncSeek for S3Writer {
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
